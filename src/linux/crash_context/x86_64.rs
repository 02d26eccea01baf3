use {
    super::{CpuContext, CrashContext},
    crate::{
        minidump_cpu::{FloatStateCPU, RawContextCPU},
        minidump_format::format,
    },
    libc::{
        REG_CSGSFS, REG_EFL, REG_R8, REG_R9, REG_R10, REG_R11, REG_R12, REG_R13, REG_R14, REG_R15,
        REG_RAX, REG_RBP, REG_RBX, REG_RCX, REG_RDI, REG_RDX, REG_RIP, REG_RSI, REG_RSP,
    },
    scroll::Pwrite,
};

impl CpuContext for CrashContext {
    fn get_instruction_pointer(&self) -> usize {
        self.inner.context.uc_mcontext.gregs[REG_RIP as usize] as usize
    }

    fn get_stack_pointer(&self) -> usize {
        self.inner.context.uc_mcontext.gregs[REG_RSP as usize] as usize
    }

    fn fill_cpu_context(&self, out: &mut RawContextCPU) {
        out.context_flags = format::ContextFlagsAmd64::CONTEXT_AMD64_FULL.bits();

        let gregs = &self.inner.context.uc_mcontext.gregs;
        let reg = |idx: libc::c_int| gregs[idx as usize] as u64;

        // cs, gs and fs share a register, the kernel doesn't save the others
        out.cs = (reg(REG_CSGSFS) & 0xffff) as u16;
        out.gs = ((reg(REG_CSGSFS) >> 16) & 0xffff) as u16;
        out.fs = ((reg(REG_CSGSFS) >> 32) & 0xffff) as u16;
        out.eflags = reg(REG_EFL) as u32;

        out.rax = reg(REG_RAX);
        out.rcx = reg(REG_RCX);
        out.rdx = reg(REG_RDX);
        out.rbx = reg(REG_RBX);
        out.rsp = reg(REG_RSP);
        out.rbp = reg(REG_RBP);
        out.rsi = reg(REG_RSI);
        out.rdi = reg(REG_RDI);
        out.r8 = reg(REG_R8);
        out.r9 = reg(REG_R9);
        out.r10 = reg(REG_R10);
        out.r11 = reg(REG_R11);
        out.r12 = reg(REG_R12);
        out.r13 = reg(REG_R13);
        out.r14 = reg(REG_R14);
        out.r15 = reg(REG_R15);
        out.rip = reg(REG_RIP);

        let fs = &self.inner.float_state;
        let mut float_save = FloatStateCPU {
            control_word: fs.cwd,
            status_word: fs.swd,
            tag_word: fs.ftw as u8,
            error_opcode: fs.fop,
            error_offset: fs.rip as u32,
            data_offset: fs.rdp as u32,
            error_selector: 0, // We don't have this.
            data_selector: 0,  // We don't have this.
            mx_csr: fs.mxcsr,
            mx_csr_mask: fs.mxcr_mask,
            ..Default::default()
        };
        pack_registers(&mut float_save.float_registers, &fs.st_space);
        pack_registers(&mut float_save.xmm_registers, &fs.xmm_space);

        out.mx_csr = fs.mxcsr;
        // The save area is exactly the size of an XMM_SAVE_AREA32
        let _ = out
            .float_save
            .pwrite_with(float_save, 0, scroll::Endian::Little);
    }
}

fn pack_registers(dst: &mut [u128], src: &[u32]) {
    for (reg, words) in dst.iter_mut().zip(src.chunks_exact(4)) {
        *reg = words
            .iter()
            .rev()
            .fold(0u128, |acc, word| (acc << 32) | u128::from(*word));
    }
}
