use {
    super::{CommonThreadInfo, CpuContext, NT_Elf, Pid, Result, copy_u32_registers},
    crate::{
        minidump_cpu::{FloatStateCPU, RawContextCPU},
        minidump_format::format,
    },
    nix::{errno::Errno, sys::ptrace, unistd},
    scroll::Pwrite,
};

const NUM_DEBUG_REGISTERS: usize = 8;

pub struct ThreadInfoX86 {
    pub stack_pointer: usize,
    pub tgid: Pid, // thread group id
    pub ppid: Pid, // parent process
    pub regs: libc::user_regs_struct,
    pub fpregs: libc::user_fpregs_struct,
    pub dregs: [libc::c_ulonglong; NUM_DEBUG_REGISTERS],
}

impl CommonThreadInfo for ThreadInfoX86 {}

impl ThreadInfoX86 {
    fn getfpregs(pid: unistd::Pid) -> Result<libc::user_fpregs_struct> {
        let mut data = std::mem::MaybeUninit::<libc::user_fpregs_struct>::zeroed();
        // SAFETY: PTRACE_GETFPREGS fills exactly one user_fpregs_struct
        let res = unsafe {
            libc::ptrace(
                libc::PTRACE_GETFPREGS,
                libc::pid_t::from(pid),
                std::ptr::null_mut::<libc::c_void>(),
                data.as_mut_ptr(),
            )
        };
        Errno::result(res)?;
        // SAFETY: initialized above
        Ok(unsafe { data.assume_init() })
    }

    /// PTRACE_PEEKUSER returns the word itself, so -1 is only an error if
    /// errno was set
    fn peek_user(pid: unistd::Pid, offset: usize) -> nix::Result<libc::c_long> {
        Errno::clear();
        // SAFETY: reads a word of the target's user area
        let ret = unsafe {
            libc::ptrace(
                libc::PTRACE_PEEKUSER,
                libc::pid_t::from(pid),
                offset as *mut libc::c_void,
                std::ptr::null_mut::<libc::c_void>(),
            )
        };
        match Errno::last() {
            Errno::UnknownErrno => Ok(ret),
            errno if ret == -1 => Err(errno),
            _ => Ok(ret),
        }
    }

    pub fn create_impl(_pid: Pid, tid: Pid) -> Result<Self> {
        let (ppid, tgid) = Self::get_ppid_and_tgid(tid)?;
        let target = unistd::Pid::from_raw(tid);

        let regs = Self::ptrace_get_regset(NT_Elf::NT_PRSTATUS, target)
            .or_else(|_| ptrace::getregs(target))?;
        let fpregs = Self::ptrace_get_regset(NT_Elf::NT_PRFPREGSET, target)
            .or_else(|_| Self::getfpregs(target))?;

        let mut dregs = [0; NUM_DEBUG_REGISTERS];
        let debug_offset = std::mem::offset_of!(libc::user, u_debugreg);
        let elem_size = std::mem::size_of::<libc::c_ulonglong>();
        for (idx, dreg) in dregs.iter_mut().enumerate() {
            *dreg = Self::peek_user(target, debug_offset + idx * elem_size)? as libc::c_ulonglong;
        }

        Ok(Self {
            stack_pointer: regs.rsp as usize,
            tgid,
            ppid,
            regs,
            fpregs,
            dregs,
        })
    }
}

impl CpuContext for ThreadInfoX86 {
    fn get_instruction_pointer(&self) -> usize {
        self.regs.rip as usize
    }

    fn get_stack_pointer(&self) -> usize {
        self.regs.rsp as usize
    }

    fn fill_cpu_context(&self, out: &mut RawContextCPU) {
        out.context_flags = format::ContextFlagsAmd64::CONTEXT_AMD64_FULL.bits()
            | format::ContextFlagsAmd64::CONTEXT_AMD64_SEGMENTS.bits();

        out.cs = self.regs.cs as u16;
        out.ds = self.regs.ds as u16;
        out.es = self.regs.es as u16;
        out.fs = self.regs.fs as u16;
        out.gs = self.regs.gs as u16;
        out.ss = self.regs.ss as u16;
        out.eflags = self.regs.eflags as u32;

        out.dr0 = self.dregs[0];
        out.dr1 = self.dregs[1];
        out.dr2 = self.dregs[2];
        out.dr3 = self.dregs[3];
        // 4 and 5 are aliases of 6 and 7 and have no slot in the context
        out.dr6 = self.dregs[6];
        out.dr7 = self.dregs[7];

        out.rax = self.regs.rax;
        out.rcx = self.regs.rcx;
        out.rdx = self.regs.rdx;
        out.rbx = self.regs.rbx;
        out.rsp = self.regs.rsp;
        out.rbp = self.regs.rbp;
        out.rsi = self.regs.rsi;
        out.rdi = self.regs.rdi;
        out.r8 = self.regs.r8;
        out.r9 = self.regs.r9;
        out.r10 = self.regs.r10;
        out.r11 = self.regs.r11;
        out.r12 = self.regs.r12;
        out.r13 = self.regs.r13;
        out.r14 = self.regs.r14;
        out.r15 = self.regs.r15;
        out.rip = self.regs.rip;

        let fs = &self.fpregs;
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
        copy_u32_registers(&mut float_save.float_registers, &fs.st_space);
        copy_u32_registers(&mut float_save.xmm_registers, &fs.xmm_space);

        out.mx_csr = fs.mxcsr;
        // The save area is exactly the size of an XMM_SAVE_AREA32
        let _ = out
            .float_save
            .pwrite_with(float_save, 0, scroll::Endian::Little);
    }
}
