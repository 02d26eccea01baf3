use {
    super::{CommonThreadInfo, CpuContext, NT_Elf, Pid, Result},
    crate::{
        minidump_cpu::{FP_REG_COUNT, FloatStateCPU, GP_REG_COUNT, RawContextCPU},
        minidump_format::format,
    },
    nix::unistd,
};

/// Index of the stack pointer in the minidump context's `iregs`
const SP_REG_INDEX: usize = 31;

/// The `NT_PRFPREG` register set, which not every libc target defines
#[derive(Debug, Clone, Copy)]
#[repr(C)]
#[allow(non_camel_case_types)]
pub struct user_fpsimd_struct {
    pub vregs: [u128; FP_REG_COUNT],
    pub fpsr: u32,
    pub fpcr: u32,
}

pub struct ThreadInfoAarch64 {
    pub stack_pointer: usize,
    pub tgid: Pid, // thread group id
    pub ppid: Pid, // parent process
    pub regs: libc::user_regs_struct,
    pub fpregs: user_fpsimd_struct,
}

impl CommonThreadInfo for ThreadInfoAarch64 {}

impl ThreadInfoAarch64 {
    pub fn create_impl(_pid: Pid, tid: Pid) -> Result<Self> {
        let (ppid, tgid) = Self::get_ppid_and_tgid(tid)?;
        let target = unistd::Pid::from_raw(tid);

        let regs: libc::user_regs_struct = Self::ptrace_get_regset(NT_Elf::NT_PRSTATUS, target)?;
        let fpregs = Self::ptrace_get_regset(NT_Elf::NT_PRFPREGSET, target)?;

        Ok(Self {
            stack_pointer: regs.sp as usize,
            tgid,
            ppid,
            regs,
            fpregs,
        })
    }
}

impl CpuContext for ThreadInfoAarch64 {
    fn get_instruction_pointer(&self) -> usize {
        self.regs.pc as usize
    }

    fn get_stack_pointer(&self) -> usize {
        self.regs.sp as usize
    }

    fn fill_cpu_context(&self, out: &mut RawContextCPU) {
        out.context_flags = format::ContextFlagsArm64Old::CONTEXT_ARM64_FULL_OLD.bits() as u64;

        // The context is packed, so its arrays are built up front and moved
        // in whole
        let mut iregs = [0u64; GP_REG_COUNT + 1];
        iregs[..GP_REG_COUNT].copy_from_slice(&self.regs.regs[..GP_REG_COUNT]);
        iregs[SP_REG_INDEX] = self.regs.sp;

        out.cpsr = self.regs.pstate as u32;
        out.iregs = iregs;
        out.pc = self.regs.pc;
        out.float_save = FloatStateCPU {
            fpsr: self.fpregs.fpsr,
            fpcr: self.fpregs.fpcr,
            regs: self.fpregs.vregs,
        };
    }
}
