use {
    super::{CpuContext, CrashContext},
    crate::{
        minidump_cpu::{FloatStateCPU, GP_REG_COUNT, RawContextCPU},
        minidump_format::format,
    },
};

impl CpuContext for CrashContext {
    fn get_instruction_pointer(&self) -> usize {
        self.inner.context.uc_mcontext.pc as usize
    }

    fn get_stack_pointer(&self) -> usize {
        self.inner.context.uc_mcontext.sp as usize
    }

    fn fill_cpu_context(&self, out: &mut RawContextCPU) {
        out.context_flags = format::ContextFlagsArm64Old::CONTEXT_ARM64_FULL_OLD.bits() as u64;

        let mcontext = &self.inner.context.uc_mcontext;
        let mut iregs = [0u64; GP_REG_COUNT + 1];
        iregs[..GP_REG_COUNT].copy_from_slice(&mcontext.regs[..GP_REG_COUNT]);
        iregs[GP_REG_COUNT] = mcontext.sp;

        // The context is packed, fields are only ever assigned whole
        out.cpsr = mcontext.pstate as u32;
        out.iregs = iregs;
        out.pc = mcontext.pc;
        out.float_save = FloatStateCPU {
            fpsr: self.inner.float_state.fpsr,
            fpcr: self.inner.float_state.fpcr,
            regs: self.inner.float_state.vregs,
        };
    }
}
