//! The CPU state captured by the signal handler, and its conversion into the
//! minidump context layout

use crate::minidump_cpu::RawContextCPU;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
    }
}

/// The state of the crashing thread at the time of the signal
///
/// The wrapped struct has a fixed layout, it is what gets copied to the
/// cloned dumper and sent verbatim to an out of process crash server.
#[derive(Clone)]
pub struct CrashContext {
    pub inner: crash_context::CrashContext,
}

impl std::fmt::Debug for CrashContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrashContext")
            .field("signal", &self.inner.siginfo.ssi_signo)
            .field("code", &self.inner.siginfo.ssi_code)
            .field("address", &self.inner.siginfo.ssi_addr)
            .field("pid", &self.inner.pid)
            .field("tid", &self.inner.tid)
            .finish_non_exhaustive()
    }
}

impl From<crash_context::CrashContext> for CrashContext {
    fn from(inner: crash_context::CrashContext) -> Self {
        Self { inner }
    }
}

impl CrashContext {
    /// The signal number, or the dump requested code for explicit dumps
    #[inline]
    pub fn signal(&self) -> u32 {
        self.inner.siginfo.ssi_signo
    }

    #[inline]
    pub fn signal_code(&self) -> i32 {
        self.inner.siginfo.ssi_code
    }

    /// The address that faulted, for the signals that have one
    #[inline]
    pub fn fault_address(&self) -> u64 {
        self.inner.siginfo.ssi_addr
    }

    #[inline]
    pub fn tid(&self) -> super::Pid {
        self.inner.tid
    }
}

/// Conversion of a captured or ptraced register state into the minidump
/// context
pub trait CpuContext {
    fn get_instruction_pointer(&self) -> usize;
    fn get_stack_pointer(&self) -> usize;
    fn fill_cpu_context(&self, out: &mut RawContextCPU);
}
