//! Register state of a ptrace-stopped thread

use {
    super::{Pid, crash_context::CpuContext, errors::ThreadInfoError},
    nix::{errno::Errno, unistd},
    procfs_core::{FromRead, process::Status},
};

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86;
        pub type ThreadInfo = x86::ThreadInfoX86;
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub type ThreadInfo = aarch64::ThreadInfoAarch64;
    }
}

type Result<T> = std::result::Result<T, ThreadInfoError>;

/// The note types `PTRACE_GETREGSET` understands
#[derive(Debug, Clone, Copy)]
#[allow(non_camel_case_types, dead_code)]
#[repr(usize)]
enum NT_Elf {
    NT_NONE = 0,
    NT_PRSTATUS = 1,
    NT_PRFPREGSET = 2,
}

/// Packs the 32 bit chunks the kernel stores x87 and SSE registers in into
/// the 128 bit registers of the minidump context
#[cfg(target_arch = "x86_64")]
fn copy_u32_registers(dst: &mut [u128], src: &[u32]) {
    for (reg, words) in dst.iter_mut().zip(src.chunks_exact(4)) {
        *reg = words
            .iter()
            .rev()
            .fold(0u128, |acc, word| (acc << 32) | u128::from(*word));
    }
}

trait CommonThreadInfo {
    fn get_ppid_and_tgid(tid: Pid) -> Result<(Pid, Pid)> {
        let status = Status::from_file(format!("/proc/{tid}/status"))
            .map_err(|e| ThreadInfoError::ProcStatusFailed(tid, e))?;
        Ok((status.ppid, status.tgid))
    }

    /// `PTRACE_GETREGSET`, which unlike the older per register class requests
    /// exists on every architecture
    fn ptrace_get_regset<T>(flag: NT_Elf, pid: unistd::Pid) -> Result<T> {
        let mut data = std::mem::MaybeUninit::<T>::zeroed();
        let mut io = libc::iovec {
            iov_base: data.as_mut_ptr().cast(),
            iov_len: std::mem::size_of::<T>(),
        };
        // SAFETY: the kernel writes at most iov_len bytes into data
        let res = unsafe {
            libc::ptrace(
                libc::PTRACE_GETREGSET,
                libc::pid_t::from(pid),
                flag as usize,
                &mut io as *mut libc::iovec,
            )
        };
        Errno::result(res)?;
        // SAFETY: zero initialized plain old data, possibly partially
        // overwritten by the kernel
        Ok(unsafe { data.assume_init() })
    }
}

impl ThreadInfo {
    /// Reads the registers of `tid`, which must be attached and stopped
    pub fn create(pid: Pid, tid: Pid) -> Result<Self> {
        Self::create_impl(pid, tid)
    }
}

#[cfg(all(test, target_arch = "x86_64"))]
mod test {
    use super::*;

    #[test]
    fn packs_registers_little_endian() {
        let src = [0x1111_1111, 0x2222_2222, 0x3333_3333, 0x4444_4444, 1, 0, 0, 0];
        let mut dst = [0u128; 2];
        copy_u32_registers(&mut dst, &src);
        assert_eq!(dst[0], 0x4444_4444_3333_3333_2222_2222_1111_1111);
        assert_eq!(dst[1], 1);
    }

    #[test]
    fn own_status_has_our_pid() {
        let pid = std::process::id() as Pid;
        let (ppid, tgid) = ThreadInfo::get_ppid_and_tgid(pid).unwrap();
        assert_eq!(tgid, pid);
        assert_eq!(ppid, nix::unistd::getppid().as_raw());
    }
}
