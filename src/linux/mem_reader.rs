//! Reading memory of a (usually ptrace-stopped) process

use {
    super::Pid,
    crate::serializers::serialize_nix_error,
    std::{io, sync::OnceLock},
};

/// The mechanism used to read the target's memory, chosen by probing on the
/// first read and kept for the lifetime of the reader
#[derive(Debug)]
enum Style {
    /// [`process_vm_readv`](https://man7.org/linux/man-pages/man2/process_vm_readv.2.html),
    /// one syscall per read, subject to the same permission checks as ptrace
    VirtualMem,
    /// `pread` on `/proc/<pid>/mem`
    File(std::fs::File),
    /// `PTRACE_PEEKDATA`, one word per syscall. Slow, but works on every
    /// kernel as long as the thread is attached
    Ptrace,
    /// Every method failed on the first read
    Unavailable {
        vmem: nix::Error,
        file: nix::Error,
        ptrace: nix::Error,
    },
}

#[derive(Debug, thiserror::Error, serde::Serialize)]
#[error("Copy from process {child} failed (address {address:#x}, offset: {offset}, length: {length})")]
pub struct CopyFromProcessError {
    pub child: Pid,
    pub address: usize,
    pub offset: usize,
    pub length: usize,
    #[serde(serialize_with = "serialize_nix_error")]
    pub source: nix::Error,
}

pub struct MemReader {
    pid: nix::unistd::Pid,
    style: OnceLock<Style>,
}

impl std::fmt::Debug for MemReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self.style.get() {
            Some(Style::VirtualMem) => "process_vm_readv",
            Some(Style::File(_)) => "/proc/<pid>/mem",
            Some(Style::Ptrace) => "PTRACE_PEEKDATA",
            Some(Style::Unavailable { vmem, file, ptrace }) => {
                return write!(
                    f,
                    "process_vm_readv: {vmem}, /proc/<pid>/mem: {file}, PTRACE_PEEKDATA: {ptrace}"
                );
            }
            None => "unknown",
        };

        f.write_str(s)
    }
}

impl MemReader {
    /// Creates a reader for `pid`, the read method is picked on first use
    #[inline]
    pub fn new(pid: Pid) -> Self {
        Self {
            pid: nix::unistd::Pid::from_raw(pid),
            style: OnceLock::default(),
        }
    }

    #[inline]
    #[doc(hidden)]
    pub fn for_virtual_mem(pid: Pid) -> Self {
        Self {
            pid: nix::unistd::Pid::from_raw(pid),
            style: OnceLock::from(Style::VirtualMem),
        }
    }

    #[inline]
    #[doc(hidden)]
    pub fn for_file(pid: Pid) -> io::Result<Self> {
        let file = std::fs::File::open(format!("/proc/{pid}/mem"))?;

        Ok(Self {
            pid: nix::unistd::Pid::from_raw(pid),
            style: OnceLock::from(Style::File(file)),
        })
    }

    #[inline]
    #[doc(hidden)]
    pub fn for_ptrace(pid: Pid) -> Self {
        Self {
            pid: nix::unistd::Pid::from_raw(pid),
            style: OnceLock::from(Style::Ptrace),
        }
    }

    #[inline]
    pub fn pid(&self) -> Pid {
        self.pid.as_raw()
    }

    /// Fills all of `dst` from `address`, failing on a short read
    pub fn read_exact(&self, mut address: usize, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let bytes_read = self.read(address, dst).map_err(io::Error::other)?;
            if bytes_read == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            address += bytes_read;
            dst = &mut dst[bytes_read..];
        }
        Ok(())
    }

    /// Reads a native endian machine word
    pub fn read_word(&self, address: usize) -> io::Result<usize> {
        let mut word = [0u8; std::mem::size_of::<usize>()];
        self.read_exact(address, &mut word)?;
        Ok(usize::from_ne_bytes(word))
    }

    /// Reads a NUL terminated string of at most `max_len` bytes
    pub fn read_c_string(&self, mut address: usize, max_len: usize) -> io::Result<String> {
        let mut bytes = Vec::new();
        let mut chunk = [0u8; 64];
        while bytes.len() < max_len {
            // Don't cross a page boundary, the next page may not be mapped
            let to_page_end = 4096 - (address % 4096);
            let len = chunk.len().min(to_page_end).min(max_len - bytes.len());
            self.read_exact(address, &mut chunk[..len])?;
            if let Some(nul) = chunk[..len].iter().position(|b| *b == 0) {
                bytes.extend_from_slice(&chunk[..nul]);
                return Ok(String::from_utf8_lossy(&bytes).into_owned());
            }
            bytes.extend_from_slice(&chunk[..len]);
            address += len;
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn read(&self, address: usize, dst: &mut [u8]) -> Result<usize, CopyFromProcessError> {
        if let Some(rs) = self.style.get() {
            let res = match rs {
                Style::VirtualMem => Self::vmem(self.pid, address, dst).map_err(|s| (s, 0)),
                Style::File(file) => Self::file(file, address, dst).map_err(|s| (s, 0)),
                Style::Ptrace => Self::ptrace(self.pid, address, dst),
                Style::Unavailable { ptrace, .. } => Err((*ptrace, 0)),
            };

            return res.map_err(|(source, offset)| CopyFromProcessError {
                child: self.pid.as_raw(),
                address,
                offset,
                length: dst.len(),
                source,
            });
        }

        // Try from the fastest to the slowest method. Only the first
        // successful (or the final failing) attempt sets the style, a racing
        // reader losing the `set` simply keeps its own result.
        let vmem = match Self::vmem(self.pid, address, dst) {
            Ok(len) => {
                let _ = self.style.set(Style::VirtualMem);
                return Ok(len);
            }
            Err(err) => err,
        };

        let file = match std::fs::File::open(format!("/proc/{}/mem", self.pid)) {
            Ok(file) => match Self::file(&file, address, dst) {
                Ok(len) => {
                    let _ = self.style.set(Style::File(file));
                    return Ok(len);
                }
                Err(err) => err,
            },
            Err(err) => err
                .raw_os_error()
                .map(nix::Error::from_raw)
                .unwrap_or(nix::Error::EIO),
        };

        let ptrace = match Self::ptrace(self.pid, address, dst) {
            Ok(len) => {
                let _ = self.style.set(Style::Ptrace);
                return Ok(len);
            }
            Err((err, _)) => err,
        };

        let _ = self.style.set(Style::Unavailable { vmem, file, ptrace });
        Err(CopyFromProcessError {
            child: self.pid.as_raw(),
            address,
            offset: 0,
            length: dst.len(),
            source: ptrace,
        })
    }

    #[inline]
    fn vmem(pid: nix::unistd::Pid, address: usize, dst: &mut [u8]) -> Result<usize, nix::Error> {
        let remote = &[nix::sys::uio::RemoteIoVec {
            base: address,
            len: dst.len(),
        }];
        nix::sys::uio::process_vm_readv(pid, &mut [io::IoSliceMut::new(dst)], remote)
    }

    #[inline]
    fn file(file: &std::fs::File, src: usize, dst: &mut [u8]) -> Result<usize, nix::Error> {
        use std::os::unix::fs::FileExt;

        file.read_exact_at(dst, src as u64).map_err(|err| {
            err.raw_os_error()
                .map(nix::Error::from_raw)
                // EOF
                .unwrap_or(nix::Error::E2BIG)
        })?;

        Ok(dst.len())
    }

    #[inline]
    fn ptrace(
        pid: nix::unistd::Pid,
        address: usize,
        dst: &mut [u8],
    ) -> Result<usize, (nix::Error, usize)> {
        const WORD: usize = std::mem::size_of::<usize>();

        let mut offset = 0;
        let mut chunks = dst.chunks_exact_mut(WORD);

        for chunk in chunks.by_ref() {
            let word = nix::sys::ptrace::read(pid, (address + offset) as *mut std::ffi::c_void)
                .map_err(|err| (err, offset))?;
            chunk.copy_from_slice(&word.to_ne_bytes());
            offset += WORD;
        }

        let last = chunks.into_remainder();
        if !last.is_empty() {
            let word = nix::sys::ptrace::read(pid, (address + offset) as *mut std::ffi::c_void)
                .map_err(|err| (err, offset))?;
            last.copy_from_slice(&word.to_ne_bytes()[..last.len()]);
        }

        Ok(dst.len())
    }
}
