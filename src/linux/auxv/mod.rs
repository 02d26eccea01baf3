//! The auxiliary vector the kernel handed to the target process

pub use reader::ProcfsAuxvIter;
use {
    super::Pid,
    crate::serializers::*,
    failspot::failspot,
    std::{fs::File, io::BufReader},
    thiserror::Error,
};

mod reader;

/// The type used in auxv keys and values.
#[cfg(target_pointer_width = "32")]
pub type AuxvType = u32;
/// The type used in auxv keys and values.
#[cfg(target_pointer_width = "64")]
pub type AuxvType = u64;

pub mod consts {
    use super::AuxvType;
    pub const AT_NULL: AuxvType = libc::AT_NULL;
    pub const AT_PHDR: AuxvType = libc::AT_PHDR;
    pub const AT_PHNUM: AuxvType = libc::AT_PHNUM;
    pub const AT_ENTRY: AuxvType = libc::AT_ENTRY;
    pub const AT_SYSINFO_EHDR: AuxvType = libc::AT_SYSINFO_EHDR;
}

/// An auxv key-value pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuxvPair {
    pub key: AuxvType,
    pub value: AuxvType,
}

/// The handful of auxv entries the dumper needs
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AuxvDumpInfo {
    program_header_count: Option<AuxvType>,
    program_header_address: Option<AuxvType>,
    linux_gate_address: Option<AuxvType>,
    entry_address: Option<AuxvType>,
}

impl AuxvDumpInfo {
    /// Reads `/proc/<pid>/auxv`
    pub fn read(pid: Pid) -> Result<Self, AuxvError> {
        failspot!(FillMissingAuxvInfo bail(AuxvError::NoAuxvEntryFound(pid)));

        let auxv_path = format!("/proc/{pid}/auxv");
        let auxv_file = File::open(&auxv_path).map_err(|e| AuxvError::OpenError(auxv_path, e))?;
        Self::from_pairs(ProcfsAuxvIter::new(BufReader::new(auxv_file)))
            .ok_or(AuxvError::NoAuxvEntryFound(pid))
    }

    /// Picks the interesting entries out of `pairs`, returning `None` if
    /// there were no entries at all
    pub fn from_pairs(pairs: impl Iterator<Item = Result<AuxvPair, AuxvError>>) -> Option<Self> {
        let mut info = Self::default();
        let mut any = false;
        for AuxvPair { key, value } in pairs.map_while(Result::ok) {
            any = true;
            let slot = match key {
                consts::AT_PHNUM => &mut info.program_header_count,
                consts::AT_PHDR => &mut info.program_header_address,
                consts::AT_SYSINFO_EHDR => &mut info.linux_gate_address,
                consts::AT_ENTRY => &mut info.entry_address,
                _ => continue,
            };
            slot.get_or_insert(value);
        }
        any.then_some(info)
    }

    pub fn get_program_header_count(&self) -> Option<AuxvType> {
        self.program_header_count
    }
    pub fn get_program_header_address(&self) -> Option<AuxvType> {
        self.program_header_address
    }
    pub fn get_linux_gate_address(&self) -> Option<AuxvType> {
        self.linux_gate_address
    }
    pub fn get_entry_address(&self) -> Option<AuxvType> {
        self.entry_address
    }
}

#[derive(Debug, Error, serde::Serialize)]
pub enum AuxvError {
    #[error("Failed to open file {0}")]
    OpenError(
        String,
        #[source]
        #[serde(serialize_with = "serialize_io_error")]
        std::io::Error,
    ),
    #[error("No auxv entry found for PID {0}")]
    NoAuxvEntryFound(Pid),
    #[error("Invalid auxv format (should not hit EOF before AT_NULL)")]
    InvalidFormat,
    #[error("IO Error")]
    IOError(
        #[from]
        #[serde(serialize_with = "serialize_io_error")]
        std::io::Error,
    ),
}
