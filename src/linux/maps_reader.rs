//! The mappings of a process, as described by `/proc/<pid>/maps`

use {
    super::{Pid, auxv::AuxvType, errors::MapsReaderError},
    procfs_core::{
        FromRead,
        process::{MMapPath, MemoryMaps},
    },
    std::{
        ffi::{OsStr, OsString},
        os::unix::ffi::OsStrExt,
        path::Path,
    },
};

pub use procfs_core::process::MMPermissions;

pub const LINUX_GATE_LIBRARY_NAME: &str = "linux-gate.so";
pub const DELETED_SUFFIX: &[u8] = b" (deleted)";

/// Mappings smaller than this are too small to carry an identifiable module
pub const MIN_MODULE_SIZE: usize = 4096;

/// The address range of a mapping as the kernel reports it
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct SystemMappingInfo {
    pub start_address: usize,
    pub end_address: usize,
}

/// One module or region of the target, possibly several merged lines of
/// `/proc/<pid>/maps`
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct MappingInfo {
    pub start_address: usize,
    pub size: usize,
    /// The unadjusted range, which grows with merges but never with folded
    /// reserved gaps
    pub system_mapping_info: SystemMappingInfo,
    /// Offset into the backing file
    pub offset: usize,
    pub permissions: MMPermissions,
    pub name: Option<OsString>,
}

/// A mapping the embedder describes itself, with the identifier the dumper
/// could not compute on its own (JIT code for example)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingEntry {
    pub mapping: MappingInfo,
    pub identifier: [u8; 16],
}

pub type MappingList = Vec<MappingEntry>;

impl MappingInfo {
    /// Builds the mapping list from the parsed maps file
    ///
    /// Adjacent lines of the same file are merged, as are reserved gaps the
    /// linker left directly behind an executable mapping. The vdso, which has
    /// no path, is named [`LINUX_GATE_LIBRARY_NAME`] if `linux_gate_loc`
    /// points at it.
    pub fn aggregate(memory_maps: MemoryMaps, linux_gate_loc: Option<AuxvType>) -> Vec<Self> {
        let mut infos: Vec<Self> = Vec::new();

        for mm in memory_maps.into_iter() {
            let start_address = mm.address.0 as usize;
            let end_address = mm.address.1 as usize;
            let mut offset = mm.offset as usize;

            let mut name = match mm.pathname {
                MMapPath::Path(p) => Some(p.into_os_string()),
                _ => None,
            };
            if name.is_none()
                && linux_gate_loc.is_some_and(|loc| loc as usize == start_address)
            {
                name = Some(LINUX_GATE_LIBRARY_NAME.into());
                offset = 0;
            }

            if let Some(module) = infos.last_mut() {
                let module_end = module.start_address + module.size;
                let exec = mm.perms.contains(MMPermissions::EXECUTE);

                match &name {
                    // Merge adjacent mappings of one library. lld lays out a
                    // non executable segment in front of the executable one.
                    Some(name)
                        if start_address == module_end
                            && module.name.as_ref() == Some(name)
                            && (exec == module.is_executable() || !module.is_executable()) =>
                    {
                        module.system_mapping_info.end_address = end_address;
                        module.size = end_address - module.start_address;
                        module.permissions |= mm.perms & MMPermissions::EXECUTE;
                        continue;
                    }
                    // Address space the linker reserved but the library didn't use
                    None if start_address == module_end
                        && module.is_executable()
                        && module.name.as_ref().is_some_and(|n| n.as_bytes().starts_with(b"/"))
                        && (offset == 0 || offset == module_end)
                        && mm.perms == MMPermissions::PRIVATE =>
                    {
                        module.size = end_address - module.start_address;
                        continue;
                    }
                    _ => {}
                }
            }

            infos.push(Self {
                start_address,
                size: end_address - start_address,
                system_mapping_info: SystemMappingInfo {
                    start_address,
                    end_address,
                },
                offset,
                permissions: mm.perms,
                name,
            });
        }

        infos
    }

    /// Reads and aggregates `/proc/<pid>/maps`
    pub fn read_from_process(
        pid: Pid,
        linux_gate_loc: Option<AuxvType>,
    ) -> Result<Vec<Self>, MapsReaderError> {
        let path = format!("/proc/{pid}/maps");
        let file =
            std::fs::File::open(&path).map_err(|e| MapsReaderError::OpenFailed(path, e))?;
        let maps = MemoryMaps::from_read(file)?;
        Ok(Self::aggregate(maps, linux_gate_loc))
    }

    #[inline]
    pub fn is_executable(&self) -> bool {
        self.permissions.contains(MMPermissions::EXECUTE)
    }

    #[inline]
    pub fn is_readable(&self) -> bool {
        self.permissions.contains(MMPermissions::READ)
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.permissions.contains(MMPermissions::WRITE)
    }

    #[inline]
    pub fn contains_address(&self, address: usize) -> bool {
        self.start_address <= address && address - self.start_address < self.size
    }

    /// Whether the module list should describe this mapping
    ///
    /// Unnamed mappings carry no module. Of a library only the first (offset
    /// 0) mapping or the executable one is kept, and anything smaller than a
    /// page can't be identified.
    pub fn is_eligible_for_module(&self) -> bool {
        self.name.is_some()
            && (self.offset == 0 || self.is_executable())
            && self.size >= MIN_MODULE_SIZE
    }

    /// Whether an embedder supplied mapping covers any part of this one
    ///
    /// Such a mapping is left out of the module list entirely, two modules
    /// claiming the same address would confuse symbolication.
    pub fn overlaps_user_mapping(&self, user_mapping_list: &MappingList) -> bool {
        let end = self.start_address.saturating_add(self.size);
        user_mapping_list.iter().any(|user| {
            let user_end = user.mapping.start_address.saturating_add(user.mapping.size);
            self.start_address < user_end && user.mapping.start_address < end
        })
    }

    /// Whether this is the mapping of the vdso
    pub fn is_linux_gate(&self) -> bool {
        self.name
            .as_deref()
            .is_some_and(|n| n == OsStr::new(LINUX_GATE_LIBRARY_NAME))
    }

    /// Looks for a word in `stack_copy` at or above the stack pointer that
    /// points into this mapping
    ///
    /// `stack_copy[sp_offset]` corresponds to the stack pointer, which is
    /// word aligned in the target even if the copy is not.
    pub fn stack_has_pointer_to_mapping(&self, stack_copy: &[u8], sp_offset: usize) -> bool {
        const WORD: usize = std::mem::size_of::<usize>();

        let low_addr = self.system_mapping_info.start_address;
        let high_addr = self.system_mapping_info.end_address;
        let aligned_offset = sp_offset.next_multiple_of(WORD);

        stack_copy
            .get(aligned_offset..)
            .unwrap_or_default()
            .chunks_exact(WORD)
            .map(|chunk| {
                let mut word = [0u8; WORD];
                word.copy_from_slice(chunk);
                usize::from_ne_bytes(word)
            })
            .any(|addr| low_addr <= addr && addr <= high_addr)
    }

    /// Replaces the name of a deleted executable with the `/proc/<pid>/exe`
    /// link, which can still be opened
    ///
    /// Returns `None` if the name doesn't end in ` (deleted)`, or if the exe
    /// link doesn't point to it (a file can be named like that).
    pub fn handle_deleted_file_in_mapping(path: &OsStr, pid: Pid) -> Option<OsString> {
        let bytes = path.as_bytes();
        // At least "/x (deleted)"
        if bytes.len() < DELETED_SUFFIX.len() + 2 || !bytes.ends_with(DELETED_SUFFIX) {
            return None;
        }

        let exe_link = format!("/proc/{pid}/exe");
        let link_target = std::fs::read_link(&exe_link).ok()?;
        if link_target.as_os_str() != path {
            return None;
        }

        // Someone actually named their executable "foo (deleted)"
        use std::os::unix::fs::MetadataExt;
        if let (Ok(exe_stat), Ok(path_stat)) =
            (std::fs::metadata(&exe_link), std::fs::metadata(Path::new(path)))
        {
            if exe_stat.dev() == path_stat.dev() && exe_stat.ino() == path_stat.ino() {
                return None;
            }
        }

        Some(exe_link.into())
    }
}
