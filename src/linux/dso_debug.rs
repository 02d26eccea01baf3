//! The `MD_LINUX_DSO_DEBUG` stream
//!
//! The run-time linker publishes the list of loaded objects for debuggers in
//! its `r_debug` structure. It's found through the dynamic section of the
//! main executable, which is found through the program headers in the auxv.
//! Every pointer followed here belongs to the target, so all of it is read
//! through [`Dumper::copy_from_process`].

use {
    super::{Pid, errors::SectionDsoDebugError, ptrace_dumper::Dumper},
    crate::{
        mem_writer::{Buffer, MemoryArrayWriter, write_string_to_location},
        minidump_format::*,
    },
    goblin::elf::{dynamic::DT_NULL, program_header::PT_DYNAMIC, program_header::PT_LOAD},
    goblin::elf64::{dynamic::Dyn, program_header::ProgramHeader},
    scroll::Pread,
};

type Result<T> = std::result::Result<T, SectionDsoDebugError>;

/// The longest shared object name that is copied
const MAX_NAME_LEN: usize = 256;

/// Bounds the walk of a list that may have been corrupted into a cycle
const MAX_LINK_MAPS: usize = 1 << 14;

/// `struct r_debug` of `<link.h>`, with the padding of 64 bit targets
const R_DEBUG_SIZE: usize = 40;
/// `struct link_map` of `<link.h>`, the public part of it
const LINK_MAP_SIZE: usize = 40;

/// The packed little endian sizes of `MDRawLinkMap` and `MDRawDebug`
const MD_LINK_MAP_SIZE: usize = 8 + 4 + 8;
const MD_DEBUG_SIZE: usize = 4 * 3 + 8 * 3;

/// How the tag that points to `r_debug` is interpreted, which differs
/// between architectures
pub trait DebugLocator {
    /// The dynamic section tag carrying the pointer
    const TAG: u64;

    /// Resolves the value of the [`Self::TAG`] entry to the address of
    /// `r_debug`
    fn r_debug_address(dumper: &impl Dumper, tid: Pid, value: u64) -> Result<usize>;
}

/// `DT_DEBUG` holds the address of `r_debug` itself
pub struct DtDebug;

impl DebugLocator for DtDebug {
    const TAG: u64 = goblin::elf::dynamic::DT_DEBUG;

    fn r_debug_address(_dumper: &impl Dumper, _tid: Pid, value: u64) -> Result<usize> {
        Ok(value.try_into()?)
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))] {
        type PlatformLocator = DtDebug;
    }
}

struct RDebug {
    version: u32,
    map: u64,
    brk: u64,
    ldbase: u64,
}

struct LinkMap {
    addr: u64,
    name: u64,
    ld: u64,
    next: u64,
}

fn read_r_debug(dumper: &impl Dumper, tid: Pid, address: usize) -> Result<RDebug> {
    let bytes: &[u8] = dumper.copy_from_process(tid, address, R_DEBUG_SIZE)?;
    Ok(RDebug {
        version: bytes.pread_with::<i32>(0, scroll::NATIVE)? as u32,
        map: bytes.pread_with(8, scroll::NATIVE)?,
        brk: bytes.pread_with(16, scroll::NATIVE)?,
        ldbase: bytes.pread_with(32, scroll::NATIVE)?,
    })
}

fn read_link_map(dumper: &impl Dumper, tid: Pid, address: u64) -> Result<LinkMap> {
    let bytes: &[u8] = dumper.copy_from_process(tid, address.try_into()?, LINK_MAP_SIZE)?;
    Ok(LinkMap {
        addr: bytes.pread_with(0, scroll::NATIVE)?,
        name: bytes.pread_with(8, scroll::NATIVE)?,
        ld: bytes.pread_with(16, scroll::NATIVE)?,
        next: bytes.pread_with(24, scroll::NATIVE)?,
    })
}

/// Reads the NUL terminated name at `address`, an unreadable name is empty
fn read_name(dumper: &impl Dumper, tid: Pid, address: u64) -> String {
    if address == 0 {
        return String::new();
    }
    // Names are short, but the copy must not cross into an unmapped page
    let Ok(address) = usize::try_from(address) else {
        return String::new();
    };
    let to_page_end = dumper.page_size() - (address % dumper.page_size());
    let mut name = Vec::new();
    let mut cursor = address;
    let mut chunk_len = to_page_end.min(MAX_NAME_LEN);
    while name.len() < MAX_NAME_LEN {
        let Ok(bytes) = dumper.copy_from_process(tid, cursor, chunk_len) else {
            break;
        };
        if let Some(nul) = bytes.iter().position(|b| *b == 0) {
            name.extend_from_slice(&bytes[..nul]);
            break;
        }
        name.extend_from_slice(bytes);
        cursor += chunk_len;
        chunk_len = dumper.page_size().min(MAX_NAME_LEN - name.len());
    }
    String::from_utf8_lossy(&name).into_owned()
}

/// Finds the dynamic section of the main executable, returning its address
fn find_dynamic_section(dumper: &impl Dumper, tid: Pid) -> Result<usize> {
    let auxv = dumper.auxv();
    let phnum = auxv
        .get_program_header_count()
        .filter(|n| *n != 0)
        .ok_or(SectionDsoDebugError::CouldNotFind("AT_PHNUM in auxv"))?;
    let phdr = auxv
        .get_program_header_address()
        .filter(|a| *a != 0)
        .ok_or(SectionDsoDebugError::CouldNotFind("AT_PHDR in auxv"))?;

    let phdr_size = std::mem::size_of::<ProgramHeader>();
    let headers: &[u8] = dumper.copy_from_process(
        tid,
        phdr.try_into()?,
        phdr_size * usize::try_from(phnum)?,
    )?;

    // The program headers are assumed to sit in the first page of the
    // image, the base is adjusted by the address the file start is loaded
    // at
    let mut base = phdr & !0xfff;
    let mut dyn_addr = None;
    for idx in 0..usize::try_from(phnum)? {
        let ph: ProgramHeader = headers.pread_with(idx * phdr_size, scroll::NATIVE)?;
        if ph.p_type == PT_LOAD && ph.p_offset == 0 {
            base = base.wrapping_sub(ph.p_vaddr);
        }
        if ph.p_type == PT_DYNAMIC {
            dyn_addr = Some(ph.p_vaddr);
        }
    }

    let dyn_addr = dyn_addr.ok_or(SectionDsoDebugError::CouldNotFind("PT_DYNAMIC"))?;
    Ok(dyn_addr.wrapping_add(base).try_into()?)
}

pub fn write(buffer: &mut Buffer, dumper: &impl Dumper, tid: Pid) -> Result<MDRawDirectory> {
    write_with::<PlatformLocator>(buffer, dumper, tid)
}

/// Writes the stream, locating `r_debug` with `L`
pub fn write_with<L: DebugLocator>(
    buffer: &mut Buffer,
    dumper: &impl Dumper,
    tid: Pid,
) -> Result<MDRawDirectory> {
    let dynamic = find_dynamic_section(dumper, tid)?;

    // Walk the dynamic section up to DT_NULL, keeping the debug entry
    let dyn_size = std::mem::size_of::<Dyn>();
    let mut r_debug = None;
    let mut dynamic_length = 0;
    loop {
        let bytes: &[u8] = dumper.copy_from_process(tid, dynamic + dynamic_length, dyn_size)?;
        let entry: Dyn = bytes.pread_with(0, scroll::NATIVE)?;
        dynamic_length += dyn_size;

        if entry.d_tag == L::TAG {
            r_debug = Some(L::r_debug_address(dumper, tid, entry.d_val)?);
        } else if entry.d_tag == DT_NULL {
            break;
        }
    }

    let r_debug = r_debug
        .filter(|addr| *addr != 0)
        .ok_or(SectionDsoDebugError::CouldNotFind("r_debug"))?;
    let debug_entry = read_r_debug(dumper, tid, r_debug)?;

    let mut link_maps = Vec::new();
    let mut next = debug_entry.map;
    while next != 0 && link_maps.len() < MAX_LINK_MAPS {
        let map = read_link_map(dumper, tid, next)?;
        next = map.next;
        link_maps.push(map);
    }

    // The entries are reserved ahead of the names they point to
    let mut linkmap_rva = 0;
    if !link_maps.is_empty() {
        linkmap_rva = buffer.reserve(link_maps.len() * MD_LINK_MAP_SIZE)?;

        let mut entries = Vec::with_capacity(link_maps.len() * MD_LINK_MAP_SIZE);
        for map in &link_maps {
            let name = read_name(dumper, tid, map.name);
            let location = write_string_to_location(buffer, &name)?;
            entries.extend_from_slice(&map.addr.to_le_bytes());
            entries.extend_from_slice(&location.rva.to_le_bytes());
            entries.extend_from_slice(&map.ld.to_le_bytes());
        }
        buffer.copy_at(linkmap_rva, &entries)?;
    }

    // The debug record is followed by a copy of the dynamic section
    let dynamic_bytes = dumper.copy_from_process(tid, dynamic, dynamic_length)?;
    let mut stream = Vec::with_capacity(MD_DEBUG_SIZE + dynamic_length);
    stream.extend_from_slice(&debug_entry.version.to_le_bytes());
    stream.extend_from_slice(&linkmap_rva.to_le_bytes());
    stream.extend_from_slice(&u32::try_from(link_maps.len())?.to_le_bytes());
    stream.extend_from_slice(&debug_entry.brk.to_le_bytes());
    stream.extend_from_slice(&debug_entry.ldbase.to_le_bytes());
    stream.extend_from_slice(&(dynamic as u64).to_le_bytes());
    stream.extend_from_slice(dynamic_bytes);

    let section = MemoryArrayWriter::<u8>::write_bytes(buffer, &stream)?;
    Ok(MDRawDirectory {
        stream_type: MDStreamType::LinuxDsoDebug as u32,
        location: section.location(),
    })
}
