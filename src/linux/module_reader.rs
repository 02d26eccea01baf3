//! Identification of ELF modules
//!
//! A module is identified by its GNU build id. Modules linked without one get
//! a synthesized identifier, the first page of their text folded into 16
//! bytes, which is stable as long as the code doesn't change.

use {
    super::{errors::ModuleReaderError as Error, mem_reader::MemReader},
    crate::minidump_format::GUID,
    goblin::{
        container::{Container, Ctx, Endian},
        elf,
    },
    std::ffi::CStr,
};

const NOTE_SECTION_NAME: &[u8] = b".note.gnu.build-id\0";
const DYNSTR_SECTION_NAME: &[u8] = b".dynstr\0";

/// How much of the text section is hashed when there is no build id
const TEXT_HASH_LEN: u64 = 4096;

/// Random access to the bytes of an ELF image, wherever they live
pub trait ModuleMemory {
    type Memory: std::ops::Deref<Target = [u8]>;

    fn read_module_memory(&self, offset: u64, length: u64) -> std::io::Result<Self::Memory>;
}

impl<'a> ModuleMemory for &'a [u8] {
    type Memory = Self;

    fn read_module_memory(&self, offset: u64, length: u64) -> std::io::Result<Self::Memory> {
        offset
            .checked_add(length)
            .and_then(|end| self.get(offset as usize..end as usize))
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("{length} bytes at {offset:#x} are out of bounds"),
                )
            })
    }
}

/// An image mapped into another process, read through a [`MemReader`]
///
/// Only valid for images whose file layout matches their memory layout, such
/// as the vDSO.
pub struct ProcessModuleMemory<'a> {
    reader: &'a MemReader,
    base: usize,
    size: usize,
}

impl<'a> ProcessModuleMemory<'a> {
    pub fn new(reader: &'a MemReader, base: usize, size: usize) -> Self {
        Self { reader, base, size }
    }
}

impl ModuleMemory for ProcessModuleMemory<'_> {
    type Memory = Vec<u8>;

    fn read_module_memory(&self, offset: u64, length: u64) -> std::io::Result<Self::Memory> {
        if offset.saturating_add(length) > self.size as u64 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        let mut buf = vec![0u8; length as usize];
        self.reader.read_exact(self.base + offset as usize, &mut buf)?;
        Ok(buf)
    }
}

fn read<T: ModuleMemory>(mem: &T, offset: u64, length: u64) -> Result<T::Memory, Error> {
    mem.read_module_memory(offset, length)
        .map_err(|error| Error::ReadModuleMemory {
            offset,
            length,
            error,
        })
}

fn is_executable_section(header: &elf::SectionHeader) -> bool {
    header.sh_type == elf::section_header::SHT_PROGBITS
        && header.sh_flags & u64::from(elf::section_header::SHF_ALLOC) != 0
        && header.sh_flags & u64::from(elf::section_header::SHF_EXECINSTR) != 0
}

/// Folds `data` into a GUID sized identifier by XORing consecutive chunks
fn build_id_from_bytes(data: &[u8]) -> Vec<u8> {
    let mut id = vec![0u8; std::mem::size_of::<GUID>()];
    for chunk in data.chunks(id.len()) {
        for (b, c) in id.iter_mut().zip(chunk) {
            *b ^= c;
        }
    }
    id
}

/// Returns the section header named `name` (which must include the NUL)
fn section_header_with_name<'a>(
    section_headers: &'a elf::SectionHeaders,
    strtab_index: usize,
    name: &[u8],
    module_memory: &impl ModuleMemory,
) -> Result<Option<&'a elf::SectionHeader>, Error> {
    let strtab = section_headers.get(strtab_index).ok_or(Error::NoStrTab)?;
    for header in section_headers {
        let sh_name = header.sh_name as u64;
        if sh_name >= strtab.sh_size {
            log::warn!("section name offset {sh_name:#x} is outside of the string table");
            continue;
        }
        if sh_name + name.len() as u64 > strtab.sh_size {
            continue;
        }
        let candidate = read(module_memory, strtab.sh_offset + sh_name, name.len() as u64)?;
        if name == &*candidate {
            return Ok(Some(header));
        }
    }
    Ok(None)
}

/// Values that can be extracted from a module image
pub trait ReadFromModule: Sized {
    fn read_from_module(module_memory: impl ModuleMemory) -> Result<Self, Error>;
}

/// The module build id, or the identifier synthesized in its place
#[derive(Default, Clone, Debug, PartialEq, Eq)]
pub struct BuildId(pub Vec<u8>);

impl ReadFromModule for BuildId {
    fn read_from_module(module_memory: impl ModuleMemory) -> Result<Self, Error> {
        let reader = ModuleReader::new(module_memory)?;
        let program_headers = match reader.build_id_from_program_headers() {
            Ok(v) => return Ok(BuildId(v)),
            Err(e) => Box::new(e),
        };
        let section = match reader.build_id_from_section() {
            Ok(v) => return Ok(BuildId(v)),
            Err(e) => Box::new(e),
        };
        let generated = match reader.build_id_generate_from_text() {
            Ok(v) => return Ok(BuildId(v)),
            Err(e) => Box::new(e),
        };
        Err(Error::NoBuildId {
            program_headers,
            section,
            generated,
        })
    }
}

/// The module's `DT_SONAME`
#[derive(Default, Clone, Debug)]
pub struct SoName(pub String);

impl ReadFromModule for SoName {
    fn read_from_module(module_memory: impl ModuleMemory) -> Result<Self, Error> {
        ModuleReader::new(module_memory)
            .and_then(|r| r.soname())
            .map(SoName)
    }
}

pub struct ModuleReader<T> {
    module_memory: T,
    header: elf::Header,
    context: Ctx,
}

impl<T: ModuleMemory> ModuleReader<T> {
    pub fn new(module_memory: T) -> Result<Self, Error> {
        // The 64-bit header is the larger one, reading that much works for
        // both classes as long as the image isn't truncated
        let header_size = elf::Header::size(Ctx::new(Container::Big, Endian::default()));
        let header_data = read(&module_memory, 0, header_size as u64)?;
        let header = elf::Elf::parse_header(&header_data)?;
        let context = Ctx::new(header.container()?, header.endianness()?);
        Ok(Self {
            module_memory,
            header,
            context,
        })
    }

    pub fn soname(&self) -> Result<String, Error> {
        use scroll::Pread;

        let section_headers = self.read_section_headers()?;

        let dynamic = section_headers
            .iter()
            .find(|h| h.sh_type == elf::section_header::SHT_DYNAMIC)
            .ok_or(Error::NoDynamicSection)?;

        let dynstr = match section_headers.get(dynamic.sh_link as usize) {
            Some(header) if header.sh_type == elf::section_header::SHT_STRTAB => header,
            _ => section_header_with_name(
                &section_headers,
                self.header.e_shstrndx as usize,
                DYNSTR_SECTION_NAME,
                &self.module_memory,
            )?
            .ok_or(Error::NoDynStrSection)?,
        };

        let dynamic_data = read(&self.module_memory, dynamic.sh_offset, dynamic.sh_size)?;
        let mut offset = 0;
        while offset < dynamic_data.len() {
            let entry: elf::dynamic::Dyn = dynamic_data.gread_with(&mut offset, self.context)?;
            match entry.d_tag {
                elf::dynamic::DT_NULL => break,
                elf::dynamic::DT_SONAME if entry.d_val < dynstr.sh_size => {
                    let name = read(
                        &self.module_memory,
                        dynstr.sh_offset + entry.d_val,
                        dynstr.sh_size - entry.d_val,
                    )?;
                    return CStr::from_bytes_until_nul(&name)
                        .map(|s| s.to_string_lossy().into_owned())
                        .map_err(|_| Error::StrTabNoNulByte);
                }
                _ => {}
            }
        }
        Err(Error::NoSoNameEntry)
    }

    /// Looks for the build id note in the `PT_NOTE` segments
    pub fn build_id_from_program_headers(&self) -> Result<Vec<u8>, Error> {
        if self.header.e_phoff == 0 {
            return Err(Error::NoProgramHeaderNote);
        }
        let data = read(
            &self.module_memory,
            self.header.e_phoff,
            self.header.e_phentsize as u64 * self.header.e_phnum as u64,
        )?;
        let program_headers =
            elf::ProgramHeader::parse(&data, 0, self.header.e_phnum as usize, self.context)?;

        program_headers
            .iter()
            .filter(|ph| ph.p_type == elf::program_header::PT_NOTE)
            .find_map(|ph| {
                self.find_build_id_note(ph.p_offset, ph.p_filesz, ph.p_align)
                    .ok()
                    .flatten()
            })
            .ok_or(Error::NoProgramHeaderNote)
    }

    /// Looks for the build id note in the `.note.gnu.build-id` section
    pub fn build_id_from_section(&self) -> Result<Vec<u8>, Error> {
        let section_headers = self.read_section_headers()?;

        let header = section_header_with_name(
            &section_headers,
            self.header.e_shstrndx as usize,
            NOTE_SECTION_NAME,
            &self.module_memory,
        )?
        .ok_or(Error::NoSectionNote)?;

        self.find_build_id_note(header.sh_offset, header.sh_size, header.sh_addralign)?
            .ok_or(Error::NoSectionNote)
    }

    /// Synthesizes an identifier from the start of the first executable section
    pub fn build_id_generate_from_text(&self) -> Result<Vec<u8>, Error> {
        let text = self
            .read_section_headers()?
            .into_iter()
            .find(is_executable_section)
            .ok_or(Error::NoTextSection)?;

        let len = text.sh_size.min(TEXT_HASH_LEN);
        let data = read(&self.module_memory, text.sh_offset, len)?;
        Ok(build_id_from_bytes(&data))
    }

    fn read_section_headers(&self) -> Result<elf::SectionHeaders, Error> {
        if self.header.e_shoff == 0 {
            return Err(Error::NoSections);
        }

        // goblin 0.9 treats an offset of 0 as "no section headers", so one
        // byte in front of the table is read as well and skipped
        let data = read(
            &self.module_memory,
            self.header.e_shoff - 1,
            self.header.e_shentsize as u64 * self.header.e_shnum as u64 + 1,
        )?;
        Ok(elf::SectionHeader::parse(
            &data,
            1,
            self.header.e_shnum as usize,
            self.context,
        )?)
    }

    fn find_build_id_note(
        &self,
        offset: u64,
        size: u64,
        alignment: u64,
    ) -> Result<Option<Vec<u8>>, Error> {
        let notes = read(&self.module_memory, offset, size)?;
        let iter = elf::note::NoteDataIterator {
            data: &notes,
            // this is the end offset of the iteration, not a length
            size: size as usize,
            offset: 0,
            ctx: (alignment as usize, self.context),
        };
        for note in iter {
            let Ok(note) = note else { break };
            if note.name == "GNU" && note.n_type == elf::note::NT_GNU_BUILD_ID {
                return Ok(Some(note.desc.to_owned()));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// A minimal x86_64 executable laid out as: ELF header, program headers
    /// (text, note, dynamic), section headers (null, .text,
    /// .note.gnu.build-id, .shstrtab, .dynamic, .dynstr), then the note with
    /// build id 01..10, the string tables, a `DT_SONAME` of `libfoo.so.1` and
    /// the code for `exit(0)`.
    const TINY_ELF: &[u8] = &[
        0x7f, 0x45, 0x4c, 0x46, 0x02, 0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x02, 0x00, 0x3e, 0x00, 0x01, 0x00, 0x00, 0x00, 0xea, 0x02, 0x40, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xe8, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x40, 0x00, 0x38, 0x00, 0x03, 0x00, 0x40, 0x00,
        0x06, 0x00, 0x03, 0x00, 0x01, 0x00, 0x00, 0x00, 0x07, 0x00, 0x00, 0x00, 0xea, 0x02, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0xea, 0x02, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x07, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x07,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x68, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x68, 0x02, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x20, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x20, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0xbd, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xbd, 0x02, 0x40,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x20, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x20, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x04,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00,
        0x01, 0x00, 0x00, 0x00, 0x06, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xea, 0x02, 0x40,
        0x00, 0x00, 0x00, 0x00, 0x00, 0xea, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x07, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x07, 0x00, 0x00, 0x00, 0x07, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x68, 0x02, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00, 0x68, 0x02, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x20, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x1a, 0x00, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x88, 0x02, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00, 0x88, 0x02,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x35, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x24, 0x00, 0x00, 0x00, 0x06, 0x00, 0x00,
        0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xbd, 0x02, 0x40, 0x00, 0x00, 0x00,
        0x00, 0x00, 0xbd, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x20, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x2d, 0x00, 0x00,
        0x00, 0x03, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xdd, 0x02,
        0x40, 0x00, 0x00, 0x00, 0x00, 0x00, 0xdd, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x0d,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x04, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00, 0x47, 0x4e,
        0x55, 0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d,
        0x0e, 0x0f, 0x10, 0x00, 0x2e, 0x74, 0x65, 0x78, 0x74, 0x00, 0x2e, 0x6e, 0x6f, 0x74, 0x65,
        0x2e, 0x67, 0x6e, 0x75, 0x2e, 0x62, 0x75, 0x69, 0x6c, 0x64, 0x2d, 0x69, 0x64, 0x00, 0x2e,
        0x73, 0x68, 0x73, 0x74, 0x72, 0x74, 0x61, 0x62, 0x00, 0x2e, 0x64, 0x79, 0x6e, 0x61, 0x6d,
        0x69, 0x63, 0x00, 0x2e, 0x64, 0x79, 0x6e, 0x73, 0x74, 0x72, 0x00, 0x0e, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x6c,
        0x69, 0x62, 0x66, 0x6f, 0x6f, 0x2e, 0x73, 0x6f, 0x2e, 0x31, 0x00, 0x6a, 0x3c, 0x58, 0x31,
        0xff, 0x0f, 0x05, 0x66, 0x6f, 0x6f, 0x2e, 0x73, 0x6f, 0x2e, 0x31, 0x00, 0x6a, 0x3c, 0x58,
        0x31, 0xff, 0x0f, 0x05, 0x05,
    ];

    const NOTE_ID: [u8; 16] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16];

    #[test]
    fn build_id_sources() {
        let reader = ModuleReader::new(TINY_ELF).unwrap();
        assert_eq!(reader.build_id_from_program_headers().unwrap(), NOTE_ID);
        assert_eq!(reader.build_id_from_section().unwrap(), NOTE_ID);
        assert_eq!(
            reader.build_id_generate_from_text().unwrap(),
            [0x6a, 0x3c, 0x58, 0x31, 0xff, 0x0f, 0x05, 0, 0, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn build_id_prefers_note() {
        let id = BuildId::read_from_module(TINY_ELF).unwrap();
        assert_eq!(id.0, NOTE_ID);
    }

    #[test]
    fn xor_folding() {
        let data: Vec<u8> = (0..32).collect();
        let id = build_id_from_bytes(&data);
        assert_eq!(id.len(), 16);
        assert!(id.iter().all(|b| *b == 16));
    }

    #[test]
    fn soname() {
        let soname = SoName::read_from_module(TINY_ELF).unwrap();
        assert_eq!(soname.0, "libfoo.so.1");
    }

    #[test]
    fn truncated_image_is_an_error() {
        assert!(matches!(
            ModuleReader::new(&TINY_ELF[..16]),
            Err(Error::ReadModuleMemory { .. })
        ));
    }
}
