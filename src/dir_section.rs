//! The minidump header and the fixed-size stream directory that follows it
//!
//! The directory is reserved before any stream is written so that it has a
//! known RVA, its slots are filled in as the streams are produced and the
//! bytes are streamed out to the destination incrementally.

use {
    crate::{
        mem_writer::{Buffer, MemoryArrayWriter, MemoryWriter, MemoryWriterError},
        minidump_format::{
            MD_HEADER_SIGNATURE, MD_HEADER_VERSION, MDLocationDescriptor, MDRawDirectory,
            MDRawHeader,
        },
    },
    std::io::{Error, Seek, SeekFrom, Write},
};

pub type DumpBuf = Buffer;

#[derive(Debug, thiserror::Error, serde::Serialize)]
pub enum FileWriterError {
    #[error("IO error")]
    IOError(
        #[from]
        #[serde(serialize_with = "crate::serializers::serialize_io_error")]
        Error,
    ),
    #[error("Failed to write to memory")]
    MemoryWriterError(#[from] MemoryWriterError),
    #[error("All {0} directory slots are already in use")]
    DirectoryFull(usize),
}

/// Tracks the stream directory and what part of the buffer has been flushed
pub struct DirSection<'a, W>
where
    W: Write + Seek,
{
    curr_idx: usize,
    section: MemoryArrayWriter<MDRawDirectory>,
    slots: usize,
    /// The destination may already contain data we must not overwrite, all
    /// RVAs are relative to where it was positioned at creation
    destination_start_offset: u64,
    destination: &'a mut W,
    last_position_written_to_file: u64,
}

impl<'a, W> DirSection<'a, W>
where
    W: Write + Seek,
{
    /// Writes the header and reserves `slots` zeroed directory entries
    pub fn new(
        buffer: &mut DumpBuf,
        slots: u32,
        time_date_stamp: u32,
        destination: &'a mut W,
    ) -> Result<Self, FileWriterError> {
        let mut header = MemoryWriter::<MDRawHeader>::alloc(buffer)?;
        let section = MemoryArrayWriter::<MDRawDirectory>::alloc_array(buffer, slots as usize)?;

        header.set_value(
            buffer,
            MDRawHeader {
                signature: MD_HEADER_SIGNATURE,
                version: MD_HEADER_VERSION,
                stream_count: slots,
                stream_directory_rva: section.position,
                checksum: 0,
                time_date_stamp,
                flags: 0,
            },
        )?;

        Ok(Self {
            curr_idx: 0,
            section,
            slots: slots as usize,
            destination_start_offset: destination.stream_position()?,
            destination,
            last_position_written_to_file: 0,
        })
    }

    #[inline]
    pub fn position(&self) -> u32 {
        self.section.position
    }

    #[inline]
    pub fn location(&self) -> MDLocationDescriptor {
        self.section.location()
    }

    /// Fills the next directory slot and rewrites that slot in the destination
    pub fn dump_dir_entry(
        &mut self,
        buffer: &mut DumpBuf,
        dirent: MDRawDirectory,
    ) -> Result<(), FileWriterError> {
        if self.curr_idx >= self.slots {
            return Err(FileWriterError::DirectoryFull(self.slots));
        }
        self.section.set_value_at(buffer, dirent, self.curr_idx)?;

        let curr_file_pos = self.destination.stream_position()?;
        let idx_pos = self.section.location_of_index(self.curr_idx);
        self.curr_idx += 1;

        self.destination.seek(SeekFrom::Start(
            self.destination_start_offset + idx_pos.rva as u64,
        ))?;
        let start = idx_pos.rva as usize;
        let end = (idx_pos.rva + idx_pos.data_size) as usize;
        self.destination.write_all(&buffer[start..end])?;

        self.destination.seek(SeekFrom::Start(curr_file_pos))?;
        Ok(())
    }

    /// Flushes everything added to the buffer since the last call, then
    /// records `dirent` if one is given
    pub fn write_to_file(
        &mut self,
        buffer: &mut DumpBuf,
        dirent: Option<MDRawDirectory>,
    ) -> Result<(), FileWriterError> {
        let start_pos = self.last_position_written_to_file as usize;
        self.destination.write_all(&buffer[start_pos..])?;
        self.last_position_written_to_file = buffer.position();

        if let Some(dirent) = dirent {
            self.dump_dir_entry(buffer, dirent)?;
        }
        Ok(())
    }

    /// Flushes the remaining buffer contents
    pub fn finish(&mut self, buffer: &mut DumpBuf) -> Result<(), FileWriterError> {
        self.write_to_file(buffer, None)?;
        self.destination.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::minidump_format::{MD_STREAM_COUNT, null_dirent};
    use scroll::Pread;
    use std::io::Cursor;

    #[test]
    fn header_and_directory_round_trip() {
        let mut buffer = DumpBuf::with_capacity(0);
        let mut out = Cursor::new(Vec::new());
        {
            let mut dir = DirSection::new(&mut buffer, MD_STREAM_COUNT, 1234, &mut out).unwrap();
            let payload = MemoryArrayWriter::write_bytes(&mut buffer, b"payload").unwrap();
            dir.write_to_file(
                &mut buffer,
                Some(MDRawDirectory {
                    stream_type: 0x47670006,
                    location: MDLocationDescriptor {
                        data_size: 7,
                        rva: payload.position,
                    },
                }),
            )
            .unwrap();
            dir.finish(&mut buffer).unwrap();
        }

        let bytes = out.into_inner();
        assert_eq!(&bytes[..], &buffer[..]);

        let header: MDRawHeader = bytes.pread_with(0, scroll::Endian::Little).unwrap();
        assert_eq!(header.signature, 0x504d444d);
        assert_eq!(header.version, 42899);
        assert_eq!(header.stream_count, 13);
        assert_eq!(header.time_date_stamp, 1234);

        let dir_rva = header.stream_directory_rva as usize;
        let first: MDRawDirectory = bytes.pread_with(dir_rva, scroll::Endian::Little).unwrap();
        assert_eq!(first.stream_type, 0x47670006);
        let start = first.location.rva as usize;
        assert_eq!(&bytes[start..start + 7], b"payload");

        for i in 1..13 {
            let entry: MDRawDirectory = bytes
                .pread_with(dir_rva + i * 12, scroll::Endian::Little)
                .unwrap();
            assert_eq!(entry.stream_type, 0);
            assert_eq!(entry.location.data_size, 0);
        }
    }

    #[test]
    fn directory_overflow_is_an_error() {
        let mut buffer = DumpBuf::with_capacity(0);
        let mut out = Cursor::new(Vec::new());
        let mut dir = DirSection::new(&mut buffer, 1, 0, &mut out).unwrap();
        dir.write_to_file(&mut buffer, Some(null_dirent()))
            .unwrap();
        assert!(matches!(
            dir.write_to_file(&mut buffer, Some(null_dirent())),
            Err(FileWriterError::DirectoryFull(1))
        ));
    }
}
