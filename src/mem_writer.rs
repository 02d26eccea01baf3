//! Incremental construction of a minidump image
//!
//! The minidump is assembled in a growable [`Buffer`]. Space is reserved up
//! front, which hands out the RVA the data will live at, and the actual bytes
//! are written into that reservation later. Reservations are contiguous, so
//! a list count and the array reserved right after it form one record.

use crate::minidump_format::{MDLocationDescriptor, MDRVA};
use scroll::ctx::{SizeWith, TryIntoCtx};

#[derive(Debug, thiserror::Error, serde::Serialize)]
pub enum MemoryWriterError {
    #[error("IO error when writing to DumpBuf")]
    IOError(
        #[from]
        #[serde(serialize_with = "crate::serializers::serialize_io_error")]
        std::io::Error,
    ),
    #[error("Failed integer conversion")]
    TryFromIntError(
        #[from]
        #[serde(skip)]
        std::num::TryFromIntError,
    ),
    #[error("Failed to write to buffer")]
    Scroll(
        #[from]
        #[serde(serialize_with = "crate::serializers::serialize_scroll_error")]
        scroll::Error,
    ),
    #[error("The minidump would exceed the 4GiB addressable by an RVA")]
    RvaOverflow,
    #[error("Write of {len} bytes at RVA {rva:#x} is outside of the reserved space")]
    OutOfBounds { rva: MDRVA, len: usize },
}

type WriteResult<T> = std::result::Result<T, MemoryWriterError>;

#[derive(Debug, Default, PartialEq)]
pub struct Buffer {
    inner: Vec<u8>,
}

impl Buffer {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            inner: Vec::with_capacity(cap),
        }
    }

    /// The RVA the next reservation will start at
    #[inline]
    pub fn position(&self) -> u64 {
        self.inner.len() as u64
    }

    /// Reserves `len` bytes, zero filled, returning the RVA of the first one
    pub fn reserve(&mut self, len: usize) -> WriteResult<MDRVA> {
        let mark = self.inner.len();
        let end = mark
            .checked_add(len)
            .ok_or(MemoryWriterError::RvaOverflow)?;
        if u32::try_from(end).is_err() {
            return Err(MemoryWriterError::RvaOverflow);
        }
        self.inner.resize(end, 0);
        Ok(mark as MDRVA)
    }

    /// Copies `bytes` into previously reserved space at `rva`
    pub fn copy_at(&mut self, rva: MDRVA, bytes: &[u8]) -> WriteResult<()> {
        let start = rva as usize;
        let dst = start
            .checked_add(bytes.len())
            .and_then(|end| self.inner.get_mut(start..end))
            .ok_or(MemoryWriterError::OutOfBounds {
                rva,
                len: bytes.len(),
            })?;
        dst.copy_from_slice(bytes);
        Ok(())
    }

    #[inline]
    fn write<N>(&mut self, val: N, rva: MDRVA) -> WriteResult<usize>
    where
        N: TryIntoCtx<scroll::Endian, Error = scroll::Error> + SizeWith<scroll::Endian>,
    {
        use scroll::Pwrite;
        Ok(self
            .inner
            .pwrite_with(val, rva as usize, scroll::Endian::Little)?)
    }
}

impl std::ops::Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl From<Buffer> for Vec<u8> {
    fn from(b: Buffer) -> Self {
        b.inner
    }
}

/// A single `T` reserved in a [`Buffer`]
#[derive(Debug)]
pub struct MemoryWriter<T> {
    pub position: MDRVA,
    pub size: usize,
    phantom: std::marker::PhantomData<T>,
}

impl<T> MemoryWriter<T>
where
    T: TryIntoCtx<scroll::Endian, Error = scroll::Error> + SizeWith<scroll::Endian>,
{
    /// Reserves space for a `T` and immediately writes `val` into it
    pub fn alloc_with_val(buffer: &mut Buffer, val: T) -> WriteResult<Self> {
        let mut writer = Self::alloc(buffer)?;
        writer.set_value(buffer, val)?;
        Ok(writer)
    }

    /// Reserves space for a `T` whose value will be filled in later
    pub fn alloc(buffer: &mut Buffer) -> WriteResult<Self> {
        let size = T::size_with(&scroll::Endian::Little);
        let position = buffer.reserve(size)?;

        Ok(Self {
            position,
            size,
            phantom: std::marker::PhantomData,
        })
    }

    /// Writes `val` into the reserved space
    pub fn set_value(&mut self, buffer: &mut Buffer, val: T) -> WriteResult<()> {
        buffer.write(val, self.position)?;
        Ok(())
    }

    pub fn location(&self) -> MDLocationDescriptor {
        MDLocationDescriptor {
            data_size: self.size as u32,
            rva: self.position,
        }
    }
}

/// A contiguous array of `T` reserved in a [`Buffer`]
#[derive(Debug)]
pub struct MemoryArrayWriter<T> {
    pub position: MDRVA,
    array_size: usize,
    phantom: std::marker::PhantomData<T>,
}

impl MemoryArrayWriter<u8> {
    /// Reserves space for `array` and copies it in
    pub fn write_bytes(buffer: &mut Buffer, array: &[u8]) -> WriteResult<Self> {
        let position = buffer.reserve(array.len())?;
        buffer.copy_at(position, array)?;

        Ok(Self {
            position,
            array_size: array.len(),
            phantom: std::marker::PhantomData,
        })
    }
}

impl<T> MemoryArrayWriter<T>
where
    T: TryIntoCtx<scroll::Endian, Error = scroll::Error> + SizeWith<scroll::Endian> + Copy,
{
    pub fn alloc_from_array(buffer: &mut Buffer, array: &[T]) -> WriteResult<Self> {
        let mut writer = Self::alloc_array(buffer, array.len())?;
        for (idx, val) in array.iter().enumerate() {
            writer.set_value_at(buffer, *val, idx)?;
        }
        Ok(writer)
    }
}

impl<T> MemoryArrayWriter<T>
where
    T: TryIntoCtx<scroll::Endian, Error = scroll::Error> + SizeWith<scroll::Endian>,
{
    /// Reserves space for `array_size` elements of `T`, all zeroed
    pub fn alloc_array(buffer: &mut Buffer, array_size: usize) -> WriteResult<Self> {
        let len = array_size
            .checked_mul(T::size_with(&scroll::Endian::Little))
            .ok_or(MemoryWriterError::RvaOverflow)?;
        let position = buffer.reserve(len)?;

        Ok(Self {
            position,
            array_size,
            phantom: std::marker::PhantomData,
        })
    }

    /// Writes `val` at `index` in the reserved array
    pub fn set_value_at(&mut self, buffer: &mut Buffer, val: T, index: usize) -> WriteResult<()> {
        if index >= self.array_size {
            return Err(MemoryWriterError::OutOfBounds {
                rva: self.location_of_index(index).rva,
                len: T::size_with(&scroll::Endian::Little),
            });
        }
        buffer.write(val, self.location_of_index(index).rva)?;
        Ok(())
    }

    pub fn location(&self) -> MDLocationDescriptor {
        MDLocationDescriptor {
            data_size: (self.array_size * T::size_with(&scroll::Endian::Little)) as u32,
            rva: self.position,
        }
    }

    pub fn location_of_index(&self, idx: usize) -> MDLocationDescriptor {
        let size = T::size_with(&scroll::Endian::Little);
        MDLocationDescriptor {
            data_size: size as u32,
            rva: self.position + (size * idx) as u32,
        }
    }
}

/// Writes `text` as a length prefixed UTF-16 string, returning its location
///
/// The length is the number of bytes of UTF-16 data, which is followed by a
/// terminating NUL code unit that is not counted.
pub fn write_string_to_location(
    buffer: &mut Buffer,
    text: &str,
) -> WriteResult<MDLocationDescriptor> {
    let letters: Vec<u16> = text.encode_utf16().collect();

    // First write size of the string (x letters in u16, times the size of u16)
    let text_header = MemoryWriter::<u32>::alloc_with_val(
        buffer,
        (letters.len() * std::mem::size_of::<u16>()).try_into()?,
    )?;

    // Then write utf-16 letters after that, plus the terminator
    let mut bytes = Vec::with_capacity((letters.len() + 1) * 2);
    for letter in letters.iter().chain(std::iter::once(&0)) {
        bytes.extend_from_slice(&letter.to_le_bytes());
    }
    MemoryArrayWriter::write_bytes(buffer, &bytes)?;

    Ok(text_header.location())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::minidump_format::{MDRawDirectory, null_dirent};
    use scroll::Pread;

    #[test]
    fn reservations_are_contiguous() {
        let mut buffer = Buffer::with_capacity(0);
        assert_eq!(buffer.reserve(3).unwrap(), 0);
        assert_eq!(buffer.reserve(8).unwrap(), 3);
        assert_eq!(buffer.reserve(1).unwrap(), 11);
        assert_eq!(buffer.position(), 12);
        assert_eq!(buffer.reserve(0).unwrap(), 12);
        assert_eq!(buffer.position(), 12);
    }

    #[test]
    fn list_count_is_followed_by_its_entries() {
        let mut buffer = Buffer::with_capacity(0);
        let count = MemoryWriter::<u32>::alloc_with_val(&mut buffer, 2).unwrap();
        let list = MemoryArrayWriter::<MDLocationDescriptor>::alloc_from_array(
            &mut buffer,
            &[
                MDLocationDescriptor {
                    data_size: 1,
                    rva: 2,
                },
                MDLocationDescriptor {
                    data_size: 3,
                    rva: 4,
                },
            ],
        )
        .unwrap();
        assert_eq!(list.position, count.position + 4);

        // Readers expect the entries right behind the count
        let mut offset = count.position as usize;
        let read: u32 = buffer.gread_with(&mut offset, scroll::Endian::Little).unwrap();
        assert_eq!(read, 2);
        let first: MDLocationDescriptor =
            buffer.gread_with(&mut offset, scroll::Endian::Little).unwrap();
        let second: MDLocationDescriptor =
            buffer.gread_with(&mut offset, scroll::Endian::Little).unwrap();
        assert_eq!((first.data_size, first.rva), (1, 2));
        assert_eq!((second.data_size, second.rva), (3, 4));
        assert_eq!(offset, buffer.len());
    }

    #[test]
    fn copy_outside_reservation_fails() {
        let mut buffer = Buffer::with_capacity(0);
        let rva = buffer.reserve(8).unwrap();
        buffer.copy_at(rva, &[1; 8]).unwrap();
        assert!(matches!(
            buffer.copy_at(rva + 4, &[1; 8]),
            Err(MemoryWriterError::OutOfBounds { .. })
        ));
        assert_eq!(&buffer[..], &[1; 8]);
    }

    #[test]
    fn array_writer_places_entries() {
        let mut buffer = Buffer::with_capacity(0);
        let mut dir = MemoryArrayWriter::<MDRawDirectory>::alloc_array(&mut buffer, 2).unwrap();
        dir.set_value_at(
            &mut buffer,
            MDRawDirectory {
                stream_type: 7,
                location: MDLocationDescriptor {
                    data_size: 4,
                    rva: 96,
                },
            },
            1,
        )
        .unwrap();
        assert!(dir.set_value_at(&mut buffer, null_dirent(), 2).is_err());

        let second: MDRawDirectory = buffer
            .pread_with(dir.location_of_index(1).rva as usize, scroll::Endian::Little)
            .unwrap();
        assert_eq!(second.stream_type, 7);
        assert_eq!(second.location.rva, 96);
        let first: MDRawDirectory = buffer.pread_with(0, scroll::Endian::Little).unwrap();
        assert_eq!(first.stream_type, 0);
    }

    #[test]
    fn strings_are_utf16_with_byte_length() {
        let mut buffer = Buffer::with_capacity(0);
        let _pad = buffer.reserve(1).unwrap();
        let loc = write_string_to_location(&mut buffer, "/lib/ä.so").unwrap();
        assert_eq!(loc.rva, 1);

        let len: u32 = buffer.pread_with(1, scroll::Endian::Little).unwrap();
        assert_eq!(len, 9 * 2);
        let units: Vec<u16> = buffer[5..5 + len as usize + 2]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(String::from_utf16(&units[..9]).unwrap(), "/lib/ä.so");
        assert_eq!(units[9], 0);
        assert_eq!(buffer.position(), 5 + 20);
    }
}
