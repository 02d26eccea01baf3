use {
    super::{AuxvError, AuxvPair, AuxvType, consts::AT_NULL},
    byteorder::{NativeEndian, ReadBytesExt},
    std::io::{ErrorKind, Read},
};

/// Iterates the native endian key/value pairs of a `/proc/<pid>/auxv` file,
/// stopping at `AT_NULL`
pub struct ProcfsAuxvIter<R: Read> {
    reader: R,
    done: bool,
}

impl<R: Read> ProcfsAuxvIter<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            done: false,
        }
    }

    fn read_value(&mut self) -> Result<AuxvType, std::io::Error> {
        #[cfg(target_pointer_width = "64")]
        let value = self.reader.read_u64::<NativeEndian>();
        #[cfg(target_pointer_width = "32")]
        let value = self.reader.read_u32::<NativeEndian>();
        value
    }
}

impl<R: Read> Iterator for ProcfsAuxvIter<R> {
    type Item = Result<AuxvPair, AuxvError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let pair = self
            .read_value()
            .and_then(|key| Ok(AuxvPair { key, value: self.read_value()? }));

        match pair {
            Ok(AuxvPair { key: AT_NULL, .. }) => {
                self.done = true;
                None
            }
            Ok(pair) => Some(Ok(pair)),
            Err(e) => {
                self.done = true;
                if e.kind() == ErrorKind::UnexpectedEof {
                    Some(Err(AuxvError::InvalidFormat))
                } else {
                    Some(Err(AuxvError::IOError(e)))
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn truncated_input_is_invalid() {
        // a key without its value
        let bytes = (5 as AuxvType).to_ne_bytes();
        let mut iter = ProcfsAuxvIter::new(&bytes[..]);
        assert!(matches!(iter.next(), Some(Err(AuxvError::InvalidFormat))));
        assert!(iter.next().is_none());
    }
}
