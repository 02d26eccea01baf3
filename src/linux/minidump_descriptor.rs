//! Where a minidump goes and how it is to be written

use {
    super::{
        errors::{HandlerError, WriterError},
        minidump_writer::MinidumpWriter,
    },
    error_graph::ErrorList,
    std::{
        fs::File,
        mem::ManuallyDrop,
        os::fd::{FromRawFd, RawFd},
        path::{Path, PathBuf},
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Destination {
    /// A new `<uuid>.dmp` file in `directory` for every dump
    Directory {
        directory: PathBuf,
        path: Option<PathBuf>,
    },
    /// A descriptor opened by the embedder, it is never closed
    Fd(RawFd),
}

/// Describes the minidump destination and the options handed to the writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinidumpDescriptor {
    destination: Destination,
    size_limit: Option<u64>,
    principal_mapping_address: Option<usize>,
    sanitize_stacks: bool,
}

impl MinidumpDescriptor {
    /// Dumps go to fresh files in `directory`
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self::with_destination(Destination::Directory {
            directory: directory.into(),
            path: None,
        })
    }

    /// Dumps are written to `fd`, which must be writable and seekable
    pub fn from_fd(fd: RawFd) -> Self {
        Self::with_destination(Destination::Fd(fd))
    }

    fn with_destination(destination: Destination) -> Self {
        Self {
            destination,
            size_limit: None,
            principal_mapping_address: None,
            sanitize_stacks: false,
        }
    }

    #[inline]
    pub fn is_fd(&self) -> bool {
        matches!(self.destination, Destination::Fd(_))
    }

    pub fn fd(&self) -> Option<RawFd> {
        match self.destination {
            Destination::Fd(fd) => Some(fd),
            Destination::Directory { .. } => None,
        }
    }

    pub fn directory(&self) -> Option<&Path> {
        match &self.destination {
            Destination::Directory { directory, .. } => Some(directory),
            Destination::Fd(_) => None,
        }
    }

    /// The file the next dump is written to, once [`Self::update_path`] ran
    pub fn path(&self) -> Option<&Path> {
        match &self.destination {
            Destination::Directory { path, .. } => path.as_deref(),
            Destination::Fd(_) => None,
        }
    }

    /// Picks a new unique file name for the next dump
    pub fn update_path(&mut self) {
        if let Destination::Directory { directory, path } = &mut self.destination {
            *path = Some(directory.join(format!("{}.dmp", uuid::Uuid::new_v4())));
        }
    }

    pub fn set_size_limit(&mut self, limit: u64) -> &mut Self {
        self.size_limit = Some(limit);
        self
    }

    #[inline]
    pub fn size_limit(&self) -> Option<u64> {
        self.size_limit
    }

    /// Skips the dump unless the crashing thread references the mapping
    /// containing `address`, and then only keeps the stacks that do
    pub fn set_principal_mapping_address(&mut self, address: usize) -> &mut Self {
        self.principal_mapping_address = Some(address);
        self
    }

    #[inline]
    pub fn principal_mapping_address(&self) -> Option<usize> {
        self.principal_mapping_address
    }

    pub fn set_sanitize_stacks(&mut self, sanitize_stacks: bool) -> &mut Self {
        self.sanitize_stacks = sanitize_stacks;
        self
    }

    #[inline]
    pub fn sanitize_stacks(&self) -> bool {
        self.sanitize_stacks
    }

    /// Applies the writer options carried by the descriptor
    pub(crate) fn configure(&self, writer: &mut MinidumpWriter) {
        if let Some(limit) = self.size_limit {
            writer.set_minidump_size_limit(limit);
        }
        if let Some(address) = self.principal_mapping_address {
            writer.skip_stacks_if_mapping_unreferenced(address);
        }
        if self.sanitize_stacks {
            writer.sanitize_stack();
        }
    }

    /// Runs `writer` against the destination
    pub(crate) fn write(
        &self,
        writer: &mut MinidumpWriter,
    ) -> Result<ErrorList<WriterError>, HandlerError> {
        match &self.destination {
            Destination::Fd(fd) => {
                // SAFETY: the embedder guarantees the descriptor is open, it
                // stays owned by them
                let mut file = ManuallyDrop::new(unsafe { File::from_raw_fd(*fd) });
                Ok(writer.dump(&mut *file)?)
            }
            Destination::Directory { path, .. } => {
                let path = path.as_ref().ok_or(HandlerError::NoPath)?;
                let mut file = File::create(path).map_err(HandlerError::Destination)?;
                Ok(writer.dump(&mut file)?)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn paths_are_unique_dmp_files() {
        let mut descriptor = MinidumpDescriptor::new("/tmp/dumps");
        assert!(descriptor.path().is_none());

        descriptor.update_path();
        let first = descriptor.path().unwrap().to_owned();
        descriptor.update_path();
        let second = descriptor.path().unwrap().to_owned();

        assert_ne!(first, second);
        assert_eq!(first.parent(), Some(Path::new("/tmp/dumps")));
        assert_eq!(first.extension().unwrap(), "dmp");
    }

    #[test]
    fn fd_descriptor_has_no_path() {
        let mut descriptor = MinidumpDescriptor::from_fd(42);
        descriptor.update_path();
        assert!(descriptor.is_fd());
        assert_eq!(descriptor.fd(), Some(42));
        assert!(descriptor.path().is_none());
        assert!(descriptor.directory().is_none());
    }

    #[test]
    fn options_reach_the_writer() {
        let mut descriptor = MinidumpDescriptor::new("/tmp");
        descriptor
            .set_size_limit(4096)
            .set_principal_mapping_address(0x1000)
            .set_sanitize_stacks(true);

        let mut writer = MinidumpWriter::new(1, 1);
        descriptor.configure(&mut writer);
        assert_eq!(writer.minidump_size_limit, Some(4096));
        assert_eq!(writer.principal_mapping_address, Some(0x1000));
        assert!(writer.skip_stacks_if_mapping_unreferenced);
        assert!(writer.sanitize_stack);
    }
}
