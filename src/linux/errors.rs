use {
    super::Pid,
    crate::serializers::*,
    error_graph::ErrorList,
    procfs_core::ProcError,
    std::ffi::OsString,
    thiserror::Error,
};

pub use super::{
    auxv::AuxvError, mem_reader::CopyFromProcessError, page_allocator::PageAllocatorError,
};
pub use crate::{dir_section::FileWriterError, mem_writer::MemoryWriterError};

#[derive(Debug, Error, serde::Serialize)]
pub enum InitError {
    #[error("failed to read auxv")]
    ReadAuxvFailed(#[source] AuxvError),
    #[error("IO error for file {0}")]
    IOError(
        String,
        #[source]
        #[serde(serialize_with = "serialize_io_error")]
        std::io::Error,
    ),
    #[error("Process {0} is our own process, it can't be ptraced")]
    CannotPtraceSameProcess(Pid),
    #[error("/proc/{0}/task is not a directory")]
    ProcPidTaskNotDirectory(Pid),
    #[error("Failed to read an entry of /proc/<pid>/task")]
    ReadProcessThreadEntryFailed(
        #[source]
        #[serde(serialize_with = "serialize_io_error")]
        std::io::Error,
    ),
    #[error("Task entry {0:?} is not a thread id")]
    ProcessTaskEntryNotTid(OsString),
    #[error("Failed to enumerate threads")]
    EnumerateThreadsFailed(#[source] Box<InitError>),
    #[error("Failed to enumerate mappings")]
    EnumerateMappingsFailed(#[source] MapsReaderError),
    #[error("No threads left to dump after suspending")]
    NoThreads,
}

#[derive(Debug, Error, serde::Serialize)]
pub enum MapsReaderError {
    #[error("Failed to open {0}")]
    OpenFailed(
        String,
        #[source]
        #[serde(serialize_with = "serialize_io_error")]
        std::io::Error,
    ),
    #[error("Failed to parse /proc/<pid>/maps")]
    ParseFailed(
        #[from]
        #[serde(serialize_with = "serialize_proc_error")]
        ProcError,
    ),
    #[error("Mapping has no name")]
    AnonymousMapping,
    #[error("Mapping name is not valid UTF-8: {0:?}")]
    NonUtf8Name(OsString),
}

#[derive(Debug, Error, serde::Serialize)]
pub enum ThreadInfoError {
    #[error("Index {index} is out of bounds, only {length} thread(s) are known")]
    IndexOutOfBounds { index: usize, length: usize },
    #[error("Failed to read /proc/{0}/status")]
    ProcStatusFailed(
        Pid,
        #[source]
        #[serde(serialize_with = "serialize_proc_error")]
        ProcError,
    ),
    #[error("ptrace failed to read the registers")]
    PtraceError(
        #[from]
        #[serde(serialize_with = "serialize_nix_error")]
        nix::Error,
    ),
}

#[derive(Debug, Error, serde::Serialize)]
pub enum ModuleReaderError {
    #[error("failed to read module memory: {length} bytes at {offset}: {error}")]
    ReadModuleMemory {
        offset: u64,
        length: u64,
        #[source]
        #[serde(serialize_with = "serialize_io_error")]
        error: std::io::Error,
    },
    #[error("failed to parse ELF memory: {0}")]
    Parsing(
        #[from]
        #[serde(serialize_with = "serialize_goblin_error")]
        goblin::error::Error,
    ),
    #[error("failed to read ELF data: {0}")]
    Scroll(
        #[from]
        #[serde(serialize_with = "serialize_scroll_error")]
        scroll::Error,
    ),
    #[error("no section string table")]
    NoStrTab,
    #[error("no dynamic section")]
    NoDynamicSection,
    #[error("no dynamic string table section")]
    NoDynStrSection,
    #[error("a string in the strtab did not have a terminating nul byte")]
    StrTabNoNulByte,
    #[error("no SONAME found in dynamic linking information")]
    NoSoNameEntry,
    #[error("no build id note in program headers")]
    NoProgramHeaderNote,
    #[error("no build id note in sections")]
    NoSectionNote,
    #[error("no executable text section")]
    NoTextSection,
    #[error("the module has no section headers")]
    NoSections,
    #[error(
        "no build id found; program headers: {program_headers}, sections: {section}, generated: {generated}"
    )]
    NoBuildId {
        program_headers: Box<Self>,
        section: Box<Self>,
        generated: Box<Self>,
    },
}

#[derive(Debug, Error, serde::Serialize)]
pub enum DumperError {
    #[error("Failed to copy memory from process")]
    CopyFromProcessError(#[from] CopyFromProcessError),
    #[error("Out of scratch memory")]
    AllocationFailed(#[from] PageAllocatorError),
    #[error("Failed to attach to thread {0}")]
    PtraceAttachError(
        Pid,
        #[source]
        #[serde(serialize_with = "serialize_nix_error")]
        nix::Error,
    ),
    #[error("Failed to detach from thread {0}")]
    PtraceDetachError(
        Pid,
        #[source]
        #[serde(serialize_with = "serialize_nix_error")]
        nix::Error,
    ),
    #[error("waitpid for thread {0} failed")]
    WaitPidError(
        Pid,
        #[source]
        #[serde(serialize_with = "serialize_nix_error")]
        nix::Error,
    ),
    #[error("Skipped thread {0} due to it being part of the seccomp sandbox's trusted code")]
    DetachSkippedThread(Pid),
    #[error("No mapping for stack pointer found")]
    NoStackPointerMapping,
    #[error("None of the {0} thread(s) could be suspended")]
    SuspendNoThreadsLeft(usize),
    #[error("Failed to get thread info")]
    ThreadInfoError(#[from] ThreadInfoError),
    #[error("Failed to read the module {0:?}")]
    ModuleReadFailed(OsString, #[source] ModuleReaderError),
    #[error("Not safe to open mapping {0:?}")]
    NotSafeToOpenMapping(OsString),
    #[error("Failed to map {0:?} for reading")]
    MmapFailed(
        OsString,
        #[source]
        #[serde(serialize_with = "serialize_io_error")]
        std::io::Error,
    ),
    #[error("Mapping has no name")]
    AnonymousMapping,
}

#[derive(Debug, Error, serde::Serialize)]
pub enum SectionThreadListError {
    #[error("Failed to write to memory")]
    MemoryWriterError(#[from] MemoryWriterError),
    #[error("Failed integer conversion")]
    TryFromIntError(
        #[from]
        #[serde(skip)]
        std::num::TryFromIntError,
    ),
    #[error("Failed to get the registers of thread {0}")]
    ThreadInfoFailed(Pid, #[source] ThreadInfoError),
    #[error("Failed to capture the stack of thread {0}")]
    StackCaptureFailed(Pid, #[source] DumperError),
    #[error("Failed to capture the memory around the instruction pointer of thread {0}")]
    InstructionMemoryFailed(Pid, #[source] DumperError),
}

#[derive(Debug, Error, serde::Serialize)]
pub enum SectionMappingsError {
    #[error("Failed to write to memory")]
    MemoryWriterError(#[from] MemoryWriterError),
    #[error("Failed integer conversion")]
    TryFromIntError(
        #[from]
        #[serde(skip)]
        std::num::TryFromIntError,
    ),
    #[error("Failed to get the identifier of {0:?}")]
    IdentifierFailed(OsString, #[source] DumperError),
}

#[derive(Debug, Error, serde::Serialize)]
pub enum SectionAppMemoryError {
    #[error("Failed to copy application memory at {address:#x}")]
    CopyFailed {
        address: usize,
        #[source]
        source: DumperError,
    },
    #[error("Failed to write to memory")]
    MemoryWriterError(#[from] MemoryWriterError),
}

#[derive(Debug, Error, serde::Serialize)]
pub enum SectionMemListError {
    #[error("Failed to write to memory")]
    MemoryWriterError(#[from] MemoryWriterError),
}

#[derive(Debug, Error, serde::Serialize)]
pub enum SectionExceptionStreamError {
    #[error("Failed to write to memory")]
    MemoryWriterError(#[from] MemoryWriterError),
}

#[derive(Debug, Error, serde::Serialize)]
pub enum SectionSystemInfoError {
    #[error("Failed to write to memory")]
    MemoryWriterError(#[from] MemoryWriterError),
    #[error("Failed to get CPU info")]
    CpuInfoError(#[from] CpuInfoError),
    #[error("uname failed")]
    UnameFailed(
        #[source]
        #[serde(serialize_with = "serialize_nix_error")]
        nix::Error,
    ),
}

#[derive(Debug, Error, serde::Serialize)]
pub enum SectionDsoDebugError {
    #[error("Failed to write to memory")]
    MemoryWriterError(#[from] MemoryWriterError),
    #[error("Could not find: {0}")]
    CouldNotFind(&'static str),
    #[error("Failed to copy memory from process")]
    CopyFromProcessError(#[from] DumperError),
    #[error("Failed to parse the linker's structures")]
    ParseFailed(
        #[from]
        #[serde(serialize_with = "serialize_scroll_error")]
        scroll::Error,
    ),
    #[error("Failed integer conversion")]
    TryFromIntError(
        #[from]
        #[serde(skip)]
        std::num::TryFromIntError,
    ),
}

#[derive(Debug, Error, serde::Serialize)]
pub enum CpuInfoError {
    #[error("IO error for file {0}")]
    IOError(
        String,
        #[source]
        #[serde(serialize_with = "serialize_io_error")]
        std::io::Error,
    ),
    #[error("Not all entries of /proc/cpuinfo found")]
    NotAllProcEntriesFound,
    #[error("Couldn't parse the CPU ranges in {0}")]
    InvalidRange(String),
}

#[derive(Debug, Error, serde::Serialize)]
pub enum WriterError {
    #[error("Error during init phase")]
    InitError(#[from] InitError),
    #[error("Errors occurred while suspending threads")]
    SuspendThreadsErrors(#[source] ErrorList<DumperError>),
    #[error("Errors occurred while resuming threads")]
    ResumeThreadsErrors(#[source] ErrorList<DumperError>),
    #[error("Crashing thread does not reference the principal mapping")]
    PrincipalMappingNotReferenced,
    #[error("Errors occurred while writing the thread list")]
    WriteThreadListErrors(#[source] ErrorList<SectionThreadListError>),
    #[error("Failed to write the thread list")]
    SectionThreadListError(#[from] SectionThreadListError),
    #[error("Errors occurred while writing the module list")]
    WriteMappingsErrors(#[source] ErrorList<SectionMappingsError>),
    #[error("Failed to write the module list")]
    SectionMappingsError(#[from] SectionMappingsError),
    #[error("Errors occurred while writing application memory")]
    WriteAppMemoryErrors(#[source] ErrorList<SectionAppMemoryError>),
    #[error("Failed to write application memory")]
    SectionAppMemoryError(#[from] SectionAppMemoryError),
    #[error("Failed to write the memory list")]
    SectionMemListError(#[from] SectionMemListError),
    #[error("Failed to write the exception stream")]
    SectionExceptionStreamError(#[from] SectionExceptionStreamError),
    #[error("Errors occurred while writing the system info")]
    WriteSystemInfoErrors(#[source] ErrorList<SectionSystemInfoError>),
    #[error("Failed to write the system info")]
    SectionSystemInfoError(#[from] SectionSystemInfoError),
    #[error("Failed to write the DSO debug stream")]
    SectionDsoDebugError(#[from] SectionDsoDebugError),
    #[error("Failed to read {0}")]
    ReadFileFailed(
        String,
        #[source]
        #[serde(serialize_with = "serialize_io_error")]
        std::io::Error,
    ),
    #[error("Failed to write to memory buffer")]
    MemoryWriterError(#[from] MemoryWriterError),
    #[error("Failed to write to file")]
    FileWriterError(#[from] FileWriterError),
    #[error("Failed to get current timestamp when writing header of minidump")]
    SystemTimeError(
        #[from]
        #[serde(serialize_with = "serialize_system_time_error")]
        std::time::SystemTimeError,
    ),
    #[error("Failed to set up the dumper")]
    DumperError(#[from] DumperError),
}

#[derive(Debug, Error, serde::Serialize)]
pub enum HandlerError {
    #[error("Failed to set up the alternate signal stack")]
    AltStack(
        #[source]
        #[serde(serialize_with = "serialize_nix_error")]
        nix::Error,
    ),
    #[error("Failed to create the minidump destination")]
    Destination(
        #[source]
        #[serde(serialize_with = "serialize_io_error")]
        std::io::Error,
    ),
    #[error("The descriptor has no path, update_path was not called")]
    NoPath,
    #[error("Failed to install the signal handlers")]
    InstallHandlers(
        #[source]
        #[serde(serialize_with = "serialize_nix_error")]
        nix::Error,
    ),
    #[error("Mapping of {size:#x} bytes at {start:#x} wraps the address space")]
    MappingOverflow { start: usize, size: usize },
    #[error("Failed to write the minidump")]
    Writer(#[from] WriterError),
}

#[derive(Debug, Error, serde::Serialize)]
pub enum CrashGenerationError {
    #[error("Socket IO failed")]
    Io(
        #[from]
        #[serde(serialize_with = "serialize_nix_error")]
        nix::Error,
    ),
    #[error("Crash request of {actual} bytes does not match the expected {expected}")]
    InvalidSize { expected: usize, actual: usize },
    #[error("Crash request carried no acknowledgement descriptor")]
    MissingAckFd,
    #[error("The crash server closed the connection")]
    Disconnected,
}
