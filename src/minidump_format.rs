pub use minidump_common::format::{
    self, ArmElfHwCaps as MDCPUInformationARMElfHwCaps, PlatformId,
    ProcessorArchitecture as MDCPUArchitecture, GUID, LINK_MAP_64 as MDRawLinkMap,
    MINIDUMP_DIRECTORY as MDRawDirectory, MINIDUMP_EXCEPTION as MDException,
    MINIDUMP_EXCEPTION_STREAM as MDRawExceptionStream, MINIDUMP_HEADER as MDRawHeader,
    MINIDUMP_LOCATION_DESCRIPTOR as MDLocationDescriptor,
    MINIDUMP_MEMORY_DESCRIPTOR as MDMemoryDescriptor, MINIDUMP_MODULE as MDRawModule,
    MINIDUMP_SIGNATURE as MD_HEADER_SIGNATURE, MINIDUMP_STREAM_TYPE as MDStreamType,
    MINIDUMP_SYSTEM_INFO as MDRawSystemInfo, MINIDUMP_THREAD as MDRawThread,
    MINIDUMP_VERSION as MD_HEADER_VERSION, VS_FIXEDFILEINFO as MDVSFixedFileInfo,
};

pub use minidump_common::format::DSO_DEBUG_64 as MDRawDebug;

/// An RVA is an offset into the minidump file. The header sits at RVA 0.
pub type MDRVA = u32;

/// Signature written in front of the build id in each module's CodeView record
pub const MD_CVINFOELF_SIGNATURE: u32 = format::CvSignature::Elf as u32;

/// Exception code recorded when a dump was requested rather than caused by a
/// fatal signal
pub const MD_EXCEPTION_CODE_DUMP_REQUESTED: u32 = 0xFFFF_FFFF;

/// The number of streams the Linux writer emits, unused slots are zeroed
pub const MD_STREAM_COUNT: u32 = 13;

/// The directory entry of a stream that couldn't be written
pub const fn null_dirent() -> MDRawDirectory {
    MDRawDirectory {
        stream_type: 0,
        location: MDLocationDescriptor { data_size: 0, rva: 0 },
    }
}
