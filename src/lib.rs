cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        mod linux;

        pub use linux::*;
    } else {
        compile_error!("minidump-handler only supports Linux and Android");
    }
}

pub mod minidump_cpu;
pub mod minidump_format;

pub mod dir_section;
pub mod mem_writer;

mod serializers;

failspot::failspot_name! {
    pub enum FailSpotName {
        SuspendThreads,
        FillMissingAuxvInfo,
        CpuInfoFileOpen,
        ProcStatusRead,
        LsbReleaseRead,
        CloneDumper,
    }
}
