pub mod app_memory;
pub mod exception_stream;
pub mod mappings;
pub mod memory_list_stream;
pub mod systeminfo_stream;
pub mod thread_list_stream;

use crate::{
    dir_section::DumpBuf,
    linux::{
        Pid,
        errors::{self},
        minidump_writer::{CrashingThreadContext, MinidumpWriter},
        ptrace_dumper::Dumper,
    },
    mem_writer::*,
    minidump_format::*,
};
