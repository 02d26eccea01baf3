#[macro_use]
pub mod signal_safe;

pub mod app_memory;
pub mod auxv;
pub mod crash_context;
pub mod crash_generation;
mod dso_debug;
mod dumper_cpu_info;
pub mod errors;
pub mod exception_handler;
pub mod maps_reader;
pub mod mem_reader;
pub mod minidump_descriptor;
pub mod minidump_writer;
pub mod module_reader;
pub mod page_allocator;
pub mod ptrace_dumper;
pub(crate) mod sections;
pub mod thread_info;

pub use maps_reader::LINUX_GATE_LIBRARY_NAME;
pub use page_allocator::DumperAllocator;
pub type Pid = i32;
