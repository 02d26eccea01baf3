//! Writes a minidump of a suspended process
//!
//! The streams are produced strictly in order, each one flushed to the
//! destination as soon as it is complete, so a writer that dies half way
//! still leaves the streams before it readable.

use {
    super::{
        Pid,
        app_memory::AppMemoryList,
        crash_context::{CpuContext, CrashContext},
        dso_debug,
        errors::WriterError,
        maps_reader::{MappingInfo, MappingList},
        ptrace_dumper::{Dumper, PtraceDumper},
        sections::*,
    },
    crate::{
        dir_section::{DirSection, DumpBuf},
        mem_writer::MemoryArrayWriter,
        minidump_format::*,
    },
    error_graph::{ErrorList, WriteErrorList},
    failspot::failspot,
    std::io::{Seek, Write},
};

type Result<T> = std::result::Result<T, WriterError>;

/// Thresholds deciding when the stacks of less important threads are cut
/// short to keep a dump within its size limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackLimits {
    /// Estimate for how big each thread's stack will be
    pub average_stack_len: usize,
    /// Number of threads whose stack size is never limited. These are the
    /// first threads of the enumeration, the crashing thread is never
    /// limited either.
    pub base_thread_count: usize,
    /// Maximum stack size to dump for any thread past the base count
    pub max_extra_thread_stack_len: usize,
    /// Room kept for everything that isn't stack memory
    pub fudge_factor: usize,
}

impl Default for StackLimits {
    fn default() -> Self {
        Self {
            average_stack_len: 8 * 1024,
            base_thread_count: 20,
            max_extra_thread_stack_len: 2 * 1024,
            fudge_factor: 64 * 1024,
        }
    }
}

/// Where the exception stream finds the registers of the thread it blames
#[derive(Debug, Default, Clone, Copy)]
pub enum CrashingThreadContext {
    #[default]
    None,
    /// The context of the crashing thread, as captured by the signal handler
    CrashContext(MDLocationDescriptor),
    /// The ptraced context of the blamed thread and its instruction pointer,
    /// for dumps requested without a crash
    CrashContextPlusAddress((MDLocationDescriptor, usize)),
}

#[derive(Debug)]
pub struct MinidumpWriter {
    pub(crate) process_id: Pid,
    pub(crate) blamed_thread: Pid,
    pub(crate) minidump_size_limit: Option<u64>,
    pub(crate) stack_limits: StackLimits,
    pub(crate) skip_stacks_if_mapping_unreferenced: bool,
    pub(crate) principal_mapping_address: Option<usize>,
    pub(crate) principal_mapping: Option<MappingInfo>,
    pub(crate) user_mapping_list: MappingList,
    pub(crate) app_memory: AppMemoryList,
    pub(crate) memory_blocks: Vec<MDMemoryDescriptor>,
    pub(crate) crash_context: Option<CrashContext>,
    pub(crate) crashing_thread_context: CrashingThreadContext,
    pub(crate) sanitize_stack: bool,
}

impl MinidumpWriter {
    /// A writer for `process`, blaming `blamed_thread` for the dump
    pub fn new(process: Pid, blamed_thread: Pid) -> Self {
        Self {
            process_id: process,
            blamed_thread,
            minidump_size_limit: None,
            stack_limits: StackLimits::default(),
            skip_stacks_if_mapping_unreferenced: false,
            principal_mapping_address: None,
            principal_mapping: None,
            user_mapping_list: MappingList::new(),
            app_memory: AppMemoryList::default(),
            memory_blocks: Vec::new(),
            crash_context: None,
            crashing_thread_context: CrashingThreadContext::None,
            sanitize_stack: false,
        }
    }

    pub fn set_minidump_size_limit(&mut self, limit: u64) -> &mut Self {
        self.minidump_size_limit = Some(limit);
        self
    }

    pub fn set_stack_limits(&mut self, limits: StackLimits) -> &mut Self {
        self.stack_limits = limits;
        self
    }

    pub fn set_user_mapping_list(&mut self, user_mapping_list: MappingList) -> &mut Self {
        self.user_mapping_list = user_mapping_list;
        self
    }

    pub fn set_app_memory(&mut self, app_memory: AppMemoryList) -> &mut Self {
        self.app_memory = app_memory;
        self
    }

    /// The register state captured by the signal handler, which replaces
    /// the ptrace view of the crashing thread
    pub fn set_crash_context(&mut self, crash_context: CrashContext) -> &mut Self {
        self.crash_context = Some(crash_context);
        self
    }

    /// Only dump stacks of threads that execute in, or point into, the
    /// mapping containing `principal_mapping_address`
    ///
    /// The dump fails altogether if the crashing thread doesn't reference
    /// that mapping.
    pub fn skip_stacks_if_mapping_unreferenced(
        &mut self,
        principal_mapping_address: usize,
    ) -> &mut Self {
        self.skip_stacks_if_mapping_unreferenced = true;
        self.principal_mapping_address = Some(principal_mapping_address);
        self
    }

    /// Scrub the stack copies of everything that isn't a pointer into
    /// executable code or the stack, or a small integer
    pub fn sanitize_stack(&mut self) -> &mut Self {
        self.sanitize_stack = true;
        self
    }

    /// Suspends the process and writes its minidump to `destination`
    ///
    /// Streams that could only be written partially or not at all are
    /// returned as soft errors.
    pub fn dump(
        &mut self,
        destination: &mut (impl Write + Seek),
    ) -> Result<ErrorList<WriterError>> {
        let mut dumper = PtraceDumper::new(self.process_id)?;
        self.dump_with(&mut dumper, destination)
    }

    /// Writes the minidump of the process behind `dumper`
    pub fn dump_with(
        &mut self,
        dumper: &mut impl Dumper,
        destination: &mut (impl Write + Seek),
    ) -> Result<ErrorList<WriterError>> {
        let mut soft_errors = ErrorList::default();

        dumper.suspend_threads(soft_errors.subwriter(WriterError::SuspendThreadsErrors))?;

        let result = self.check_principal_mapping(&*dumper).and_then(|()| {
            let mut buffer = DumpBuf::with_capacity(0);
            self.generate_dump(&mut buffer, &*dumper, &mut soft_errors, destination)
        });

        // Resumed here rather than on drop so failures are reported
        dumper.resume_threads(soft_errors.subwriter(WriterError::ResumeThreadsErrors));

        result.map(|()| soft_errors)
    }

    fn check_principal_mapping(&mut self, dumper: &impl Dumper) -> Result<()> {
        if !self.skip_stacks_if_mapping_unreferenced {
            return Ok(());
        }
        if let Some(address) = self.principal_mapping_address {
            self.principal_mapping = dumper.find_mapping_no_bias(address).cloned();
        }
        if !self.crash_thread_references_principal_mapping(dumper) {
            return Err(WriterError::PrincipalMappingNotReferenced);
        }
        Ok(())
    }

    /// Whether the crashing thread executes in the principal mapping or has
    /// a pointer into it on its stack
    fn crash_thread_references_principal_mapping(&self, dumper: &impl Dumper) -> bool {
        match &self.crash_context {
            Some(context) => self.references_principal_mapping(dumper, context),
            None => {
                let Some(idx) = dumper
                    .threads()
                    .iter()
                    .position(|tid| *tid == self.blamed_thread)
                else {
                    return false;
                };
                dumper
                    .get_thread_info_by_index(idx)
                    .is_ok_and(|info| self.references_principal_mapping(dumper, &info))
            }
        }
    }

    fn references_principal_mapping(&self, dumper: &impl Dumper, context: &impl CpuContext) -> bool {
        let Some(principal_mapping) = &self.principal_mapping else {
            return false;
        };

        let low_addr = principal_mapping.system_mapping_info.start_address;
        let high_addr = principal_mapping.system_mapping_info.end_address;
        let pc = context.get_instruction_pointer();
        if (low_addr..high_addr).contains(&pc) {
            return true;
        }

        let stack_pointer = context.get_stack_pointer();
        let Ok((stack, stack_len)) = dumper.get_stack_info(stack_pointer) else {
            return false;
        };
        let Ok(stack_copy) = dumper.copy_from_process(self.blamed_thread, stack, stack_len) else {
            return false;
        };
        principal_mapping.stack_has_pointer_to_mapping(stack_copy, stack_pointer - stack)
    }

    fn generate_dump(
        &mut self,
        buffer: &mut DumpBuf,
        dumper: &impl Dumper,
        soft_errors: &mut ErrorList<WriterError>,
        destination: &mut (impl Write + Seek),
    ) -> Result<()> {
        let time_date_stamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)?
            .as_secs() as u32;
        let mut dir_section = DirSection::new(buffer, MD_STREAM_COUNT, time_date_stamp, destination)?;

        // Ensure the header gets flushed. If we crash somewhere below,
        // we should have a mostly-intact dump
        dir_section.write_to_file(buffer, None)?;

        let dirent = thread_list_stream::write(
            self,
            buffer,
            dumper,
            soft_errors.subwriter(WriterError::WriteThreadListErrors),
        )?;
        dir_section.write_to_file(buffer, Some(dirent))?;

        let dirent = mappings::write(
            self,
            buffer,
            dumper,
            soft_errors.subwriter(WriterError::WriteMappingsErrors),
        )?;
        dir_section.write_to_file(buffer, Some(dirent))?;

        app_memory::write(
            self,
            buffer,
            dumper,
            soft_errors.subwriter(WriterError::WriteAppMemoryErrors),
        )?;
        dir_section.write_to_file(buffer, None)?;

        let dirent = memory_list_stream::write(self, buffer)?;
        dir_section.write_to_file(buffer, Some(dirent))?;

        let dirent = exception_stream::write(self, buffer)?;
        dir_section.write_to_file(buffer, Some(dirent))?;

        let dirent = systeminfo_stream::write(
            buffer,
            soft_errors.subwriter(WriterError::WriteSystemInfoErrors),
        )?;
        dir_section.write_to_file(buffer, Some(dirent))?;

        let dirent = write_file_stream(
            buffer,
            "/proc/cpuinfo".to_owned(),
            MDStreamType::LinuxCpuInfo,
            soft_errors,
        )?;
        dir_section.write_to_file(buffer, Some(dirent))?;

        let path = format!("/proc/{}/status", self.blamed_thread);
        let dirent = failspot!(if ProcStatusRead {
            soft_errors.push(injected_read_failure(path));
            null_dirent()
        } else {
            write_file_stream(buffer, path, MDStreamType::LinuxProcStatus, soft_errors)?
        });
        dir_section.write_to_file(buffer, Some(dirent))?;

        let path = "/etc/lsb-release".to_owned();
        let dirent = failspot!(if LsbReleaseRead {
            soft_errors.push(injected_read_failure(path));
            null_dirent()
        } else {
            write_file_stream(buffer, path, MDStreamType::LinuxLsbRelease, soft_errors)?
        });
        dir_section.write_to_file(buffer, Some(dirent))?;

        for (file, stream_type) in [
            ("cmdline", MDStreamType::LinuxCmdLine),
            ("environ", MDStreamType::LinuxEnviron),
            ("auxv", MDStreamType::LinuxAuxv),
            ("maps", MDStreamType::LinuxMaps),
        ] {
            let path = format!("/proc/{}/{file}", self.blamed_thread);
            let dirent = write_file_stream(buffer, path, stream_type, soft_errors)?;
            dir_section.write_to_file(buffer, Some(dirent))?;
        }

        let dirent = match dso_debug::write(buffer, dumper, self.blamed_thread) {
            Ok(dirent) => dirent,
            Err(e) => {
                soft_errors.push(WriterError::SectionDsoDebugError(e));
                null_dirent()
            }
        };
        dir_section.write_to_file(buffer, Some(dirent))?;

        // If you add more directory entries, don't forget to update
        // MD_STREAM_COUNT
        dir_section.finish(buffer)?;
        Ok(())
    }
}

/// Embeds `path` verbatim as `stream_type`, a file that can't be read gives
/// a nulled directory entry
fn write_file_stream(
    buffer: &mut DumpBuf,
    path: String,
    stream_type: MDStreamType,
    soft_errors: &mut ErrorList<WriterError>,
) -> Result<MDRawDirectory> {
    let content = match std::fs::read(&path) {
        Ok(content) => content,
        Err(e) => {
            soft_errors.push(WriterError::ReadFileFailed(path, e));
            return Ok(null_dirent());
        }
    };

    let section = MemoryArrayWriter::write_bytes(buffer, &content)?;
    Ok(MDRawDirectory {
        stream_type: stream_type as u32,
        location: section.location(),
    })
}

fn injected_read_failure(path: String) -> WriterError {
    WriterError::ReadFileFailed(
        path,
        std::io::Error::new(std::io::ErrorKind::NotFound, "injected failure"),
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_stack_limits() {
        let limits = StackLimits::default();
        assert_eq!(limits.average_stack_len, 8192);
        assert_eq!(limits.base_thread_count, 20);
        assert_eq!(limits.max_extra_thread_stack_len, 2048);
        assert_eq!(limits.fudge_factor, 65536);
    }

    #[test]
    fn builder_sets_options() {
        let mut writer = MinidumpWriter::new(1, 2);
        writer
            .set_minidump_size_limit(1024)
            .skip_stacks_if_mapping_unreferenced(0x1000)
            .sanitize_stack();

        assert_eq!(writer.minidump_size_limit, Some(1024));
        assert!(writer.skip_stacks_if_mapping_unreferenced);
        assert_eq!(writer.principal_mapping_address, Some(0x1000));
        assert!(writer.sanitize_stack);
        assert_eq!(writer.blamed_thread, 2);
    }

    #[test]
    fn missing_file_is_a_nulled_stream() {
        let mut buffer = DumpBuf::with_capacity(0);
        let mut soft_errors = ErrorList::default();
        let dirent = write_file_stream(
            &mut buffer,
            "/nonexistent/lsb-release".to_owned(),
            MDStreamType::LinuxLsbRelease,
            &mut soft_errors,
        )
        .unwrap();

        assert_eq!(dirent.stream_type, 0);
        assert_eq!(dirent.location.rva, 0);
        assert_eq!(dirent.location.data_size, 0);
        assert!(matches!(
            soft_errors.iter().collect::<Vec<_>>().as_slice(),
            [WriterError::ReadFileFailed(path, _)] if path == "/nonexistent/lsb-release"
        ));
        assert_eq!(buffer.position(), 0);
    }
}
