//! Introspection of a live process through ptrace
//!
//! The [`Dumper`] trait is the capability set the minidump writer needs from
//! a process: its threads, mappings and memory. Everything that can be
//! derived from those (stack bounds, module identifiers, stack sanitizing)
//! is provided as default methods, so a dumper working from a core file only
//! has to supply the raw data. [`PtraceDumper`] is the live variant.

use {
    super::{
        Pid,
        auxv::AuxvDumpInfo,
        errors::{DumperError, InitError, ThreadInfoError},
        maps_reader::MappingInfo,
        mem_reader::{CopyFromProcessError, MemReader},
        module_reader::{BuildId, ProcessModuleMemory, ReadFromModule, SoName},
        page_allocator::PageAllocator,
        thread_info::ThreadInfo,
    },
    error_graph::WriteErrorList,
    failspot::failspot,
    nix::{
        errno::Errno,
        sys::{ptrace, wait},
    },
    std::{
        ffi::{OsStr, OsString},
        os::unix::ffi::OsStrExt,
        path,
    },
};

/// The most stack captured for a single thread
pub const STACK_TO_CAPTURE: usize = 32 * 1024;

/// What a scrubbed stack word is replaced with
#[cfg(target_pointer_width = "64")]
pub const DEFACED_VALUE: usize = 0x0defaced0defaced;
#[cfg(target_pointer_width = "32")]
pub const DEFACED_VALUE: usize = 0x0defaced;

/// Values within this distance of zero are kept when sanitizing, they are
/// rarely sensitive and often useful
const SMALL_INT_MAGNITUDE: isize = 4096;

pub trait Dumper {
    fn pid(&self) -> Pid;
    fn is_post_mortem(&self) -> bool;
    /// The threads of the process, in enumeration order
    fn threads(&self) -> &[Pid];
    fn mappings(&self) -> &[MappingInfo];
    fn auxv(&self) -> &AuxvDumpInfo;
    /// Scratch memory for copies of the target's memory
    fn allocator(&self) -> &PageAllocator;

    /// Stops every thread, dropping the ones that can't be stopped from
    /// [`Self::threads`]
    ///
    /// Fails only if no thread at all could be stopped.
    fn suspend_threads(
        &mut self,
        soft_errors: impl WriteErrorList<DumperError>,
    ) -> Result<(), DumperError>;
    fn resume_threads(&mut self, soft_errors: impl WriteErrorList<DumperError>);

    fn get_thread_info_by_index(&self, index: usize) -> Result<ThreadInfo, ThreadInfoError>;

    /// Copies `length` bytes at `src` in the address space of `child` into
    /// the scratch arena
    #[allow(clippy::mut_from_ref)]
    fn copy_from_process(
        &self,
        child: Pid,
        src: usize,
        length: usize,
    ) -> Result<&mut [u8], DumperError>;

    #[inline]
    fn page_size(&self) -> usize {
        self.allocator().page_size()
    }

    /// Finds the mapping `address` falls in
    fn find_mapping(&self, address: usize) -> Option<&MappingInfo> {
        self.mappings()
            .iter()
            .find(|map| map.contains_address(address))
    }

    /// Like [`Self::find_mapping`], but using the range the kernel reported
    /// instead of the one grown by folded reserved gaps
    fn find_mapping_no_bias(&self, address: usize) -> Option<&MappingInfo> {
        self.mappings().iter().find(|map| {
            address >= map.system_mapping_info.start_address
                && address < map.system_mapping_info.end_address
        })
    }

    /// Returns the start and length of the stack to capture for a thread
    /// whose stack pointer is `stack_pointer`
    ///
    /// Starts at the page holding the stack pointer and ends after
    /// [`STACK_TO_CAPTURE`] bytes or at the end of the mapping.
    fn get_stack_info(&self, stack_pointer: usize) -> Result<(usize, usize), DumperError> {
        let stack_pointer = stack_pointer & !(self.page_size() - 1);
        let mapping = self
            .find_mapping(stack_pointer)
            .ok_or(DumperError::NoStackPointerMapping)?;

        let offset = stack_pointer - mapping.start_address;
        let distance_to_end = mapping.size - offset;
        Ok((stack_pointer, distance_to_end.min(STACK_TO_CAPTURE)))
    }

    /// Scrubs a copy of a stack of everything that isn't obviously a code or
    /// stack pointer or a small integer
    ///
    /// `sp_offset` is the offset of `stack_pointer` into `stack_copy`,
    /// everything below it is zeroed.
    fn sanitize_stack_copy(&self, stack_copy: &mut [u8], stack_pointer: usize, sp_offset: usize) {
        const WORD: usize = std::mem::size_of::<usize>();
        // A bloom filter over the executable mappings, 2^11 bits indexed by
        // the address shifted by the same amount on every architecture
        const TEST_BITS: u32 = 11;
        const ARRAY_SIZE: usize = 1 << (TEST_BITS - 3);
        const ARRAY_MASK: usize = ARRAY_SIZE - 1;
        const SHIFT: u32 = 32 - 11;

        let stack_mapping = self.find_mapping_no_bias(stack_pointer);
        let contains = |map: &MappingInfo, addr: usize| {
            addr >= map.system_mapping_info.start_address
                && addr < map.system_mapping_info.end_address
        };

        let mut could_hit_mapping = [0u8; ARRAY_SIZE];
        for map in self.mappings().iter().filter(|map| map.is_executable()) {
            let start = map.start_address >> SHIFT;
            let end = (map.start_address + map.size) >> SHIFT;
            if end - start >= ARRAY_SIZE * 8 {
                could_hit_mapping.fill(0xff);
                break;
            }
            for bit in start..=end {
                could_hit_mapping[(bit >> 3) & ARRAY_MASK] |= 1 << (bit & 7);
            }
        }

        let offset = sp_offset.next_multiple_of(WORD).min(stack_copy.len());
        stack_copy[..offset].fill(0);

        let mut last_hit_mapping: Option<&MappingInfo> = None;
        let mut chunks = stack_copy[offset..].chunks_exact_mut(WORD);
        for chunk in chunks.by_ref() {
            let mut word = [0u8; WORD];
            word.copy_from_slice(chunk);
            let addr = usize::from_ne_bytes(word);

            if (-SMALL_INT_MAGNITUDE..=SMALL_INT_MAGNITUDE).contains(&(addr as isize)) {
                continue;
            }
            if stack_mapping.is_some_and(|map| contains(map, addr)) {
                continue;
            }
            if last_hit_mapping.is_some_and(|map| contains(map, addr)) {
                continue;
            }

            let test = addr >> SHIFT;
            if could_hit_mapping[(test >> 3) & ARRAY_MASK] & (1 << (test & 7)) != 0 {
                if let Some(hit) = self
                    .find_mapping_no_bias(addr)
                    .filter(|map| map.is_executable())
                {
                    last_hit_mapping = Some(hit);
                    continue;
                }
            }

            chunk.copy_from_slice(&DEFACED_VALUE.to_ne_bytes());
        }
        // A partial word at the top of the copy
        chunks.into_remainder().fill(0);
    }

    /// Reads `T` from the ELF image behind `mapping`
    ///
    /// The file is preferred. The vdso has no file, and a file that can't be
    /// opened any more falls back to the image in the target's memory.
    fn read_from_mapping<T: ReadFromModule>(&self, mapping: &MappingInfo) -> Result<T, DumperError> {
        let name = mapping.name.as_deref().ok_or(DumperError::AnonymousMapping)?;

        let from_process = || {
            let reader = MemReader::new(self.pid());
            T::read_from_module(ProcessModuleMemory::new(
                &reader,
                mapping.start_address,
                mapping.size,
            ))
            .map_err(|e| DumperError::ModuleReadFailed(name.to_owned(), e))
        };

        if mapping.is_linux_gate() {
            return from_process();
        }

        // Opening a device node can have side effects
        if name.as_bytes().starts_with(b"/dev/") {
            return Err(DumperError::NotSafeToOpenMapping(name.to_owned()));
        }

        read_from_file::<T>(name).or_else(|file_err| {
            if mapping.offset == 0 {
                from_process().map_err(|_| file_err)
            } else {
                Err(file_err)
            }
        })
    }

    /// The build id of the module behind `mapping`, or the identifier
    /// synthesized from its text if it has none
    fn elf_identifier_for_mapping(&self, mapping: &MappingInfo) -> Result<BuildId, DumperError> {
        self.read_from_mapping(mapping)
    }

    /// The path and file name recorded for `mapping` in the module list
    ///
    /// Symbol files are keyed on `DT_SONAME` where there is one, so the file
    /// name is replaced with it. A library mapped from inside an archive
    /// (an apk) gets the soname appended to the archive path instead.
    fn get_mapping_effective_path_and_name(
        &self,
        mapping: &MappingInfo,
    ) -> Result<(OsString, OsString), DumperError> {
        let path = mapping.name.clone().ok_or(DumperError::AnonymousMapping)?;

        let soname = if mapping.is_linux_gate() {
            None
        } else {
            self.read_from_mapping::<SoName>(mapping).ok()
        };

        let Some(SoName(soname)) = soname else {
            let file_name = path::Path::new(&path)
                .file_name()
                .map(OsStr::to_owned)
                .unwrap_or_else(|| path.clone());
            return Ok((path, file_name));
        };

        let file_name = OsString::from(soname);
        let file_path = if mapping.is_executable() && mapping.offset != 0 {
            path::Path::new(&path).join(&file_name)
        } else {
            path::Path::new(&path).with_file_name(&file_name)
        };
        Ok((file_path.into_os_string(), file_name))
    }
}

fn read_from_file<T: ReadFromModule>(name: &OsStr) -> Result<T, DumperError> {
    let file =
        std::fs::File::open(name).map_err(|e| DumperError::MmapFailed(name.to_owned(), e))?;
    // SAFETY: the mapping is only read, and only for the duration of the
    // parse. A concurrent truncation of the file is the caller's problem.
    let mmap = unsafe { memmap2::Mmap::map(&file) }
        .map_err(|e| DumperError::MmapFailed(name.to_owned(), e))?;
    T::read_from_module(&*mmap).map_err(|e| DumperError::ModuleReadFailed(name.to_owned(), e))
}

/// A live process, inspected through ptrace and procfs
#[derive(Debug)]
pub struct PtraceDumper {
    pid: Pid,
    threads_suspended: bool,
    threads: Vec<Pid>,
    auxv: AuxvDumpInfo,
    mappings: Vec<MappingInfo>,
    allocator: PageAllocator,
}

impl Drop for PtraceDumper {
    fn drop(&mut self) {
        // Always try to resume all threads, a thread left stopped would
        // freeze the target
        self.resume_threads(error_graph::strategy::DontCare);
    }
}

impl PtraceDumper {
    /// Constructs a dumper for extracting information from the process `pid`
    pub fn new(pid: Pid) -> Result<Self, InitError> {
        if pid == nix::unistd::getpid().as_raw() {
            return Err(InitError::CannotPtraceSameProcess(pid));
        }

        let mut dumper = Self {
            pid,
            threads_suspended: false,
            threads: Vec::new(),
            auxv: AuxvDumpInfo::default(),
            mappings: Vec::new(),
            allocator: PageAllocator::new(),
        };
        dumper.init()?;
        Ok(dumper)
    }

    fn init(&mut self) -> Result<(), InitError> {
        self.auxv = AuxvDumpInfo::read(self.pid).map_err(InitError::ReadAuxvFailed)?;
        self.enumerate_threads()
            .map_err(|e| InitError::EnumerateThreadsFailed(Box::new(e)))?;
        self.enumerate_mappings()?;
        Ok(())
    }

    /// Lists the threads in `/proc/<pid>/task`
    fn enumerate_threads(&mut self) -> Result<(), InitError> {
        let pid = self.pid;
        let task_path = format!("/proc/{pid}/task");
        if !path::Path::new(&task_path).is_dir() {
            return Err(InitError::ProcPidTaskNotDirectory(pid));
        }

        let entries =
            std::fs::read_dir(&task_path).map_err(|e| InitError::IOError(task_path, e))?;
        for entry in entries {
            let file_name = entry
                .map_err(InitError::ReadProcessThreadEntryFailed)?
                .file_name();
            let tid = file_name
                .to_str()
                .and_then(|name| name.parse::<Pid>().ok())
                .ok_or_else(|| InitError::ProcessTaskEntryNotTid(file_name.clone()))?;
            self.threads.push(tid);
        }

        if self.threads.is_empty() {
            return Err(InitError::NoThreads);
        }
        Ok(())
    }

    fn enumerate_mappings(&mut self) -> Result<(), InitError> {
        // The vdso doesn't show up in the maps with a name, but its location
        // is in the auxv
        let linux_gate_loc = self.auxv.get_linux_gate_address();
        self.mappings = MappingInfo::read_from_process(self.pid, linux_gate_loc)
            .map_err(InitError::EnumerateMappingsFailed)?;

        for mapping in &mut self.mappings {
            if !mapping.is_executable() {
                continue;
            }
            let renamed = mapping
                .name
                .as_deref()
                .and_then(|name| MappingInfo::handle_deleted_file_in_mapping(name, self.pid));
            if let Some(exe_link) = renamed {
                mapping.name = Some(exe_link);
            }
        }

        // Consumers take the first module to be the main executable, which
        // isn't necessarily the first mapping. The entry point tells which
        // one it is.
        if let Some(entry_point) = self.auxv.get_entry_address() {
            let entry_point = entry_point as usize;
            if let Some(idx) = self
                .mappings
                .iter()
                .position(|mapping| mapping.contains_address(entry_point))
            {
                self.mappings[..=idx].rotate_right(1);
            }
        }
        Ok(())
    }

    /// Stops `child` by attaching to it
    ///
    /// Threads that run trusted code of the seccomp sandbox have a stack
    /// pointer of 0, their stacks are meaningless and they are detached
    /// again.
    pub fn suspend_thread(&self, child: Pid) -> Result<(), DumperError> {
        let pid = nix::unistd::Pid::from_raw(child);
        // This may fail if the thread has just died or is being debugged
        ptrace::attach(pid).map_err(|e| DumperError::PtraceAttachError(child, e))?;
        loop {
            match wait::waitpid(pid, Some(wait::WaitPidFlag::__WALL)) {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    let _ = ptrace::detach(pid, None);
                    return Err(DumperError::WaitPidError(child, e));
                }
            }
        }

        let skip_thread = ThreadInfo::create(self.pid, child)
            .map(|info| info.stack_pointer == 0)
            .unwrap_or(true);
        if skip_thread {
            ptrace::detach(pid, None).map_err(|e| DumperError::PtraceDetachError(child, e))?;
            return Err(DumperError::DetachSkippedThread(child));
        }
        Ok(())
    }

    /// Resumes `child` by detaching from it
    pub fn resume_thread(&self, child: Pid) -> Result<(), DumperError> {
        let pid = nix::unistd::Pid::from_raw(child);
        ptrace::detach(pid, None).map_err(|e| DumperError::PtraceDetachError(child, e))
    }
}

impl Dumper for PtraceDumper {
    #[inline]
    fn pid(&self) -> Pid {
        self.pid
    }

    #[inline]
    fn is_post_mortem(&self) -> bool {
        false
    }

    #[inline]
    fn threads(&self) -> &[Pid] {
        &self.threads
    }

    #[inline]
    fn mappings(&self) -> &[MappingInfo] {
        &self.mappings
    }

    #[inline]
    fn auxv(&self) -> &AuxvDumpInfo {
        &self.auxv
    }

    #[inline]
    fn allocator(&self) -> &PageAllocator {
        &self.allocator
    }

    fn suspend_threads(
        &mut self,
        mut soft_errors: impl WriteErrorList<DumperError>,
    ) -> Result<(), DumperError> {
        let num_threads = self.threads.len();

        failspot!(SuspendThreads self.threads.clear());

        // Threads that vanished or can't be attached are dropped from the
        // list, they can't be dumped
        let threads = std::mem::take(&mut self.threads);
        for tid in threads {
            match self.suspend_thread(tid) {
                Ok(()) => self.threads.push(tid),
                Err(e) => soft_errors.push(e),
            }
        }

        if self.threads.is_empty() {
            return Err(DumperError::SuspendNoThreadsLeft(num_threads));
        }
        self.threads_suspended = true;
        Ok(())
    }

    fn resume_threads(&mut self, mut soft_errors: impl WriteErrorList<DumperError>) {
        if !self.threads_suspended {
            return;
        }
        self.threads_suspended = false;

        for &tid in &self.threads {
            if let Err(e) = self.resume_thread(tid) {
                soft_errors.push(e);
            }
        }
    }

    fn get_thread_info_by_index(&self, index: usize) -> Result<ThreadInfo, ThreadInfoError> {
        let tid = *self
            .threads
            .get(index)
            .ok_or(ThreadInfoError::IndexOutOfBounds {
                index,
                length: self.threads.len(),
            })?;
        ThreadInfo::create(self.pid, tid)
    }

    fn copy_from_process(
        &self,
        child: Pid,
        src: usize,
        length: usize,
    ) -> Result<&mut [u8], DumperError> {
        let dest = self.allocator.alloc(length)?;
        let reader = MemReader::new(child);

        let mut offset = 0;
        while offset < length {
            let read = reader.read(src + offset, &mut dest[offset..])?;
            if read == 0 {
                return Err(CopyFromProcessError {
                    child,
                    address: src,
                    offset,
                    length,
                    source: nix::Error::EIO,
                }
                .into());
            }
            offset += read;
        }
        Ok(dest)
    }
}
