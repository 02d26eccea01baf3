//! Catching fatal signals and turning them into minidumps
//!
//! A process wide [`SignalRegistry`] owns the one disposition the kernel
//! allows per signal, and dispatches to the installed handlers, most recently
//! installed first. The handler that accepts a crash clones a helper process
//! sharing the crashed one's file table, lets it ptrace us, and waits for it to
//! write the dump. Afterwards the signal is re-raised with the default
//! disposition, the process still dies the way it would have without us.

use {
    super::{
        app_memory::AppMemoryList,
        crash_context::{CpuContext, CrashContext},
        crash_generation::CrashGenerationClient,
        errors::{HandlerError, WriterError},
        maps_reader::{MMPermissions, MappingEntry, MappingInfo, MappingList, SystemMappingInfo},
        minidump_descriptor::MinidumpDescriptor,
        minidump_writer::MinidumpWriter,
        page_allocator::{self, PageAllocator},
        Pid,
    },
    crate::minidump_format::MD_EXCEPTION_CODE_DUMP_REQUESTED,
    error_graph::ErrorList,
    failspot::failspot,
    nix::{
        errno::Errno,
        sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal},
    },
    parking_lot::Mutex,
    std::{
        fs::File,
        io::{Seek, SeekFrom},
        mem::{self, ManuallyDrop, MaybeUninit},
        os::fd::{FromRawFd, RawFd},
        ptr,
        sync::{Arc, Weak},
    },
};

/// The signals treated as crashes
pub const EXCEPTION_SIGNALS: [Signal; 5] = [
    Signal::SIGSEGV,
    Signal::SIGABRT,
    Signal::SIGFPE,
    Signal::SIGILL,
    Signal::SIGBUS,
];

const MIN_ALT_STACK_SIZE: usize = 16 * 1024;
/// The dumper runs the whole writer on this stack
const CHILD_STACK_SIZE: usize = 1024 * 1024;

/// kill
const SI_USER: i32 = 0;
/// tkill, tgkill
const SI_TKILL: i32 = -6;

/// Decides whether a crash is dumped at all
pub type FilterCallback = Box<dyn Fn() -> bool + Send + Sync>;
/// Called after every dump attempt with its outcome, the returned value
/// replaces the outcome
pub type MinidumpCallback = Box<dyn Fn(&MinidumpDescriptor, bool) -> bool + Send + Sync>;

struct AltStack {
    /// The stack that was active before ours, if any
    old: Option<libc::stack_t>,
    new: libc::stack_t,
    mapping: ptr::NonNull<libc::c_void>,
    mapping_len: usize,
}

/// Process wide state of the fatal signal handling
///
/// Handlers are registered in installation order and consulted in reverse.
/// The previous dispositions are saved when the first handler is installed
/// and restored when the last one goes away, or when a crash is declined by
/// everyone.
struct SignalRegistry {
    handlers: Vec<Weak<HandlerInner>>,
    old_actions: Vec<(Signal, SigAction)>,
    alt_stack: Option<AltStack>,
}

// SAFETY: the raw pointers only describe the alternate stack mapping, which
// is only touched with the registry locked
unsafe impl Send for SignalRegistry {}

static REGISTRY: Mutex<SignalRegistry> = parking_lot::const_mutex(SignalRegistry::new());

impl SignalRegistry {
    const fn new() -> Self {
        Self {
            handlers: Vec::new(),
            old_actions: Vec::new(),
            alt_stack: None,
        }
    }

    fn install(&mut self, handler: &Arc<HandlerInner>) -> Result<(), HandlerError> {
        self.install_alt_stack()?;
        if let Err(e) = self.install_handlers() {
            if self.handlers.is_empty() {
                self.restore_alt_stack();
            }
            return Err(e);
        }
        self.handlers.push(Arc::downgrade(handler));
        Ok(())
    }

    fn uninstall(&mut self, handler: &Arc<HandlerInner>) {
        self.handlers
            .retain(|h| h.upgrade().is_some_and(|h| !Arc::ptr_eq(&h, handler)));

        if self.handlers.is_empty() {
            self.restore_alt_stack();
            self.restore_handlers();
        }
    }

    fn contains(&self, handler: &Arc<HandlerInner>) -> bool {
        self.handlers
            .iter()
            .any(|h| ptr::eq(h.as_ptr(), Arc::as_ptr(handler)))
    }

    /// Offers the crash to every handler, newest first, until one accepts it
    ///
    /// # Safety
    ///
    /// `uc` must point to a complete `ucontext_t`
    unsafe fn dispatch(
        &self,
        signo: libc::c_int,
        siginfo: &libc::signalfd_siginfo,
        uc: *const crash_context::ucontext_t,
    ) -> bool {
        self.handlers
            .iter()
            .rev()
            .filter_map(Weak::upgrade)
            .any(|handler| unsafe { handler.handle_signal(signo, siginfo, uc) })
    }

    /// Makes sure the thread has an alternate stack large enough for the
    /// trampoline, so that stack overflows are caught too
    fn install_alt_stack(&mut self) -> Result<(), HandlerError> {
        if self.alt_stack.is_some() {
            return Ok(());
        }

        let stack_size = MIN_ALT_STACK_SIZE.max(libc::SIGSTKSZ);

        // SAFETY: queries the current stack only
        let mut old: libc::stack_t = unsafe { mem::zeroed() };
        if unsafe { libc::sigaltstack(ptr::null(), &mut old) } == -1 {
            return Err(HandlerError::AltStack(Errno::last()));
        }
        let old_enabled = old.ss_flags & libc::SS_DISABLE == 0;
        if old_enabled && old.ss_size >= stack_size {
            return Ok(());
        }

        let page_size = nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
            .ok()
            .flatten()
            .map_or(4096, |size| size as usize);
        let mapping_len = page_size + stack_size;

        use nix::sys::mman::{mmap_anonymous, mprotect, munmap, MapFlags, ProtFlags};

        let len =
            std::num::NonZeroUsize::new(mapping_len).ok_or(HandlerError::AltStack(Errno::EINVAL))?;
        // The lowest page stays inaccessible as a guard
        // SAFETY: a new private anonymous mapping aliases nothing
        let mapping = unsafe { mmap_anonymous(None, len, ProtFlags::PROT_NONE, MapFlags::MAP_PRIVATE) }
            .map_err(HandlerError::AltStack)?;

        // SAFETY: the stack is inside the mapping created above
        let stack = unsafe { mapping.cast::<u8>().as_ptr().add(page_size) };
        let stack = ptr::NonNull::new(stack.cast::<libc::c_void>())
            .ok_or(HandlerError::AltStack(Errno::EINVAL))?;
        if let Err(e) =
            unsafe { mprotect(stack, stack_size, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE) }
        {
            let _ = unsafe { munmap(mapping, mapping_len) };
            return Err(HandlerError::AltStack(e));
        }

        let new = libc::stack_t {
            ss_sp: stack.as_ptr(),
            ss_flags: 0,
            ss_size: stack_size,
        };
        // SAFETY: the new stack is mapped read/write and outlives its use
        if unsafe { libc::sigaltstack(&new, ptr::null_mut()) } == -1 {
            let errno = Errno::last();
            let _ = unsafe { munmap(mapping, mapping_len) };
            return Err(HandlerError::AltStack(errno));
        }

        self.alt_stack = Some(AltStack {
            old: old_enabled.then_some(old),
            new,
            mapping,
            mapping_len,
        });
        Ok(())
    }

    fn restore_alt_stack(&mut self) {
        let Some(alt) = self.alt_stack.take() else {
            return;
        };

        // Only put the old stack back if ours is still the active one
        // SAFETY: queries the current stack only
        let mut current: libc::stack_t = unsafe { mem::zeroed() };
        if unsafe { libc::sigaltstack(ptr::null(), &mut current) } == -1 {
            return;
        }
        if current.ss_sp == alt.new.ss_sp {
            let restore = alt.old.unwrap_or_else(|| {
                // SAFETY: POD
                let mut disable: libc::stack_t = unsafe { mem::zeroed() };
                disable.ss_flags = libc::SS_DISABLE;
                disable
            });
            // SAFETY: the old stack was valid when it was replaced
            if unsafe { libc::sigaltstack(&restore, ptr::null_mut()) } == -1 {
                // Still in use, leak the mapping rather than pull it away
                return;
            }
        }

        // SAFETY: the mapping is no longer registered as a signal stack
        if let Err(e) = unsafe { nix::sys::mman::munmap(alt.mapping, alt.mapping_len) } {
            log::warn!("failed to unmap the alternate signal stack: {e}");
        }
    }

    fn install_handlers(&mut self) -> Result<(), HandlerError> {
        if !self.old_actions.is_empty() {
            return Ok(());
        }

        let mut mask = SigSet::empty();
        for sig in EXCEPTION_SIGNALS {
            mask.add(sig);
        }
        let action = SigAction::new(
            SigHandler::SigAction(signal_trampoline),
            SaFlags::SA_ONSTACK | SaFlags::SA_SIGINFO,
            mask,
        );

        let mut old_actions = Vec::with_capacity(EXCEPTION_SIGNALS.len());
        for sig in EXCEPTION_SIGNALS {
            // SAFETY: the trampoline only calls async signal safe code until
            // it hands over to the dumper process
            match unsafe { signal::sigaction(sig, &action) } {
                Ok(old) => old_actions.push((sig, old)),
                Err(e) => {
                    for (sig, old) in old_actions {
                        // SAFETY: putting back what was there
                        let _ = unsafe { signal::sigaction(sig, &old) };
                    }
                    return Err(HandlerError::InstallHandlers(e));
                }
            }
        }

        self.old_actions = old_actions;
        Ok(())
    }

    /// Puts back the dispositions saved by [`Self::install_handlers`]
    ///
    /// Called from the trampoline, must not allocate.
    fn restore_handlers(&mut self) {
        for (sig, old) in &self.old_actions {
            // SAFETY: restoring a previously valid disposition
            if unsafe { signal::sigaction(*sig, old) }.is_err() {
                install_default_handler(*sig as libc::c_int);
            }
        }
        self.old_actions.clear();
    }
}

/// Resets `sig` to `SIG_DFL`
fn install_default_handler(sig: libc::c_int) {
    // Some Android versions ignore SIG_DFL requests made through their
    // sigaction wrapper, go to the kernel directly
    #[cfg(target_os = "android")]
    // SAFETY: a zeroed sigaction with SIG_DFL is a valid disposition
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        libc::sigemptyset(&mut sa.sa_mask);
        sa.sa_sigaction = libc::SIG_DFL;
        sa.sa_flags = libc::SA_RESTART;
        libc::syscall(
            libc::SYS_rt_sigaction,
            sig,
            &sa,
            ptr::null::<libc::sigaction>(),
            mem::size_of::<libc::sigset_t>(),
        );
    }

    #[cfg(not(target_os = "android"))]
    // SAFETY: resetting to the default disposition
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
    }
}

/// Someone replaced our disposition using `signal()`, which drops
/// `SA_SIGINFO` and turns `info` and `uc` into garbage. Reinstall properly
/// and let the signal fire again.
fn reinstall_if_clobbered(sig: libc::c_int) -> bool {
    // SAFETY: queries the current disposition only
    let mut current: libc::sigaction = unsafe { mem::zeroed() };
    if unsafe { libc::sigaction(sig, ptr::null(), &mut current) } != 0 {
        return false;
    }
    if current.sa_sigaction != signal_trampoline as usize
        || current.sa_flags & libc::SA_SIGINFO != 0
    {
        return false;
    }

    // SAFETY: reinstalling our own trampoline
    unsafe {
        libc::sigemptyset(&mut current.sa_mask);
        libc::sigaddset(&mut current.sa_mask, sig);
        current.sa_sigaction = signal_trampoline as usize;
        current.sa_flags = libc::SA_ONSTACK | libc::SA_SIGINFO;
        if libc::sigaction(sig, &current, ptr::null_mut()) == -1 {
            install_default_handler(sig);
        }
    }
    true
}

/// The `signalfd_siginfo` view of `info`, the layout the crash context and
/// the minidump writer understand
///
/// # Safety
///
/// `info` must have been filled in by the kernel for `sig`
unsafe fn signalfd_siginfo(sig: libc::c_int, info: &libc::siginfo_t) -> libc::signalfd_siginfo {
    // SAFETY: POD
    let mut out: libc::signalfd_siginfo = unsafe { mem::zeroed() };
    out.ssi_signo = sig as u32;
    out.ssi_errno = info.si_errno;
    out.ssi_code = info.si_code;

    unsafe {
        if info.si_code <= 0 {
            // Sent by a process, the sender is known
            out.ssi_pid = info.si_pid() as u32;
            out.ssi_uid = info.si_uid();
        } else if matches!(
            sig,
            libc::SIGSEGV | libc::SIGBUS | libc::SIGILL | libc::SIGFPE
        ) {
            out.ssi_addr = info.si_addr() as u64;
        }
    }
    out
}

extern "C" fn signal_trampoline(
    sig: libc::c_int,
    info: *mut libc::siginfo_t,
    uc: *mut libc::c_void,
) {
    if reinstall_if_clobbered(sig) {
        return;
    }

    // SAFETY: with SA_SIGINFO the kernel passes valid pointers
    let info = unsafe { &*info };
    let si_code = info.si_code;

    {
        let mut registry = REGISTRY.lock();
        // SAFETY: see above
        let handled = unsafe {
            let siginfo = signalfd_siginfo(sig, info);
            registry.dispatch(sig, &siginfo, uc.cast())
        };

        // The signal is re-delivered once we return. A handled signal goes to
        // the default disposition, otherwise to whatever was there before us.
        if handled {
            install_default_handler(sig);
        } else {
            registry.restore_handlers();
        }
    }

    // Faults re-trigger by themselves, signals sent with kill() and aborts
    // have to be sent again
    if si_code <= 0 || sig == libc::SIGABRT {
        // SAFETY: plain syscalls
        unsafe {
            let tid = libc::syscall(libc::SYS_gettid);
            if libc::syscall(libc::SYS_tgkill, libc::getpid(), tid, sig) < 0 {
                // The sandbox forbids it, the exit code will be wrong
                libc::_exit(1);
            }
        }
    }
}

struct CrashContextSlot(MaybeUninit<crash_context::CrashContext>);

/// Too big for the alternate stack, so it lives in .bss
static CRASH_CONTEXT: Mutex<CrashContextSlot> =
    parking_lot::const_mutex(CrashContextSlot(MaybeUninit::uninit()));

/// Copies the floating point state the kernel saved next to the context
///
/// # Safety
///
/// The pointers inside `context.context` must still be valid
unsafe fn copy_float_state(context: &mut crash_context::CrashContext) {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "x86_64")] {
            let fpregs = context.context.uc_mcontext.fpregs;
            if !fpregs.is_null() {
                unsafe { ptr::copy_nonoverlapping(fpregs, &mut context.float_state, 1) };
            }
        } else if #[cfg(target_arch = "aarch64")] {
            let fpsimd = ptr::addr_of!(context.context.uc_mcontext.__reserved)
                .cast::<crash_context::fpsimd_context>();
            if unsafe { (*fpsimd).head.magic } == crash_context::FPSIMD_MAGIC {
                unsafe { ptr::copy_nonoverlapping(fpsimd, &mut context.float_state, 1) };
            }
        }
    }
}

/// What the cloned dumper needs, passed by pointer through `clone()`
struct DumperArgs {
    handler: *const HandlerInner,
    context: *const crash_context::CrashContext,
    pid: Pid,
    pipe_read: RawFd,
}

/// Entry point of the cloned dumper process
extern "C" fn dumper_entry(arg: *mut libc::c_void) -> libc::c_int {
    // SAFETY: the clone didn't share our address space and we are its only
    // thread
    unsafe { page_allocator::enter_dumper_heap() };

    // SAFETY: the parent keeps the arguments alive until we exit
    let args = unsafe { &*arg.cast::<DumperArgs>() };

    // Wait until the parent allowed us to ptrace it
    let mut byte = 0u8;
    loop {
        // SAFETY: reads one byte into a local
        let res = unsafe { libc::read(args.pipe_read, (&mut byte as *mut u8).cast(), 1) };
        if res == -1 && Errno::last() == Errno::EINTR {
            continue;
        }
        if res == -1 {
            signal_log!("failed to wait for the crashing process, errno: ", Errno::last_raw());
        }
        break;
    }

    // SAFETY: see above
    let (handler, context) = unsafe { (&*args.handler, &*args.context) };
    if handler.perform_dump(args.pid, context) {
        0
    } else {
        1
    }
}

struct HandlerInner {
    descriptor: Mutex<MinidumpDescriptor>,
    filter: Option<FilterCallback>,
    callback: Option<MinidumpCallback>,
    mapping_list: Mutex<MappingList>,
    app_memory: Mutex<AppMemoryList>,
    crash_generation_client: Option<CrashGenerationClient>,
}

impl HandlerInner {
    /// Dumps the crash described by `siginfo` and `uc`, returns whether the
    /// crash was handled
    ///
    /// # Safety
    ///
    /// `uc` must point to a complete `ucontext_t`
    unsafe fn handle_signal(
        &self,
        signo: libc::c_int,
        siginfo: &libc::signalfd_siginfo,
        uc: *const crash_context::ucontext_t,
    ) -> bool {
        if self.filter.as_ref().is_some_and(|filter| !filter()) {
            return false;
        }

        // SAFETY: plain syscalls
        let (pid, tid) = unsafe { (libc::getpid(), libc::syscall(libc::SYS_gettid) as Pid) };

        // The signal comes from the kernel or from ourselves, so we can make
        // the process dumpable again for the dumper to attach
        let trusted = siginfo.ssi_code > 0
            || ((siginfo.ssi_code == SI_USER || siginfo.ssi_code == SI_TKILL)
                && siginfo.ssi_pid == pid as u32);
        if trusted {
            // SAFETY: plain syscall
            unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 1, 0, 0, 0) };
        }

        let mut slot = CRASH_CONTEXT.lock();
        let context = slot.0.as_mut_ptr();
        // SAFETY: the slot is exclusively ours, zeroed is a valid context,
        // and uc is valid per the contract
        let context = unsafe {
            ptr::write_bytes(context, 0, 1);
            let context = &mut *context;
            ptr::copy_nonoverlapping(uc, &mut context.context, 1);
            copy_float_state(context);
            context
        };
        context.siginfo = *siginfo;
        context.siginfo.ssi_signo = signo as u32;
        context.pid = pid;
        context.tid = tid;

        self.generate_dump(context)
    }

    /// Has the dump written, either by the crash server or by a cloned
    /// process, and returns whether it succeeded
    fn generate_dump(&self, context: &crash_context::CrashContext) -> bool {
        if let Some(client) = &self.crash_generation_client {
            let success = match client.request_dump(context) {
                Ok(success) => success,
                Err(_) => {
                    signal_log!("out of process dump request failed");
                    false
                }
            };
            return self.finish(success);
        }

        let allocator = PageAllocator::new();
        let Ok(stack) = allocator.alloc(CHILD_STACK_SIZE) else {
            signal_log!("failed to allocate the dumper stack");
            return false;
        };
        // clone() wants the top of the stack, 16 byte aligned
        let stack_top = (stack.as_mut_ptr_range().end as usize & !15) as *mut libc::c_void;

        // The pipe only serves as a handshake, a failure leaves -1 which
        // makes the handshake fail rather than the whole dump
        let mut fds = [-1; 2];
        // SAFETY: fds has room for both ends
        if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
            signal_log!("failed to create the handshake pipe, errno: ", Errno::last_raw());
            fds = [-1, -1];
        }
        let [pipe_read, pipe_write] = fds;

        let mut args = DumperArgs {
            handler: self,
            context,
            pid: context.pid,
            pipe_read,
        };

        let child = failspot!(if CloneDumper {
            -1
        } else {
            // SAFETY: the stack and the arguments outlive the child, which
            // we wait for below
            unsafe {
                libc::clone(
                    dumper_entry,
                    stack_top,
                    libc::CLONE_FILES | libc::CLONE_FS | libc::CLONE_UNTRACED,
                    (&mut args as *mut DumperArgs).cast(),
                )
            }
        });

        let close_pipe = || {
            // SAFETY: both ends are ours, closing -1 is harmless
            unsafe {
                libc::close(pipe_read);
                libc::close(pipe_write);
            }
        };

        if child == -1 {
            signal_log!("failed to clone the dumper, errno: ", Errno::last_raw());
            close_pipe();
            return false;
        }

        // SAFETY: plain syscalls on our own resources
        unsafe {
            libc::prctl(libc::PR_SET_PTRACER, child as libc::c_ulong, 0, 0, 0);

            let go = b'a';
            loop {
                let res = libc::write(pipe_write, (&go as *const u8).cast(), 1);
                if res == -1 && Errno::last() == Errno::EINTR {
                    continue;
                }
                if res == -1 {
                    signal_log!("failed to release the dumper, errno: ", Errno::last_raw());
                }
                break;
            }
        }

        let mut status = 0;
        let res = loop {
            // SAFETY: waits for our own child
            let res = unsafe { libc::waitpid(child, &mut status, libc::__WALL) };
            if res == -1 && Errno::last() == Errno::EINTR {
                continue;
            }
            break res;
        };
        close_pipe();

        if res == -1 {
            signal_log!("waitpid for the dumper failed, errno: ", Errno::last_raw());
        }

        let success = res != -1 && libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0;
        self.finish(success)
    }

    fn finish(&self, success: bool) -> bool {
        let Some(callback) = &self.callback else {
            return success;
        };
        callback(&self.descriptor.lock(), success)
    }

    /// Runs in the cloned process, writes the dump of `pid`
    fn perform_dump(&self, pid: Pid, context: &crash_context::CrashContext) -> bool {
        // The crashed process may have frozen holding any of these
        let Some(descriptor) = self.descriptor.try_lock() else {
            signal_log!("the minidump descriptor is locked, no dump written");
            return false;
        };

        let mut writer = MinidumpWriter::new(pid, context.tid);
        writer.set_crash_context(context.clone().into());
        match self.mapping_list.try_lock() {
            Some(mappings) => {
                writer.set_user_mapping_list(mappings.clone());
            }
            None => signal_log!("the mapping list is locked, it is left out"),
        }
        match self.app_memory.try_lock() {
            Some(app_memory) => {
                writer.set_app_memory(app_memory.clone());
            }
            None => signal_log!("the app memory list is locked, it is left out"),
        }
        descriptor.configure(&mut writer);

        match descriptor.write(&mut writer) {
            Ok(soft_errors) => {
                if !soft_errors.is_empty() {
                    log::warn!(
                        "minidump written with errors: {}",
                        soft_errors_json(&soft_errors)
                    );
                }
                true
            }
            Err(e) => {
                log::error!("failed to write the minidump: {e}");
                false
            }
        }
    }
}

fn soft_errors_json(soft_errors: &ErrorList<WriterError>) -> String {
    serde_json::to_string(soft_errors).unwrap_or_else(|e| e.to_string())
}

/// Writes minidumps for crashes of this process, or on request
///
/// Dropping the handler uninstalls it.
pub struct ExceptionHandler {
    inner: Arc<HandlerInner>,
    installed: bool,
}

impl std::fmt::Debug for ExceptionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExceptionHandler")
            .field("descriptor", &*self.inner.descriptor.lock())
            .field("installed", &self.installed)
            .field("out_of_process", &self.is_out_of_process())
            .finish_non_exhaustive()
    }
}

impl ExceptionHandler {
    /// Creates a handler writing dumps as described by `descriptor`
    ///
    /// With `install_handler` the handler catches fatal signals, otherwise it
    /// only writes dumps on request. With `server_fd` dumps are requested
    /// from a crash server listening on that socket instead of being written
    /// by this process.
    pub fn new(
        mut descriptor: MinidumpDescriptor,
        filter: Option<FilterCallback>,
        callback: Option<MinidumpCallback>,
        install_handler: bool,
        server_fd: Option<RawFd>,
    ) -> Result<Self, HandlerError> {
        // The path is picked ahead of time, the crash path can't allocate
        if server_fd.is_none() && !descriptor.is_fd() {
            descriptor.update_path();
        }

        let inner = Arc::new(HandlerInner {
            descriptor: Mutex::new(descriptor),
            filter,
            callback,
            mapping_list: Mutex::new(MappingList::new()),
            app_memory: Mutex::new(AppMemoryList::default()),
            crash_generation_client: server_fd.map(CrashGenerationClient::new),
        });

        if install_handler {
            REGISTRY.lock().install(&inner)?;
            log::debug!("crash handler installed");
        }

        Ok(Self {
            inner,
            installed: install_handler,
        })
    }

    #[inline]
    pub fn is_out_of_process(&self) -> bool {
        self.inner.crash_generation_client.is_some()
    }

    /// The descriptor, with the path the next dump is written to
    pub fn descriptor(&self) -> MinidumpDescriptor {
        self.inner.descriptor.lock().clone()
    }

    /// Writes a minidump of the current process state
    ///
    /// The calling thread is blamed, the exception stream records a dump
    /// request instead of a signal. Every call writes a new file.
    pub fn write_minidump(&self) -> bool {
        {
            let mut descriptor = self.inner.descriptor.lock();
            if !self.is_out_of_process() {
                match descriptor.fd() {
                    Some(fd) => {
                        // Each dump replaces the previous one
                        // SAFETY: the embedder keeps the descriptor open, it
                        // is never closed here
                        let mut file = ManuallyDrop::new(unsafe { File::from_raw_fd(fd) });
                        let rewound = file.seek(SeekFrom::Start(0)).and_then(|_| file.set_len(0));
                        if let Err(e) = rewound {
                            log::warn!("failed to reset the minidump descriptor: {e}");
                        }
                    }
                    None => descriptor.update_path(),
                }
            }
        }

        // SAFETY: plain syscall
        unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 1, 0, 0, 0) };

        // SAFETY: POD
        let mut context: crash_context::CrashContext = unsafe { mem::zeroed() };
        // SAFETY: getcontext fills the struct we hand it
        if unsafe { crash_context::crash_context_getcontext(&mut context.context) } != 0 {
            log::error!("failed to capture the thread context");
            return false;
        }
        // SAFETY: getcontext pointed fpregs into the context itself
        unsafe { copy_float_state(&mut context) };

        // SAFETY: plain syscalls
        unsafe {
            context.pid = libc::getpid();
            context.tid = libc::syscall(libc::SYS_gettid) as Pid;
        }
        context.siginfo.ssi_signo = MD_EXCEPTION_CODE_DUMP_REQUESTED;
        context.siginfo.ssi_addr =
            CrashContext::from(context.clone()).get_instruction_pointer() as u64;

        self.inner.generate_dump(&context)
    }

    /// Writes a minidump of another process, blaming `blamed_thread`
    ///
    /// The dump goes to a new file in the descriptor's directory, or to its
    /// descriptor. `callback` sees the outcome and may override it.
    pub fn write_minidump_for_child(
        child: Pid,
        blamed_thread: Pid,
        mut descriptor: MinidumpDescriptor,
        callback: Option<MinidumpCallback>,
    ) -> bool {
        if !descriptor.is_fd() {
            descriptor.update_path();
        }

        let mut writer = MinidumpWriter::new(child, blamed_thread);
        descriptor.configure(&mut writer);
        let success = match descriptor.write(&mut writer) {
            Ok(soft_errors) => {
                if !soft_errors.is_empty() {
                    log::warn!(
                        "minidump of {child} written with errors: {}",
                        soft_errors_json(&soft_errors)
                    );
                }
                true
            }
            Err(e) => {
                log::error!("failed to write the minidump of {child}: {e}");
                false
            }
        };

        match callback {
            Some(callback) => callback(&descriptor, success),
            None => success,
        }
    }

    /// Describes a module the dumper can't find on its own, such as JIT code
    pub fn add_mapping_info(
        &self,
        name: &str,
        identifier: [u8; 16],
        start_address: usize,
        mapping_size: usize,
        file_offset: usize,
    ) -> Result<(), HandlerError> {
        let end_address =
            start_address
                .checked_add(mapping_size)
                .ok_or(HandlerError::MappingOverflow {
                    start: start_address,
                    size: mapping_size,
                })?;
        let mapping = MappingInfo {
            start_address,
            size: mapping_size,
            system_mapping_info: SystemMappingInfo {
                start_address,
                end_address,
            },
            offset: file_offset,
            permissions: MMPermissions::READ | MMPermissions::EXECUTE,
            name: Some(name.into()),
        };
        self.inner
            .mapping_list
            .lock()
            .insert(0, MappingEntry { mapping, identifier });
        Ok(())
    }

    /// Embeds `length` bytes at `ptr` in every dump
    pub fn register_app_memory(&self, ptr: usize, length: usize) {
        self.inner.app_memory.lock().register(ptr, length);
    }

    pub fn unregister_app_memory(&self, ptr: usize) {
        self.inner.app_memory.lock().unregister(ptr);
    }

    /// Runs the handlers as if `signal` had been delivered to the calling
    /// thread, without re-raising it afterwards
    pub fn simulate_signal(&self, signal: Signal) -> bool {
        // SAFETY: POD
        let mut siginfo: libc::signalfd_siginfo = unsafe { mem::zeroed() };
        siginfo.ssi_signo = signal as u32;
        // Looks like we sent it to ourselves, which is trusted
        siginfo.ssi_code = SI_USER;
        siginfo.ssi_pid = std::process::id();

        // SAFETY: POD
        let mut uc: crash_context::ucontext_t = unsafe { mem::zeroed() };
        // SAFETY: getcontext fills the struct we hand it
        if unsafe { crash_context::crash_context_getcontext(&mut uc) } != 0 {
            log::error!("failed to capture the thread context");
            return false;
        }

        let registry = REGISTRY.lock();
        // SAFETY: uc is a complete context captured above
        unsafe {
            if registry.contains(&self.inner) {
                registry.dispatch(signal as libc::c_int, &siginfo, &uc)
            } else {
                drop(registry);
                self.inner.handle_signal(signal as libc::c_int, &siginfo, &uc)
            }
        }
    }
}

impl Drop for ExceptionHandler {
    fn drop(&mut self) {
        if self.installed {
            REGISTRY.lock().uninstall(&self.inner);
            log::debug!("crash handler uninstalled");
        }
    }
}
