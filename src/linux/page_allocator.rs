//! A page granular bump allocator
//!
//! Dump generation runs in the crashed process' address space (either on the
//! crashing thread or in the process cloned from it), where the regular heap
//! may be corrupted or held locked by a thread that is now frozen. Scratch
//! memory on that path is carved out of anonymous mappings obtained directly
//! from the kernel instead. Nothing is ever freed individually, every page is
//! unmapped when the allocator is dropped.
//!
//! [`DumperAllocator`] extends this to everything the dumper process puts on
//! the heap. Installed as the global allocator it forwards to the regular
//! allocator, except in the cloned dumper, where it serves every allocation
//! from a [`PageAllocator`] and never calls into the inherited heap.

use {
    crate::serializers::serialize_nix_error,
    nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, munmap},
    std::{
        alloc::{GlobalAlloc, Layout, System},
        cell::{Cell, UnsafeCell},
        num::NonZeroUsize,
        ptr::{self, NonNull},
        sync::atomic::{AtomicBool, Ordering},
    },
};

/// Every allocation starts at a multiple of this
const ALIGNMENT: usize = 16;

#[derive(Debug, thiserror::Error, serde::Serialize)]
pub enum PageAllocatorError {
    #[error("Failed to map {pages} page(s)")]
    Map {
        pages: usize,
        #[source]
        #[serde(serialize_with = "serialize_nix_error")]
        source: nix::Error,
    },
    #[error("Allocation of {0} bytes overflows the address space")]
    TooLarge(usize),
}

/// Sits at the start of every run of pages so the runs can be found again
#[repr(C)]
struct PageHeader {
    next: Option<NonNull<PageHeader>>,
    num_pages: usize,
}

const HEADER_SIZE: usize = std::mem::size_of::<PageHeader>().next_multiple_of(ALIGNMENT);

pub struct PageAllocator {
    page_size: usize,
    /// Most recently mapped run, the others are reachable through its header
    last: Cell<Option<NonNull<PageHeader>>>,
    current_page: Cell<Option<NonNull<u8>>>,
    /// Offset of the next free byte in the last page of `current_page`
    page_offset: Cell<usize>,
    pages_allocated: Cell<usize>,
}

// The allocator exclusively owns its mappings
unsafe impl Send for PageAllocator {}

impl Default for PageAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PageAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageAllocator")
            .field("page_size", &self.page_size)
            .field("pages_allocated", &self.pages_allocated.get())
            .finish()
    }
}

impl PageAllocator {
    pub fn new() -> Self {
        // SAFETY: sysconf has no preconditions
        let page_size = match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
            n if n > 0 => n as usize,
            _ => 4096,
        };

        Self {
            page_size,
            last: Cell::new(None),
            current_page: Cell::new(None),
            page_offset: Cell::new(0),
            pages_allocated: Cell::new(0),
        }
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// The total number of pages currently mapped
    #[inline]
    pub fn pages_allocated(&self) -> usize {
        self.pages_allocated.get()
    }

    /// Returns `len` zeroed bytes that live as long as the allocator
    #[allow(clippy::mut_from_ref)]
    pub fn alloc(&self, len: usize) -> Result<&mut [u8], PageAllocatorError> {
        if len == 0 {
            return Ok(&mut []);
        }

        if let Some(page) = self.current_page.get() {
            let offset = self.page_offset.get().next_multiple_of(ALIGNMENT);
            if offset < self.page_size && self.page_size - offset >= len {
                self.page_offset.set(offset + len);
                // SAFETY: [offset, offset + len) is inside the current page and
                // has never been handed out before
                return Ok(unsafe {
                    std::slice::from_raw_parts_mut(page.as_ptr().add(offset), len)
                });
            }
        }

        let needed = len
            .checked_add(HEADER_SIZE + self.page_size - 1)
            .ok_or(PageAllocatorError::TooLarge(len))?;
        let pages = needed / self.page_size;
        let run = self.map_pages(pages)?;

        // SAFETY: the run is at least HEADER_SIZE + len bytes long
        let data = unsafe { run.as_ptr().add(HEADER_SIZE) };
        let used = HEADER_SIZE + len;
        let last_page_used = used - (pages - 1) * self.page_size;
        if last_page_used < self.page_size {
            // SAFETY: the last page of the run
            let last_page = unsafe { run.as_ptr().add((pages - 1) * self.page_size) };
            self.current_page.set(NonNull::new(last_page));
            self.page_offset.set(last_page_used);
        } else {
            self.current_page.set(None);
            self.page_offset.set(0);
        }

        // SAFETY: freshly mapped, zeroed, and exclusively ours
        Ok(unsafe { std::slice::from_raw_parts_mut(data, len) })
    }

    /// Copies `bytes` into the arena
    #[allow(clippy::mut_from_ref)]
    pub fn alloc_copy(&self, bytes: &[u8]) -> Result<&mut [u8], PageAllocatorError> {
        let dst = self.alloc(bytes.len())?;
        dst.copy_from_slice(bytes);
        Ok(dst)
    }

    /// Returns true if `ptr` points into memory mapped by this allocator
    pub fn owns(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        let mut header = self.last.get();
        while let Some(h) = header {
            // SAFETY: headers are only written by map_pages and live until drop
            let hdr = unsafe { h.as_ref() };
            let start = h.as_ptr() as usize;
            if addr >= start && addr < start + hdr.num_pages * self.page_size {
                return true;
            }
            header = hdr.next;
        }
        false
    }

    fn map_pages(&self, pages: usize) -> Result<NonNull<u8>, PageAllocatorError> {
        let len = pages
            .checked_mul(self.page_size)
            .and_then(NonZeroUsize::new)
            .ok_or(PageAllocatorError::TooLarge(pages))?;

        // SAFETY: an anonymous private mapping doesn't alias anything
        let run = unsafe {
            mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
        }
        .map_err(|source| PageAllocatorError::Map { pages, source })?;

        let header = run.cast::<PageHeader>();
        // SAFETY: the mapping is page aligned and larger than a header
        unsafe {
            header.as_ptr().write(PageHeader {
                next: self.last.get(),
                num_pages: pages,
            });
        }
        self.last.set(Some(header));
        self.pages_allocated.set(self.pages_allocated.get() + pages);

        Ok(run.cast())
    }
}

impl Drop for PageAllocator {
    fn drop(&mut self) {
        let mut header = self.last.get();
        while let Some(h) = header {
            // SAFETY: read the header before the run it lives in goes away
            let PageHeader { next, num_pages } = unsafe { h.as_ptr().read() };
            // SAFETY: the run was mapped by us with exactly this length
            let _ = unsafe { munmap(h.cast(), num_pages * self.page_size) };
            header = next;
        }
    }
}

struct DumperHeap(UnsafeCell<Option<PageAllocator>>);

// SAFETY: only touched after enter_dumper_heap, in a process with a single
// thread
unsafe impl Sync for DumperHeap {}

static DUMPER_HEAP: DumperHeap = DumperHeap(UnsafeCell::new(None));
static DUMPER_HEAP_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Switches [`DumperAllocator`] over to page backed memory for the rest of
/// the process' life
///
/// # Safety
///
/// Must be called from the only thread of a process that doesn't share its
/// address space with the crashed one, i.e. the cloned dumper.
pub(crate) unsafe fn enter_dumper_heap() {
    // SAFETY: no other thread can observe the slot, per the contract
    unsafe { *DUMPER_HEAP.0.get() = Some(PageAllocator::new()) };
    DUMPER_HEAP_ACTIVE.store(true, Ordering::Release);
}

/// Carves `layout` out of `heap`, null when the pages can't be mapped
fn alloc_in(heap: &PageAllocator, layout: Layout) -> *mut u8 {
    let Some(len) = layout
        .size()
        .max(1)
        .checked_add(layout.align().saturating_sub(ALIGNMENT))
    else {
        return ptr::null_mut();
    };
    match heap.alloc(len) {
        Ok(mem) => {
            let start = mem.as_mut_ptr();
            // SAFETY: the padding added above covers the offset
            unsafe { start.add(start.align_offset(layout.align())) }
        }
        Err(_) => ptr::null_mut(),
    }
}

/// A global allocator the dumper process can use without touching the heap
/// it inherited from the crashed process
///
/// ```ignore
/// #[global_allocator]
/// static ALLOCATOR: DumperAllocator = DumperAllocator::system();
/// ```
///
/// Without it the dumper allocates from the crashed process' heap, and dumps
/// taken while another thread holds the heap lock never complete.
#[derive(Debug, Default)]
pub struct DumperAllocator<A = System> {
    inner: A,
}

impl DumperAllocator<System> {
    pub const fn system() -> Self {
        Self { inner: System }
    }
}

impl<A> DumperAllocator<A> {
    /// Forwards to `inner` outside of the dumper process
    pub const fn new(inner: A) -> Self {
        Self { inner }
    }
}

// SAFETY: both sources hand out distinct, live, suitably aligned blocks
unsafe impl<A: GlobalAlloc> GlobalAlloc for DumperAllocator<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if DUMPER_HEAP_ACTIVE.load(Ordering::Acquire) {
            // SAFETY: set up by enter_dumper_heap, we are the only thread
            return match unsafe { &*DUMPER_HEAP.0.get() } {
                Some(heap) => alloc_in(heap, layout),
                None => ptr::null_mut(),
            };
        }
        unsafe { self.inner.alloc(layout) }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if DUMPER_HEAP_ACTIVE.load(Ordering::Acquire) {
            // Fresh pages are zeroed and never reused
            return unsafe { self.alloc(layout) };
        }
        unsafe { self.inner.alloc_zeroed(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // Dumper memory goes away with the process, and blocks inherited from
        // the crashed process must not be handed back to its heap
        if DUMPER_HEAP_ACTIVE.load(Ordering::Acquire) {
            return;
        }
        unsafe { self.inner.dealloc(ptr, layout) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if !DUMPER_HEAP_ACTIVE.load(Ordering::Acquire) {
            return unsafe { self.inner.realloc(ptr, layout, new_size) };
        }

        // SAFETY: the caller guarantees the new layout is valid
        let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
        let new = unsafe { self.alloc(new_layout) };
        if !new.is_null() {
            // SAFETY: both blocks are live and at least this long
            unsafe { ptr::copy_nonoverlapping(ptr, new, layout.size().min(new_size)) };
        }
        new
    }
}
