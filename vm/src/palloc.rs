//! Physical page allocation.
//!
//! The frame table draws user pages from a [`PageAllocator`]. [`PagePool`]
//! is the kernel's implementation over a fixed region of memory.

use crate::sync::Mutex;
use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::{boxed::Box, vec};
use bitbybit::bitfield;
use bitflags::bitflags;
use core::ptr::NonNull;
use kidneyos_shared::mem::PAGE_FRAME_SIZE;

bitflags! {
    /// How a page should be allocated.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PallocFlags: u8 {
        /// Zero the page before returning it.
        const ZERO = 1 << 1;
        /// The page will back user memory.
        const USER = 1 << 2;
    }
}

/// Kernel address of one physical page.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct KernelPage(NonNull<u8>);

// SAFETY: A KernelPage is an address. Access to the bytes behind it goes
// through the unsafe accessors below, whose callers guarantee exclusivity.
unsafe impl Send for KernelPage {}
unsafe impl Sync for KernelPage {}

impl KernelPage {
    /// # Safety
    ///
    /// `ptr` must be page aligned and valid for reads and writes of
    /// `PAGE_FRAME_SIZE` bytes for as long as the page is allocated.
    pub unsafe fn new(ptr: NonNull<u8>) -> Self {
        debug_assert_eq!(ptr.as_ptr() as usize % PAGE_FRAME_SIZE, 0);
        Self(ptr)
    }

    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// # Safety
    ///
    /// The page must be allocated and nobody may be writing to it.
    pub unsafe fn as_slice<'a>(self) -> &'a [u8] {
        core::slice::from_raw_parts(self.0.as_ptr(), PAGE_FRAME_SIZE)
    }

    /// # Safety
    ///
    /// The page must be allocated and the caller must have exclusive access,
    /// i.e. it is not mapped writable into a running process or it is pinned.
    pub unsafe fn as_mut_slice<'a>(self) -> &'a mut [u8] {
        core::slice::from_raw_parts_mut(self.0.as_ptr(), PAGE_FRAME_SIZE)
    }
}

/// Underlying physical page allocator.
pub trait PageAllocator: Send + Sync {
    /// Allocate one page, or `None` if memory is exhausted.
    fn get_page(&self, flags: PallocFlags) -> Option<KernelPage>;
    /// Return a page obtained from [`Self::get_page`].
    fn free_page(&self, page: KernelPage);
    /// Total number of pages this allocator can hand out.
    fn capacity(&self) -> usize;
}

#[bitfield(u8, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
    #[bit(1, rw)]
    user: bool,
}

struct PoolState {
    core_map: Box<[CoreMapEntry]>,
    pages_allocated: usize,
    /// The next frame number to start searching for a free frame.
    position: usize,
}

/// A fixed pool of pages with a next-fit core map.
pub struct PagePool {
    start: NonNull<u8>,
    pages: usize,
    state: Mutex<PoolState>,
}

// SAFETY: The pool owns its region; the core map is behind a lock.
unsafe impl Send for PagePool {}
unsafe impl Sync for PagePool {}

impl PagePool {
    /// A pool of `pages` zeroed pages carved from the kernel heap.
    pub fn new(pages: usize) -> Self {
        let start = match Self::layout(pages) {
            // SAFETY: The layout has a non-zero size.
            Some(layout) => match NonNull::new(unsafe { alloc_zeroed(layout) }) {
                Some(ptr) => ptr,
                None => alloc::alloc::handle_alloc_error(layout),
            },
            None => NonNull::dangling(),
        };
        Self {
            start,
            pages,
            state: Mutex::new(PoolState {
                core_map: vec![CoreMapEntry::DEFAULT; pages].into_boxed_slice(),
                pages_allocated: 0,
                position: 0,
            }),
        }
    }

    fn layout(pages: usize) -> Option<Layout> {
        if pages == 0 {
            return None;
        }
        Layout::from_size_align(pages * PAGE_FRAME_SIZE, PAGE_FRAME_SIZE).ok()
    }

    /// Number of pages currently handed out.
    pub fn pages_allocated(&self) -> usize {
        self.state.lock().pages_allocated
    }

    /// Number of handed-out pages that back user memory.
    pub fn user_pages(&self) -> usize {
        self.state
            .lock()
            .core_map
            .iter()
            .filter(|entry| entry.allocated() && entry.user())
            .count()
    }

    fn frame_number(&self, page: KernelPage) -> usize {
        let offset = page.addr() - self.start.as_ptr() as usize;
        assert_eq!(offset % PAGE_FRAME_SIZE, 0, "unaligned page {:#x}", page.addr());
        offset / PAGE_FRAME_SIZE
    }
}

impl PageAllocator for PagePool {
    fn get_page(&self, flags: PallocFlags) -> Option<KernelPage> {
        let mut state = self.state.lock();
        let total = state.core_map.len();
        let index = (0..total)
            .map(|i| (state.position + i) % total)
            .find(|&i| !state.core_map[i].allocated())?;

        state.core_map[index] = CoreMapEntry::DEFAULT
            .with_allocated(true)
            .with_user(flags.contains(PallocFlags::USER));
        state.pages_allocated += 1;
        state.position = (index + 1) % total;
        drop(state);

        // SAFETY: index < pages, so the page lies inside the pool's region.
        let page = unsafe {
            KernelPage::new(NonNull::new_unchecked(
                self.start.as_ptr().add(index * PAGE_FRAME_SIZE),
            ))
        };
        if flags.contains(PallocFlags::ZERO) {
            // SAFETY: The page was just marked allocated; nobody else holds it.
            unsafe { page.as_mut_slice().fill(0) };
        }
        Some(page)
    }

    fn free_page(&self, page: KernelPage) {
        let index = self.frame_number(page);
        let mut state = self.state.lock();
        assert!(index < state.core_map.len(), "page {:#x} not from this pool", page.addr());
        assert!(state.core_map[index].allocated(), "double free of page {:#x}", page.addr());
        state.core_map[index] = CoreMapEntry::DEFAULT;
        state.pages_allocated -= 1;
    }

    fn capacity(&self) -> usize {
        self.pages
    }
}

impl Drop for PagePool {
    fn drop(&mut self) {
        if let Some(layout) = Self::layout(self.pages) {
            // SAFETY: Allocated in `new` with the same layout.
            unsafe { dealloc(self.start.as_ptr(), layout) };
        }
    }
}
