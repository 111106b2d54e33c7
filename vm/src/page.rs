//! Supplemental page table: what each declared user page holds and where to
//! get it from when it is not resident.

use crate::error::{Result, VmError};
use crate::frame::FrameId;
use crate::fs::{self, FileRef};
use crate::palloc::KernelPage;
use crate::swap::SwapSlot;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use bitbybit::bitfield;
use core::fmt;
use kidneyos_shared::mem::{is_page_aligned, page_round_down, PAGE_FRAME_SIZE};

/// A page's worth of a file: `read_bytes` from `offset`, then `zero_bytes`
/// of zeros.
#[derive(Clone)]
pub struct FileSegment {
    pub file: FileRef,
    pub offset: u64,
    pub read_bytes: usize,
    pub zero_bytes: usize,
}

impl FileSegment {
    pub fn new(file: FileRef, offset: u64, read_bytes: usize) -> Self {
        debug_assert!(read_bytes <= PAGE_FRAME_SIZE);
        Self {
            file,
            offset,
            read_bytes,
            zero_bytes: PAGE_FRAME_SIZE - read_bytes,
        }
    }

    /// Fill `kpage` from the file.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to `kpage`.
    pub unsafe fn load(&self, kpage: KernelPage) -> Result<()> {
        let (data, zeros) = kpage.as_mut_slice().split_at_mut(self.read_bytes);
        fs::read_exact_at(&*self.file, data, self.offset)?;
        zeros.fill(0);
        Ok(())
    }

    /// Write the file-backed part of `kpage` back to the file.
    ///
    /// # Safety
    ///
    /// Nobody may be writing to `kpage`.
    pub unsafe fn write_back(&self, kpage: KernelPage) -> Result<()> {
        fs::write_all_at(&*self.file, &kpage.as_slice()[..self.read_bytes], self.offset)
    }
}

impl fmt::Debug for FileSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSegment")
            .field("offset", &self.offset)
            .field("read_bytes", &self.read_bytes)
            .field("zero_bytes", &self.zero_bytes)
            .finish_non_exhaustive()
    }
}

/// Where a page's contents come from.
#[derive(Clone, Debug)]
pub enum PageOrigin {
    /// Part of a loaded executable. Clean pages are re-read from it.
    Binary(FileSegment),
    /// Part of a memory-mapped file. Dirty pages are written back to it.
    File(FileSegment),
    /// No backing file. Evicted contents live in a swap slot.
    Anonymous { slot: Option<SwapSlot> },
}

#[bitfield(u8, default = 0)]
struct PageFlags {
    #[bit(0, rw)]
    writable: bool,
    #[bit(1, rw)]
    loaded: bool,
    #[bit(2, rw)]
    pinned: bool,
}

/// Supplemental page table entry.
pub struct PageEntry {
    upage: usize,
    origin: PageOrigin,
    flags: PageFlags,
    /// Set while resident. The frame table owns the frame.
    frame: Option<FrameId>,
}

impl PageEntry {
    fn new(upage: usize, origin: PageOrigin, writable: bool) -> Self {
        debug_assert!(is_page_aligned(upage));
        Self {
            upage,
            origin,
            flags: PageFlags::DEFAULT.with_writable(writable),
            frame: None,
        }
    }

    pub fn binary(upage: usize, segment: FileSegment, writable: bool) -> Self {
        Self::new(upage, PageOrigin::Binary(segment), writable)
    }

    pub fn file(upage: usize, segment: FileSegment, writable: bool) -> Self {
        Self::new(upage, PageOrigin::File(segment), writable)
    }

    pub fn anonymous(upage: usize, writable: bool) -> Self {
        Self::new(upage, PageOrigin::Anonymous { slot: None }, writable)
    }

    pub fn upage(&self) -> usize {
        self.upage
    }

    pub fn origin(&self) -> &PageOrigin {
        &self.origin
    }

    pub(crate) fn set_origin(&mut self, origin: PageOrigin) {
        self.origin = origin;
    }

    pub fn writable(&self) -> bool {
        self.flags.writable()
    }

    pub fn is_loaded(&self) -> bool {
        self.flags.loaded()
    }

    pub fn is_pinned(&self) -> bool {
        self.flags.pinned()
    }

    pub fn frame(&self) -> Option<FrameId> {
        self.frame
    }

    pub(crate) fn set_pinned(&mut self, pinned: bool) {
        self.flags = self.flags.with_pinned(pinned);
    }

    /// Pin the entry for loading and hand the loader the source of its
    /// contents. A swap slot moves to the loader and the entry no longer
    /// owns it.
    pub(crate) fn start_load(&mut self) -> PageOrigin {
        self.set_pinned(true);
        match &mut self.origin {
            PageOrigin::Anonymous { slot } => PageOrigin::Anonymous { slot: slot.take() },
            origin => origin.clone(),
        }
    }

    /// Record that the page is resident in `frame`.
    pub(crate) fn commit(&mut self, frame: FrameId) {
        if let PageOrigin::Anonymous { slot } = &mut self.origin {
            *slot = None;
        }
        self.frame = Some(frame);
        self.flags = self.flags.with_loaded(true);
    }

    /// Record that the page's frame has been given up.
    pub(crate) fn evicted(&mut self) {
        self.frame = None;
        self.flags = self.flags.with_loaded(false);
    }
}

impl fmt::Debug for PageEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageEntry")
            .field("upage", &format_args!("{:#x}", self.upage))
            .field("origin", &self.origin)
            .field("writable", &self.writable())
            .field("loaded", &self.is_loaded())
            .field("pinned", &self.is_pinned())
            .field("frame", &self.frame)
            .finish()
    }
}

/// Per-process table of declared pages, keyed by page address.
#[derive(Default)]
pub struct SupplementalPageTable {
    entries: BTreeMap<usize, PageEntry>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `entry`. The entry starts out unpinned.
    pub fn insert(&mut self, mut entry: PageEntry) -> Result<()> {
        if self.entries.contains_key(&entry.upage) {
            return Err(VmError::Duplicate { upage: entry.upage });
        }
        entry.set_pinned(false);
        self.entries.insert(entry.upage, entry);
        Ok(())
    }

    /// Register all of `entries`, or none of them if any page is taken.
    pub fn insert_all(&mut self, entries: Vec<PageEntry>) -> Result<()> {
        if let Some(taken) = entries.iter().find(|e| self.entries.contains_key(&e.upage)) {
            return Err(VmError::Duplicate { upage: taken.upage });
        }
        for entry in entries {
            self.insert(entry)?;
        }
        Ok(())
    }

    /// The entry for the page containing `vaddr`.
    pub fn find(&self, vaddr: usize) -> Option<&PageEntry> {
        self.entries.get(&page_round_down(vaddr))
    }

    pub fn find_mut(&mut self, vaddr: usize) -> Option<&mut PageEntry> {
        self.entries.get_mut(&page_round_down(vaddr))
    }

    /// Unregister the page containing `vaddr`. Releasing its frame and swap
    /// slot is up to the caller.
    pub fn remove(&mut self, vaddr: usize) -> Result<PageEntry> {
        self.entries
            .remove(&page_round_down(vaddr))
            .ok_or(VmError::NotFound)
    }

    /// Unregister every page.
    pub fn drain(&mut self) -> Vec<PageEntry> {
        core::mem::take(&mut self.entries).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageEntry> {
        self.entries.values()
    }
}
