//! A process's user address space.

use crate::error::{Result, VmError};
use crate::fs::FileRef;
use crate::mmap::MmapTable;
use crate::page::{FileSegment, PageEntry, SupplementalPageTable};
use crate::pagedir::PageDirectory;
use crate::sync::{Mutex, MutexGuard};
use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::cmp::min;
use core::fmt;
use kidneyos_shared::mem::{is_page_aligned, OFFSET, PAGE_FRAME_SIZE};

pub type Pid = u16;

/// Page directory and supplemental page table of one process.
///
/// Frames in the frame table point back at their owner through an
/// `Arc<AddressSpace>`, so a process's pages must be torn down with
/// [`Vm::destroy_all`](crate::Vm::destroy_all) before the last handle is dropped.
pub struct AddressSpace {
    pid: Pid,
    pagedir: Box<dyn PageDirectory>,
    spt: Mutex<SupplementalPageTable>,
    pub(crate) mmaps: Mutex<MmapTable>,
}

impl AddressSpace {
    pub fn new(pid: Pid, pagedir: Box<dyn PageDirectory>) -> Arc<Self> {
        Arc::new(Self {
            pid,
            pagedir,
            spt: Mutex::new(SupplementalPageTable::new()),
            mmaps: Mutex::new(MmapTable::default()),
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn pagedir(&self) -> &dyn PageDirectory {
        &*self.pagedir
    }

    /// Lock the supplemental page table. Must not be held while taking the
    /// frame table lock.
    pub fn spt(&self) -> MutexGuard<'_, SupplementalPageTable> {
        self.spt.lock()
    }

    pub fn insert(&self, entry: PageEntry) -> Result<()> {
        self.spt().insert(entry)
    }

    /// Number of declared pages.
    pub fn page_count(&self) -> usize {
        self.spt().len()
    }

    /// Declare the pages of an executable segment: `read_bytes` of `file`
    /// starting at `offset`, followed by `zero_bytes` of zeros, mapped at
    /// `upage`. Nothing is read until the pages are touched.
    pub fn load_segment(
        &self,
        file: FileRef,
        offset: u64,
        upage: usize,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<()> {
        let total = read_bytes
            .checked_add(zero_bytes)
            .ok_or(VmError::InvalidMapping)?;
        if !is_page_aligned(upage)
            || offset % PAGE_FRAME_SIZE as u64 != 0
            || !is_page_aligned(total)
        {
            return Err(VmError::InvalidMapping);
        }
        let pages = total / PAGE_FRAME_SIZE;
        check_user_range(upage, pages)?;

        let mut remaining = read_bytes;
        let mut file_offset = offset;
        let mut entries = Vec::with_capacity(pages);
        for i in 0..pages {
            let page_read = min(remaining, PAGE_FRAME_SIZE);
            let segment = FileSegment::new(file.clone(), file_offset, page_read);
            entries.push(PageEntry::binary(upage + i * PAGE_FRAME_SIZE, segment, writable));
            remaining -= page_read;
            file_offset += page_read as u64;
        }
        self.spt().insert_all(entries)
    }

    /// Declare a zero-filled page at `upage`.
    pub fn declare_anonymous(&self, upage: usize, writable: bool) -> Result<()> {
        if !is_page_aligned(upage) {
            return Err(VmError::InvalidMapping);
        }
        check_user_range(upage, 1)?;
        self.insert(PageEntry::anonymous(upage, writable))
    }
}

/// `pages` pages from `upage` lie entirely in user space.
pub(crate) fn check_user_range(upage: usize, pages: usize) -> Result<()> {
    pages
        .checked_mul(PAGE_FRAME_SIZE)
        .and_then(|len| upage.checked_add(len))
        .filter(|&end| end <= OFFSET)
        .map(|_| ())
        .ok_or(VmError::InvalidMapping)
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::RamFile;
    use crate::page::PageOrigin;
    use crate::pagedir::SoftPageDirectory;

    fn space() -> Arc<AddressSpace> {
        AddressSpace::new(1, Box::new(SoftPageDirectory::new()))
    }

    #[test]
    fn test_load_segment_splits_pages() {
        let space = space();
        let file: FileRef = Arc::new(RamFile::new(&[7; 6000]));
        space
            .load_segment(file, 0, 0x8000, 6000, 3 * PAGE_FRAME_SIZE - 6000, false)
            .unwrap();
        assert_eq!(space.page_count(), 3);

        let spt = space.spt();
        let reads: Vec<_> = spt
            .iter()
            .map(|entry| match entry.origin() {
                PageOrigin::Binary(seg) => (entry.upage(), seg.offset, seg.read_bytes),
                other => panic!("unexpected origin {other:?}"),
            })
            .collect();
        assert_eq!(
            reads,
            [
                (0x8000, 0, PAGE_FRAME_SIZE),
                (0x9000, PAGE_FRAME_SIZE as u64, 6000 - PAGE_FRAME_SIZE),
                (0xA000, 6000, 0),
            ]
        );
        assert!(spt.iter().all(|entry| !entry.writable()));
    }

    #[test]
    fn test_load_segment_rejects_bad_layout() {
        let space = space();
        let file: FileRef = Arc::new(RamFile::new(b"x"));
        assert_eq!(
            space.load_segment(file.clone(), 0, 0x8001, 1, PAGE_FRAME_SIZE - 1, true),
            Err(VmError::InvalidMapping)
        );
        assert_eq!(
            space.load_segment(file.clone(), 0, 0x8000, 1, 1, true),
            Err(VmError::InvalidMapping)
        );
        assert_eq!(
            space.load_segment(file, 0, OFFSET - PAGE_FRAME_SIZE, PAGE_FRAME_SIZE, PAGE_FRAME_SIZE, true),
            Err(VmError::InvalidMapping)
        );
        assert_eq!(space.page_count(), 0);
    }

    #[test]
    fn test_declare_anonymous() {
        let space = space();
        space.declare_anonymous(0x4000, true).unwrap();
        assert_eq!(
            space.declare_anonymous(0x4000, true),
            Err(VmError::Duplicate { upage: 0x4000 })
        );
        assert_eq!(space.declare_anonymous(OFFSET, true), Err(VmError::InvalidMapping));
        assert_eq!(space.page_count(), 1);
    }
}
