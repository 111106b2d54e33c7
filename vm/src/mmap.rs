//! Memory-mapped files.

use crate::error::{Result, VmError};
use crate::fs::{self, FileRef};
use crate::page::{FileSegment, PageEntry};
use crate::palloc::PageAllocator;
use crate::space::{check_user_range, AddressSpace};
use crate::vm::Vm;
use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use core::cmp::min;
use kidneyos_shared::mem::{is_page_aligned, PAGE_FRAME_SIZE};
use log::debug;

/// Handle returned by [`Vm::mmap`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct MapId(u32);

#[derive(Clone, Copy, Debug)]
pub(crate) struct MmapRegion {
    start: usize,
    pages: usize,
}

#[derive(Default)]
pub(crate) struct MmapTable {
    regions: BTreeMap<MapId, MmapRegion>,
    next_id: u32,
}

impl MmapTable {
    fn add(&mut self, region: MmapRegion) -> MapId {
        let id = MapId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.regions.insert(id, region);
        id
    }

    fn remove(&mut self, id: MapId) -> Option<MmapRegion> {
        self.regions.remove(&id)
    }

    pub(crate) fn clear(&mut self) {
        self.regions.clear();
    }
}

impl<A: PageAllocator> Vm<A> {
    /// Map all of `file` at `addr`. Pages are read on first access and
    /// written back when evicted or unmapped if they were modified. A partial
    /// last page is zero-filled past the end of the file, and those bytes are
    /// never written back.
    pub fn mmap(&self, space: &Arc<AddressSpace>, file: FileRef, addr: usize) -> Result<MapId> {
        if addr == 0 || !is_page_aligned(addr) {
            return Err(VmError::InvalidMapping);
        }
        let len = usize::try_from(fs::length(&*file)).map_err(|_| VmError::InvalidMapping)?;
        if len == 0 {
            return Err(VmError::InvalidMapping);
        }
        let pages = len.div_ceil(PAGE_FRAME_SIZE);
        check_user_range(addr, pages)?;

        let entries: Vec<_> = (0..pages)
            .map(|i| {
                let offset = i * PAGE_FRAME_SIZE;
                let segment = FileSegment::new(
                    file.clone(),
                    offset as u64,
                    min(PAGE_FRAME_SIZE, len - offset),
                );
                PageEntry::file(addr + offset, segment, true)
            })
            .collect();
        space.spt().insert_all(entries)?;

        let id = space.mmaps.lock().add(MmapRegion { start: addr, pages });
        debug!(
            "mmap: pid {} mapped {} bytes at {:#x} as {:?}",
            space.pid(),
            len,
            addr,
            id
        );
        Ok(id)
    }

    /// Undo [`Self::mmap`], writing modified pages back to the file.
    pub fn munmap(&self, space: &Arc<AddressSpace>, id: MapId) -> Result<()> {
        let region = space.mmaps.lock().remove(id).ok_or(VmError::NotFound)?;
        let mut result = Ok(());
        for i in 0..region.pages {
            if let Err(e) = self.delete(space, region.start + i * PAGE_FRAME_SIZE) {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }
}
