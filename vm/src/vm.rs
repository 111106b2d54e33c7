use crate::block::BlockDevice;
use crate::error::Result;
use crate::frame::{FrameTable, FrameTableGuard};
use crate::page::{PageEntry, PageOrigin};
use crate::palloc::PageAllocator;
use crate::space::AddressSpace;
use crate::swap::SwapTable;
use alloc::{boxed::Box, sync::Arc};
use log::{debug, warn};

/// The virtual memory subsystem: one frame table and one swap area shared by
/// every process.
pub struct Vm<A> {
    pub(crate) frames: FrameTable<A>,
    pub(crate) swap: SwapTable,
}

impl<A: PageAllocator> Vm<A> {
    pub fn new(allocator: A, swap_device: Box<dyn BlockDevice>) -> Self {
        Self {
            frames: FrameTable::new(allocator),
            swap: SwapTable::new(swap_device),
        }
    }

    pub fn frames(&self) -> &FrameTable<A> {
        &self.frames
    }

    pub fn swap(&self) -> &SwapTable {
        &self.swap
    }

    /// Number of frames currently backing user pages.
    pub fn resident_frames(&self) -> usize {
        self.frames.resident_frames()
    }

    /// Evict one frame as if memory had run out.
    pub fn evict(&self) -> Result<()> {
        self.frames.lock().evict_one(&self.swap)
    }

    /// Remove the page containing `vaddr` from `space`, writing a modified
    /// mapped-file page back and giving up its frame and swap slot.
    pub fn delete(&self, space: &Arc<AddressSpace>, vaddr: usize) -> Result<()> {
        let mut frames = self.frames.lock();
        let entry = space.spt().remove(vaddr)?;
        self.discard(&mut frames, space, entry)
    }

    /// Remove every page of `space`. Called when the process exits.
    ///
    /// Every page is released even if writing one back fails; the first
    /// failure is returned.
    pub fn destroy_all(&self, space: &Arc<AddressSpace>) -> Result<()> {
        let mut frames = self.frames.lock();
        let entries = space.spt().drain();
        debug!("vm: destroying {} pages of pid {}", entries.len(), space.pid());

        let mut result = Ok(());
        for entry in entries {
            if let Err(e) = self.discard(&mut frames, space, entry) {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        space.mmaps.lock().clear();
        result
    }

    fn discard(
        &self,
        frames: &mut FrameTableGuard<'_, A>,
        space: &AddressSpace,
        entry: PageEntry,
    ) -> Result<()> {
        let upage = entry.upage();
        let mut result = Ok(());
        if let Some(id) = entry.frame() {
            let dirty = space.pagedir().clear(upage);
            if let (PageOrigin::File(segment), true) = (entry.origin(), dirty) {
                if let Some(frame) = frames.frame(id) {
                    // SAFETY: The page is unmapped and its entry is gone, so
                    // nothing else can reach the frame.
                    result = unsafe { segment.write_back(frame.kpage()) };
                    if let Err(e) = &result {
                        warn!("vm: lost write-back of page {:#x}: {}", upage, e);
                    }
                }
            }
            frames.release(id);
        }
        if let PageOrigin::Anonymous { slot: Some(slot) } = entry.origin() {
            self.swap.free(*slot);
        }
        result
    }
}
