//! Frame table: every physical page currently backing a user page, and
//! second-chance eviction when the allocator runs dry.
//!
//! Frames live in an arena and are named by a generation-checked [`FrameId`],
//! which is what supplemental page table entries store. An entry only points
//! at a frame once the fault that loaded it has committed, so a frame whose
//! owner's entry does not point back at it is still being filled and is never
//! chosen as a victim.

use crate::clock::ClockHand;
use crate::error::{Result, VmError};
use crate::page::PageOrigin;
use crate::palloc::{KernelPage, PageAllocator, PallocFlags};
use crate::space::AddressSpace;
use crate::swap::SwapTable;
use crate::sync::{Mutex, MutexGuard};
use alloc::{sync::Arc, vec::Vec};
use core::fmt;
use log::{debug, error, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId {
    index: u32,
    generation: u32,
}

impl FrameId {
    #[cfg(test)]
    pub(crate) const fn for_test(index: u32) -> Self {
        Self {
            index,
            generation: 0,
        }
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// A physical page in use by a user page.
pub struct Frame {
    kpage: KernelPage,
    owner: Arc<AddressSpace>,
    upage: usize,
}

impl Frame {
    pub fn kpage(&self) -> KernelPage {
        self.kpage
    }

    pub fn owner(&self) -> &Arc<AddressSpace> {
        &self.owner
    }

    pub fn upage(&self) -> usize {
        self.upage
    }
}

struct Slot {
    generation: u32,
    frame: Option<Frame>,
}

#[derive(Default)]
struct FrameArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl FrameArena {
    /// Store `frame`, reusing a free slot if there is one. Returns `None`
    /// if the arena has run out of indices.
    fn insert(&mut self, frame: Frame) -> Option<FrameId> {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.frame = Some(frame);
                Some(FrameId {
                    index,
                    generation: slot.generation,
                })
            }
            None => {
                let index = u32::try_from(self.slots.len()).ok()?;
                self.slots.push(Slot {
                    generation: 0,
                    frame: Some(frame),
                });
                Some(FrameId {
                    index,
                    generation: 0,
                })
            }
        }
    }

    fn get(&self, id: FrameId) -> Option<&Frame> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.frame.as_ref())
    }

    fn remove(&mut self, id: FrameId) -> Option<Frame> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let frame = slot.frame.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(frame)
    }
}

#[derive(Default)]
pub struct FrameList {
    arena: FrameArena,
    /// Clock order.
    order: Vec<FrameId>,
    hand: ClockHand,
}

impl FrameList {
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Pick the next frame that may be evicted, giving recently accessed ones
    /// a second chance. Two sweeps clear every accessed bit, so if nothing
    /// qualifies by then, nothing will.
    fn select_victim(&mut self, excluded: &[FrameId]) -> Option<usize> {
        let len = self.order.len();
        for _ in 0..2 * len {
            let index = self.hand.advance(len)?;
            let id = self.order[index];
            if excluded.contains(&id) {
                continue;
            }
            let Some(frame) = self.arena.get(id) else {
                continue;
            };
            let pagedir = frame.owner.pagedir();
            let evictable = frame
                .owner
                .spt()
                .find(frame.upage)
                .is_some_and(|entry| entry.frame() == Some(id) && !entry.is_pinned());
            if !evictable || pagedir.is_accessed(frame.upage) {
                pagedir.set_accessed(frame.upage, false);
                continue;
            }
            return Some(index);
        }
        None
    }
}

pub struct FrameTable<A> {
    allocator: A,
    list: Mutex<FrameList>,
}

impl<A: PageAllocator> FrameTable<A> {
    pub fn new(allocator: A) -> Self {
        Self {
            allocator,
            list: Mutex::new(FrameList::default()),
        }
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    /// Lock the table. This is the outermost lock of the VM subsystem.
    pub fn lock(&self) -> FrameTableGuard<'_, A> {
        FrameTableGuard {
            allocator: &self.allocator,
            list: self.list.lock(),
        }
    }

    /// Get a frame for `upage` of `owner`, evicting another if needed. The
    /// frame is not yet visible to eviction; see the module docs.
    pub fn allocate(
        &self,
        owner: &Arc<AddressSpace>,
        upage: usize,
        swap: &SwapTable,
    ) -> Result<(FrameId, KernelPage)> {
        self.lock().allocate(owner, upage, swap)
    }

    pub fn release(&self, id: FrameId) -> bool {
        self.lock().release(id)
    }

    /// Number of frames currently backing user pages.
    pub fn resident_frames(&self) -> usize {
        self.list.lock().len()
    }
}

/// Exclusive access to the frame table.
pub struct FrameTableGuard<'a, A> {
    allocator: &'a A,
    list: MutexGuard<'a, FrameList>,
}

impl<A: PageAllocator> FrameTableGuard<'_, A> {
    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn frame(&self, id: FrameId) -> Option<&Frame> {
        self.list.arena.get(id)
    }

    pub fn allocate(
        &mut self,
        owner: &Arc<AddressSpace>,
        upage: usize,
        swap: &SwapTable,
    ) -> Result<(FrameId, KernelPage)> {
        let kpage = loop {
            if let Some(kpage) = self.allocator.get_page(PallocFlags::USER) {
                break kpage;
            }
            self.evict_one(swap)?;
        };
        let Some(id) = self.list.arena.insert(Frame {
            kpage,
            owner: owner.clone(),
            upage,
        }) else {
            self.allocator.free_page(kpage);
            return Err(VmError::EvictionDeadlock);
        };
        self.list.order.push(id);
        Ok((id, kpage))
    }

    /// Remove a frame, clear its mapping and free its page. Returns `false`
    /// if there is no such frame.
    pub fn release(&mut self, id: FrameId) -> bool {
        match self.list.order.iter().position(|&other| other == id) {
            Some(index) => {
                self.release_at(index);
                true
            }
            None => false,
        }
    }

    fn release_at(&mut self, index: usize) {
        let id = self.list.order.remove(index);
        self.list.hand.removed(index);
        if let Some(frame) = self.list.arena.remove(id) {
            frame.owner.pagedir().clear(frame.upage);
            self.allocator.free_page(frame.kpage);
        }
    }

    /// Evict one frame, freeing its page. A frame whose contents cannot be
    /// saved stays resident and another is tried.
    pub fn evict_one(&mut self, swap: &SwapTable) -> Result<()> {
        let mut failed = Vec::new();
        let mut last_error = VmError::EvictionDeadlock;
        while let Some(index) = self.list.select_victim(&failed) {
            let id = self.list.order[index];
            match self.dispose(id, swap) {
                Ok(true) => {
                    self.release_at(index);
                    return Ok(());
                }
                // Pinned or reassigned since it was selected.
                Ok(false) => failed.push(id),
                Err(e) => {
                    warn!("evict: could not save frame {}: {}", id, e);
                    failed.push(id);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Save the contents of frame `id` to wherever its page lives when not
    /// resident and detach it from its entry. On failure the page stays
    /// mapped as before.
    fn dispose(&self, id: FrameId, swap: &SwapTable) -> Result<bool> {
        let frame = self.list.arena.get(id).ok_or(VmError::NotFound)?;
        let (upage, kpage) = (frame.upage, frame.kpage);
        let pagedir = frame.owner.pagedir();

        let mut spt = frame.owner.spt();
        let Some(entry) = spt.find_mut(upage) else {
            return Ok(false);
        };
        if entry.frame() != Some(id) || entry.is_pinned() {
            return Ok(false);
        }

        // Unmap first so the process cannot dirty the page behind our back.
        let dirty = pagedir.clear(upage);
        // SAFETY: The page is unmapped and unpinned, so nobody writes to it.
        let saved = unsafe {
            match entry.origin() {
                PageOrigin::Binary(_) if !dirty => Ok(None),
                PageOrigin::Binary(_) | PageOrigin::Anonymous { .. } => {
                    swap.swap_out(kpage).map(Some)
                }
                PageOrigin::File(segment) if dirty => segment.write_back(kpage).map(|()| None),
                PageOrigin::File(_) => Ok(None),
            }
        };

        match saved {
            Ok(slot) => {
                if let Some(slot) = slot {
                    // A modified executable page no longer matches the file.
                    entry.set_origin(PageOrigin::Anonymous { slot: Some(slot) });
                }
                entry.evicted();
                debug!(
                    "evict: pid {} page {:#x} from frame {}",
                    frame.owner.pid(),
                    upage,
                    id
                );
                Ok(true)
            }
            Err(e) => {
                if pagedir.map(upage, kpage, entry.writable()) {
                    pagedir.set_dirty(upage, dirty);
                } else {
                    error!("evict: could not restore mapping for {:#x}", upage);
                }
                Err(e)
            }
        }
    }
}
