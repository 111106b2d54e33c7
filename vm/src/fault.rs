//! Demand paging.

use crate::error::{Result, VmError};
use crate::page::{PageEntry, PageOrigin};
use crate::palloc::{KernelPage, PageAllocator};
use crate::space::AddressSpace;
use crate::vm::Vm;
use alloc::sync::Arc;
use kidneyos_shared::mem::{is_stack_access, is_user_vaddr, page_round_down};
use log::{debug, trace, warn};

/// What [`Vm::handle_fault`] did about a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The page was brought in and mapped.
    Loaded,
    /// The page was already resident. A fault on it is a protection
    /// violation, which the caller decides how to handle.
    AlreadyResident,
    /// Another thread is loading the page. Retrying the access will fault
    /// again until it is done.
    InFlight,
}

impl<A: PageAllocator> Vm<A> {
    /// Resolve a page fault at `addr` in `space`.
    ///
    /// `esp` is the user stack pointer at the time of the fault, if the fault
    /// came from user mode. Accesses close enough below it grow the stack.
    /// `IllegalAccess` means the process should be killed.
    pub fn handle_fault(
        &self,
        space: &Arc<AddressSpace>,
        addr: usize,
        esp: Option<usize>,
    ) -> Result<FaultOutcome> {
        trace!("fault: pid {} at {:#x}", space.pid(), addr);
        if !is_user_vaddr(addr) {
            return Err(VmError::IllegalAccess { addr });
        }
        let upage = page_round_down(addr);

        let origin = {
            let mut spt = space.spt();
            if spt.find(upage).is_none() {
                if !esp.is_some_and(|esp| is_stack_access(addr, esp)) {
                    return Err(VmError::IllegalAccess { addr });
                }
                debug!("fault: growing stack of pid {} to {:#x}", space.pid(), upage);
                spt.insert(PageEntry::anonymous(upage, true))?;
            }
            let entry = spt.find_mut(upage).ok_or(VmError::IllegalAccess { addr })?;
            if entry.is_loaded() {
                return Ok(FaultOutcome::AlreadyResident);
            }
            if entry.is_pinned() {
                return Ok(FaultOutcome::InFlight);
            }
            entry.start_load()
        };

        self.load_pinned(space, upage, &origin, false)?;
        Ok(FaultOutcome::Loaded)
    }

    /// Bring in `upage`, whose entry the caller has pinned with
    /// [`PageEntry::start_load`]. The entry is unpinned afterwards unless
    /// `keep_pinned` is set and loading succeeded.
    pub(crate) fn load_pinned(
        &self,
        space: &Arc<AddressSpace>,
        upage: usize,
        origin: &PageOrigin,
        keep_pinned: bool,
    ) -> Result<()> {
        let result = self.load(space, upage, origin);
        if result.is_err() || !keep_pinned {
            if let Some(entry) = space.spt().find_mut(upage) {
                entry.set_pinned(false);
            }
        }
        result
    }

    fn load(&self, space: &Arc<AddressSpace>, upage: usize, origin: &PageOrigin) -> Result<()> {
        let (id, kpage) = match self.frames.allocate(space, upage, &self.swap) {
            Ok(frame) => frame,
            Err(e) => {
                self.return_slot(space, upage, origin);
                return Err(e);
            }
        };

        // SAFETY: The frame is not yet reachable from any entry, so it cannot
        // be evicted and nothing else touches it.
        if let Err(e) = unsafe { self.populate(kpage, origin) } {
            warn!("fault: could not load page {:#x}: {}", upage, e);
            self.frames.release(id);
            self.return_slot(space, upage, origin);
            return Err(e);
        }

        let mut spt = space.spt();
        let entry = match spt.find_mut(upage) {
            Some(entry) if entry.is_pinned() => entry,
            // Deleted while we were loading it.
            _ => {
                drop(spt);
                self.frames.release(id);
                return Err(VmError::IllegalAccess { addr: upage });
            }
        };
        if !space.pagedir().map(upage, kpage, entry.writable()) {
            if let PageOrigin::Anonymous { slot: Some(_) } = origin {
                // The swap slot was consumed by `populate`; put the data back.
                // SAFETY: Still unreachable from any mapping.
                match unsafe { self.swap.swap_out(kpage) } {
                    Ok(slot) => entry.set_origin(PageOrigin::Anonymous { slot: Some(slot) }),
                    Err(e) => warn!("fault: lost contents of page {:#x}: {}", upage, e),
                }
            }
            drop(spt);
            self.frames.release(id);
            return Err(VmError::MappingFailed { upage });
        }
        entry.commit(id);
        trace!("fault: page {:#x} -> frame {}", upage, id);
        Ok(())
    }

    /// Give an unconsumed swap slot back after a failed load. If the entry
    /// is gone the slot has no owner left and is freed.
    fn return_slot(&self, space: &AddressSpace, upage: usize, origin: &PageOrigin) {
        if let PageOrigin::Anonymous { slot: Some(slot) } = origin {
            match space.spt().find_mut(upage) {
                Some(entry) if entry.is_pinned() => {
                    entry.set_origin(PageOrigin::Anonymous { slot: Some(*slot) });
                }
                _ => self.swap.free(*slot),
            }
        }
    }

    /// Fill `kpage` with the contents `origin` describes.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to `kpage`.
    unsafe fn populate(&self, kpage: KernelPage, origin: &PageOrigin) -> Result<()> {
        match origin {
            PageOrigin::Binary(segment) | PageOrigin::File(segment) => segment.load(kpage),
            PageOrigin::Anonymous { slot: Some(slot) } => self.swap.swap_in(*slot, kpage),
            PageOrigin::Anonymous { slot: None } => {
                kpage.as_mut_slice().fill(0);
                Ok(())
            }
        }
    }
}
