//! Swap area: page-sized slots on a dedicated block device.
//!
//! Slot `i` occupies sectors `i * SECTORS_PER_PAGE ..(i + 1) * SECTORS_PER_PAGE`.
//! There is no header; the bitmap lives only in memory.

use crate::block::{BlockDevice, BlockSector, BLOCK_SECTOR_SIZE};
use crate::error::{Result, VmError};
use crate::palloc::KernelPage;
use crate::sync::Mutex;
use alloc::boxed::Box;
use bitvec::prelude::*;
use core::fmt;
use kidneyos_shared::mem::SECTORS_PER_PAGE;
use log::{debug, info};

/// Index of a swap slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SwapSlot(usize);

impl SwapSlot {
    pub const fn index(self) -> usize {
        self.0
    }

    fn first_sector(self) -> BlockSector {
        self.0 as BlockSector * SECTORS_PER_PAGE
    }

    #[cfg(test)]
    pub(crate) const fn for_test(index: usize) -> Self {
        Self(index)
    }
}

impl fmt::Display for SwapSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct SwapTable {
    device: Box<dyn BlockDevice>,
    /// Bit `i` is set iff slot `i` holds an evicted page.
    bitmap: Mutex<BitVec>,
}

impl SwapTable {
    pub fn new(device: Box<dyn BlockDevice>) -> Self {
        let slots = (device.size() / SECTORS_PER_PAGE) as usize;
        info!("swap: {} slots on \"{}\"", slots, device.name());
        Self {
            device,
            bitmap: Mutex::new(BitVec::repeat(false, slots)),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.bitmap.lock().len()
    }

    pub fn used_slots(&self) -> usize {
        self.bitmap.lock().count_ones()
    }

    pub fn is_used(&self, slot: SwapSlot) -> bool {
        self.bitmap.lock().get(slot.0).is_some_and(|bit| *bit)
    }

    /// Write the page at `kpage` to the first free slot.
    ///
    /// # Safety
    ///
    /// `kpage` must be allocated and nobody may be writing to it.
    pub unsafe fn swap_out(&self, kpage: KernelPage) -> Result<SwapSlot> {
        let mut bitmap = self.bitmap.lock();
        let slot = SwapSlot(bitmap.first_zero().ok_or(VmError::SwapExhausted)?);

        let page = kpage.as_slice();
        for (i, sector) in page.chunks_exact(BLOCK_SECTOR_SIZE).enumerate() {
            self.device
                .write(slot.first_sector() + i as BlockSector, sector)?;
        }

        bitmap.set(slot.0, true);
        debug!("swap: page {:#x} out to slot {}", kpage.addr(), slot);
        Ok(slot)
    }

    /// Read `slot` back into `kpage` and free the slot. Does nothing if the
    /// slot is free.
    ///
    /// # Safety
    ///
    /// `kpage` must be allocated and exclusively owned by the caller.
    pub unsafe fn swap_in(&self, slot: SwapSlot, kpage: KernelPage) -> Result<()> {
        let mut bitmap = self.bitmap.lock();
        if !bitmap.get(slot.0).is_some_and(|bit| *bit) {
            return Ok(());
        }

        let page = kpage.as_mut_slice();
        for (i, sector) in page.chunks_exact_mut(BLOCK_SECTOR_SIZE).enumerate() {
            self.device
                .read(slot.first_sector() + i as BlockSector, sector)?;
        }

        bitmap.set(slot.0, false);
        debug!("swap: slot {} in to page {:#x}", slot, kpage.addr());
        Ok(())
    }

    /// Discard the contents of `slot`.
    pub fn free(&self, slot: SwapSlot) {
        let mut bitmap = self.bitmap.lock();
        if slot.0 < bitmap.len() {
            bitmap.set(slot.0, false);
        }
    }
}
