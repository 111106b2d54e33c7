// https://wiki.osdev.org/Paging

use crate::mem::OFFSET;
use arbitrary_int::{u12, u20};
use bitbybit::bitfield;

/// Flag half of an x86 page table entry. The frame address half is kept
/// beside the entry by whoever owns the table, since kernel addresses are
/// wider than the 20 bits the hardware format leaves for them on the host.
#[bitfield(u32, default = 0)]
pub struct PageTableEntry {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    read_write: bool,
    #[bit(2, rw)]
    user_supervisor: bool,
    #[bit(3, rw)]
    write_through: bool,
    #[bit(4, rw)]
    cache_disable: bool,
    #[bit(5, rw)]
    accessed: bool,
    #[bit(6, rw)]
    dirty: bool,
}

impl PageTableEntry {
    /// A present user-accessible entry.
    pub const fn user(writable: bool) -> Self {
        Self::DEFAULT
            .with_present(true)
            .with_user_supervisor(true)
            .with_read_write(writable)
    }
}

#[bitfield(u32)]
pub struct VirtualAddress {
    #[bits(12..=31, r)]
    page_number: u20,
    #[bits(0..=11, r)]
    offset: u12,
}

impl VirtualAddress {
    /// Split a user address. Returns `None` for kernel addresses.
    pub fn from_user(addr: usize) -> Option<Self> {
        if addr >= OFFSET {
            return None;
        }
        let raw = u32::try_from(addr).ok()?;
        Some(Self::new_with_raw_value(raw))
    }
}
