use crate::sizes::{MB, SECTOR_SIZE};

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4096;

pub const SECTORS_PER_PAGE: u32 = PAGE_FRAME_SIZE as u32 / SECTOR_SIZE;

// Any virtual address at or above OFFSET is a kernel address.
pub const OFFSET: usize = 0x80000000;

/// The user stack may grow down to `OFFSET - STACK_LIMIT`.
pub const STACK_LIMIT: usize = 8 * MB;

/// `pusha` may touch memory this far below the stack pointer before the
/// pointer itself is moved.
pub const STACK_HEURISTIC: usize = 32;

#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn page_offset(addr: usize) -> usize {
    addr & (PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn is_page_aligned(addr: usize) -> bool {
    page_offset(addr) == 0
}

#[inline]
pub const fn is_user_vaddr(addr: usize) -> bool {
    addr < OFFSET
}

/// Whether a fault at `addr` with user stack pointer `esp` should grow the
/// stack rather than kill the process.
pub const fn is_stack_access(addr: usize, esp: usize) -> bool {
    is_user_vaddr(addr)
        && addr >= OFFSET - STACK_LIMIT
        && addr.saturating_add(STACK_HEURISTIC) >= esp
}
