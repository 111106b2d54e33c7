//! Kernel access to user memory.
//!
//! The kernel cannot take page faults on user buffers, so it pins each page
//! it touches: the page is loaded if needed and kept out of eviction until
//! the copy is done.

use crate::error::{Result, VmError};
use crate::palloc::PageAllocator;
use crate::space::AddressSpace;
use crate::vm::Vm;
use alloc::sync::Arc;
use core::cmp::min;
use kidneyos_shared::mem::{page_offset, page_round_down, OFFSET, PAGE_FRAME_SIZE};

impl<A: PageAllocator> Vm<A> {
    /// Make the page containing `vaddr` resident and exempt from eviction.
    pub fn pin_page(&self, space: &Arc<AddressSpace>, vaddr: usize) -> Result<()> {
        self.pin(space, vaddr).map(|_| ())
    }

    /// Pin the page containing `vaddr`. Returns whether it was already
    /// pinned and resident, in which case the pin belongs to someone else.
    fn pin(&self, space: &Arc<AddressSpace>, vaddr: usize) -> Result<bool> {
        let upage = page_round_down(vaddr);
        loop {
            let origin = {
                let mut spt = space.spt();
                let entry = spt
                    .find_mut(upage)
                    .ok_or(VmError::IllegalAccess { addr: vaddr })?;
                if entry.is_loaded() {
                    let held = entry.is_pinned();
                    entry.set_pinned(true);
                    return Ok(held);
                }
                if entry.is_pinned() {
                    None
                } else {
                    Some(entry.start_load())
                }
            };
            match origin {
                Some(origin) => return self.load_pinned(space, upage, &origin, true).map(|()| false),
                // Someone else is loading it.
                None => core::hint::spin_loop(),
            }
        }
    }

    /// Let the page containing `vaddr` be evicted again.
    pub fn unpin_page(&self, space: &AddressSpace, vaddr: usize) {
        if let Some(entry) = space.spt().find_mut(vaddr) {
            entry.set_pinned(false);
        }
    }

    /// Copy `buf.len()` bytes from user address `vaddr` into `buf`.
    pub fn copy_from_user(
        &self,
        space: &Arc<AddressSpace>,
        vaddr: usize,
        buf: &mut [u8],
    ) -> Result<usize> {
        let len = buf.len();
        self.copy_user(space, vaddr, len, false, |page, done| {
            buf[done..done + page.len()].copy_from_slice(page)
        })
    }

    /// Copy `data` to user address `vaddr`.
    pub fn copy_to_user(&self, space: &Arc<AddressSpace>, vaddr: usize, data: &[u8]) -> Result<usize> {
        self.copy_user(space, vaddr, data.len(), true, |page, done| {
            page.copy_from_slice(&data[done..done + page.len()])
        })
    }

    fn copy_user(
        &self,
        space: &Arc<AddressSpace>,
        vaddr: usize,
        len: usize,
        write: bool,
        mut f: impl FnMut(&mut [u8], usize),
    ) -> Result<usize> {
        if len == 0 {
            return Ok(0);
        }
        vaddr
            .checked_add(len)
            .filter(|&end| end <= OFFSET)
            .ok_or(VmError::IllegalAccess { addr: vaddr })?;

        let mut done = 0;
        while done < len {
            let va = vaddr + done;
            let upage = page_round_down(va);
            let start = page_offset(va);
            let n = min(PAGE_FRAME_SIZE - start, len - done);

            let writable = space.spt().find(upage).map(|entry| entry.writable());
            match writable {
                None => return Err(VmError::IllegalAccess { addr: va }),
                Some(false) if write => return Err(VmError::ReadOnly { addr: va }),
                Some(_) => {}
            }

            let held = self.pin(space, upage)?;
            let pagedir = space.pagedir();
            let copied = pagedir.lookup(upage).map(|kpage| {
                // SAFETY: The page is pinned, so it stays resident and mapped
                // to `kpage` until we unpin it.
                let bytes = unsafe { kpage.as_mut_slice() };
                f(&mut bytes[start..start + n], done);
                pagedir.set_accessed(upage, true);
                if write {
                    pagedir.set_dirty(upage, true);
                }
            });
            if !held {
                self.unpin_page(space, upage);
            }
            copied.ok_or(VmError::MappingFailed { upage })?;
            done += n;
        }
        Ok(done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::RamDisk;
    use crate::fs::{FileRef, RamFile};
    use crate::pagedir::{PageDirectory, SoftPageDirectory};
    use crate::palloc::PagePool;
    use alloc::boxed::Box;
    use kidneyos_shared::mem::SECTORS_PER_PAGE;

    fn setup(pages: usize) -> (Vm<PagePool>, Arc<SoftPageDirectory>, Arc<AddressSpace>) {
        let vm = Vm::new(
            PagePool::new(pages),
            Box::new(RamDisk::new("swap", 16 * SECTORS_PER_PAGE)),
        );
        let pd = Arc::new(SoftPageDirectory::new());
        let space = AddressSpace::new(3, Box::new(pd.clone()));
        (vm, pd, space)
    }

    #[test]
    fn test_copy_across_pages() {
        let (vm, pd, space) = setup(4);
        space.declare_anonymous(0x1000, true).unwrap();
        space.declare_anonymous(0x2000, true).unwrap();

        let data: Vec<u8> = (0..100).collect();
        assert_eq!(vm.copy_to_user(&space, 0x1FC0, &data), Ok(100));
        assert!(pd.is_dirty(0x1000));
        assert!(pd.is_dirty(0x2000));

        let mut buf = [0u8; 100];
        assert_eq!(vm.copy_from_user(&space, 0x1FC0, &mut buf), Ok(100));
        assert_eq!(&buf[..], &data[..]);
        assert!(!space.spt().find(0x1000).unwrap().is_pinned());
    }

    #[test]
    fn test_copy_rejects_bad_ranges() {
        let (vm, _, space) = setup(2);
        space.declare_anonymous(0x1000, true).unwrap();

        assert_eq!(vm.copy_to_user(&space, 0x1000, &[]), Ok(0));
        assert_eq!(
            vm.copy_to_user(&space, 0x1FFF, &[1, 2]),
            Err(VmError::IllegalAccess { addr: 0x2000 })
        );
        assert_eq!(
            vm.copy_from_user(&space, usize::MAX, &mut [0; 2]),
            Err(VmError::IllegalAccess { addr: usize::MAX })
        );
        assert_eq!(
            vm.copy_from_user(&space, OFFSET - 1, &mut [0; 2]),
            Err(VmError::IllegalAccess { addr: OFFSET - 1 })
        );
    }

    #[test]
    fn test_copy_to_read_only_page() {
        let (vm, _, space) = setup(2);
        let file: FileRef = Arc::new(RamFile::new(b"code"));
        space
            .load_segment(file, 0, 0x8000, 4, PAGE_FRAME_SIZE - 4, false)
            .unwrap();
        assert_eq!(
            vm.copy_to_user(&space, 0x8000, b"xx"),
            Err(VmError::ReadOnly { addr: 0x8000 })
        );
        let mut buf = [0u8; 4];
        vm.copy_from_user(&space, 0x8000, &mut buf).unwrap();
        assert_eq!(&buf, b"code");
    }

    #[test]
    fn test_pinned_page_survives_pressure() {
        let (vm, _, space) = setup(2);
        for i in 0..4 {
            space.declare_anonymous(0x1000 * (i + 1), true).unwrap();
        }
        vm.copy_to_user(&space, 0x1000, b"keep").unwrap();
        vm.pin_page(&space, 0x1000).unwrap();
        for i in 1..4 {
            vm.copy_to_user(&space, 0x1000 * (i + 1), &[i as u8]).unwrap();
            assert!(space.spt().find(0x1000).unwrap().is_loaded());
        }
        vm.unpin_page(&space, 0x1000);
        assert!(vm.pin_page(&space, 0x9000).is_err());
    }

    #[test]
    fn test_copy_keeps_callers_pin() {
        let (vm, _, space) = setup(2);
        for i in 0..4 {
            space.declare_anonymous(0x1000 * (i + 1), true).unwrap();
        }
        vm.pin_page(&space, 0x1000).unwrap();
        let mut buf = [0u8; 4];
        vm.copy_from_user(&space, 0x1000, &mut buf).unwrap();
        assert!(space.spt().find(0x1000).unwrap().is_pinned());

        for i in 1..4 {
            vm.copy_to_user(&space, 0x1000 * (i + 1), &[i as u8]).unwrap();
        }
        let spt = space.spt();
        let entry = spt.find(0x1000).unwrap();
        assert!(entry.is_pinned());
        assert!(entry.is_loaded());
    }
}
