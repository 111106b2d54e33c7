//! Per-process hardware page table, as seen by the VM subsystem.

use crate::palloc::KernelPage;
use crate::sync::Mutex;
use alloc::{collections::BTreeMap, sync::Arc};
use core::cmp::min;
use kidneyos_shared::mem::{page_offset, PAGE_FRAME_SIZE};
use kidneyos_shared::paging::{PageTableEntry, VirtualAddress};

/// Operations on one process's page directory. `upage` is always page aligned.
pub trait PageDirectory: Send + Sync {
    /// Map `upage` to `kpage`. Returns `false` if the mapping could not be
    /// installed (e.g. no memory for a page table, or not a user address).
    #[must_use]
    fn map(&self, upage: usize, kpage: KernelPage, writable: bool) -> bool;
    /// Remove the mapping for `upage`, returning whether it was dirty.
    fn clear(&self, upage: usize) -> bool;
    /// The page `upage` is mapped to, if any.
    fn lookup(&self, upage: usize) -> Option<KernelPage>;
    fn is_accessed(&self, upage: usize) -> bool;
    fn set_accessed(&self, upage: usize, accessed: bool);
    fn is_dirty(&self, upage: usize) -> bool;
    fn set_dirty(&self, upage: usize, dirty: bool);
}

impl<T: PageDirectory + ?Sized> PageDirectory for Arc<T> {
    fn map(&self, upage: usize, kpage: KernelPage, writable: bool) -> bool {
        (**self).map(upage, kpage, writable)
    }
    fn clear(&self, upage: usize) -> bool {
        (**self).clear(upage)
    }
    fn lookup(&self, upage: usize) -> Option<KernelPage> {
        (**self).lookup(upage)
    }
    fn is_accessed(&self, upage: usize) -> bool {
        (**self).is_accessed(upage)
    }
    fn set_accessed(&self, upage: usize, accessed: bool) {
        (**self).set_accessed(upage, accessed)
    }
    fn is_dirty(&self, upage: usize) -> bool {
        (**self).is_dirty(upage)
    }
    fn set_dirty(&self, upage: usize, dirty: bool) {
        (**self).set_dirty(upage, dirty)
    }
}

/// A fault raised by [`SoftPageDirectory`] on a user access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    pub addr: usize,
    pub write: bool,
    /// The page was mapped but the access violated its protection.
    pub present: bool,
}

#[derive(Clone, Copy)]
struct Mapping {
    pte: PageTableEntry,
    kpage: KernelPage,
}

/// Page directory kept in kernel memory and walked in software.
///
/// User accesses go through [`Self::read`] and [`Self::write`], which set the
/// accessed and dirty bits the way the MMU would and fault on missing or
/// read-only pages.
#[derive(Default)]
pub struct SoftPageDirectory {
    table: Mutex<BTreeMap<u32, Mapping>>,
}

fn page_number(addr: usize) -> Option<u32> {
    VirtualAddress::from_user(addr).map(|va| va.page_number().value())
}

impl SoftPageDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of installed mappings.
    pub fn mapped_pages(&self) -> usize {
        self.table.lock().len()
    }

    fn update(&self, upage: usize, f: impl FnOnce(&mut PageTableEntry)) {
        let Some(vpn) = page_number(upage) else {
            return;
        };
        if let Some(mapping) = self.table.lock().get_mut(&vpn) {
            f(&mut mapping.pte);
        }
    }

    fn entry(&self, upage: usize) -> Option<PageTableEntry> {
        let vpn = page_number(upage)?;
        self.table.lock().get(&vpn).map(|mapping| mapping.pte)
    }

    /// Perform a user access of `len` bytes at `addr`, one page at a time.
    fn access(
        &self,
        addr: usize,
        len: usize,
        write: bool,
        mut f: impl FnMut(&mut [u8], usize),
    ) -> Result<(), PageFault> {
        let mut done = 0;
        while done < len {
            let va = addr + done;
            let fault = PageFault {
                addr: va,
                write,
                present: false,
            };
            let vpn = page_number(va).ok_or(fault)?;
            let mut table = self.table.lock();
            let mapping = table.get_mut(&vpn).ok_or(fault)?;
            if write && !mapping.pte.read_write() {
                return Err(PageFault {
                    present: true,
                    ..fault
                });
            }
            mapping.pte = mapping.pte.with_accessed(true).with_dirty(mapping.pte.dirty() || write);

            let start = page_offset(va);
            let n = min(PAGE_FRAME_SIZE - start, len - done);
            // SAFETY: The mapping is present, so the frame is allocated, and
            // the table lock keeps it from being cleared while we copy.
            let bytes = unsafe { mapping.kpage.as_mut_slice() };
            f(&mut bytes[start..start + n], done);
            done += n;
        }
        Ok(())
    }

    /// Load `buf.len()` bytes from user address `addr`.
    pub fn read(&self, addr: usize, buf: &mut [u8]) -> Result<(), PageFault> {
        let len = buf.len();
        self.access(addr, len, false, |page, done| {
            buf[done..done + page.len()].copy_from_slice(page)
        })
    }

    /// Store `data` at user address `addr`.
    pub fn write(&self, addr: usize, data: &[u8]) -> Result<(), PageFault> {
        self.access(addr, data.len(), true, |page, done| {
            page.copy_from_slice(&data[done..done + page.len()])
        })
    }
}

impl PageDirectory for SoftPageDirectory {
    fn map(&self, upage: usize, kpage: KernelPage, writable: bool) -> bool {
        let Some(vpn) = page_number(upage) else {
            return false;
        };
        self.table.lock().insert(
            vpn,
            Mapping {
                pte: PageTableEntry::user(writable),
                kpage,
            },
        );
        true
    }

    fn clear(&self, upage: usize) -> bool {
        let Some(vpn) = page_number(upage) else {
            return false;
        };
        self.table
            .lock()
            .remove(&vpn)
            .is_some_and(|mapping| mapping.pte.dirty())
    }

    fn lookup(&self, upage: usize) -> Option<KernelPage> {
        let vpn = page_number(upage)?;
        self.table.lock().get(&vpn).map(|mapping| mapping.kpage)
    }

    fn is_accessed(&self, upage: usize) -> bool {
        self.entry(upage).is_some_and(|pte| pte.accessed())
    }

    fn set_accessed(&self, upage: usize, accessed: bool) {
        self.update(upage, |pte| *pte = pte.with_accessed(accessed));
    }

    fn is_dirty(&self, upage: usize) -> bool {
        self.entry(upage).is_some_and(|pte| pte.dirty())
    }

    fn set_dirty(&self, upage: usize, dirty: bool) {
        self.update(upage, |pte| *pte = pte.with_dirty(dirty));
    }
}
