//! Whole-subsystem scenarios: user accesses go through a software page
//! directory and fault into the VM the way a process would.

use crate::block::RamDisk;
use crate::fs::{FileRef, RamFile};
use crate::page::PageOrigin;
use crate::pagedir::SoftPageDirectory;
use crate::palloc::PagePool;
use crate::{AddressSpace, FaultOutcome, Vm, VmError};
use alloc::{boxed::Box, sync::Arc, vec::Vec};
use kidneyos_shared::mem::{PAGE_FRAME_SIZE, SECTORS_PER_PAGE};

struct Process {
    pd: Arc<SoftPageDirectory>,
    space: Arc<AddressSpace>,
}

impl Process {
    fn new(pid: u16) -> Self {
        let pd = Arc::new(SoftPageDirectory::new());
        let space = AddressSpace::new(pid, Box::new(pd.clone()));
        Self { pd, space }
    }

    fn write(&self, vm: &Vm<PagePool>, addr: usize, data: &[u8]) -> crate::Result<()> {
        loop {
            match self.pd.write(addr, data) {
                Ok(()) => return Ok(()),
                Err(fault) => match vm.handle_fault(&self.space, fault.addr, None)? {
                    FaultOutcome::AlreadyResident => {
                        return Err(VmError::ReadOnly { addr: fault.addr })
                    }
                    FaultOutcome::Loaded | FaultOutcome::InFlight => {}
                },
            }
        }
    }

    fn read(&self, vm: &Vm<PagePool>, addr: usize, len: usize) -> crate::Result<Vec<u8>> {
        let mut buf = vec![0; len];
        loop {
            match self.pd.read(addr, &mut buf) {
                Ok(()) => return Ok(buf),
                Err(fault) => {
                    vm.handle_fault(&self.space, fault.addr, None)?;
                }
            }
        }
    }
}

fn vm(pages: usize, swap_slots: u32) -> Vm<PagePool> {
    Vm::new(
        PagePool::new(pages),
        Box::new(RamDisk::new("swap", swap_slots * SECTORS_PER_PAGE)),
    )
}

#[test]
fn test_anonymous_page_survives_eviction() {
    let vm = vm(1, 4);
    let p = Process::new(1);
    p.space.declare_anonymous(0x1000, true).unwrap();
    p.space.declare_anonymous(0x2000, true).unwrap();

    p.write(&vm, 0x1010, b"hello").unwrap();
    p.write(&vm, 0x2000, b"other").unwrap();
    assert!(!p.space.spt().find(0x1000).unwrap().is_loaded());
    assert_eq!(vm.swap().used_slots(), 1);

    assert_eq!(p.read(&vm, 0x1010, 5).unwrap(), b"hello");
    // 0x2000 went out to make room; the slot 0x1000 used is free again.
    assert_eq!(vm.swap().used_slots(), 1);
    assert_eq!(p.read(&vm, 0x2000, 5).unwrap(), b"other");
    assert_eq!(vm.resident_frames(), 1);
}

#[test]
fn test_dirty_binary_page_moves_to_swap() {
    let vm = vm(1, 4);
    let p = Process::new(1);
    let file = Arc::new(RamFile::new(b"abc"));
    p.space
        .load_segment(file.clone(), 0, 0x8000, 3, PAGE_FRAME_SIZE - 3, true)
        .unwrap();

    p.write(&vm, 0x8000, b"X").unwrap();
    vm.evict().unwrap();
    assert!(matches!(
        p.space.spt().find(0x8000).unwrap().origin(),
        PageOrigin::Anonymous { slot: Some(_) }
    ));

    assert_eq!(p.read(&vm, 0x8000, 4).unwrap(), b"Xbc\0");
    assert_eq!(file.contents(), b"abc");
    assert_eq!(file.write_count(), 0);
}

#[test]
fn test_clean_binary_page_is_reread() {
    let vm = vm(1, 4);
    let p = Process::new(1);
    let file: FileRef = Arc::new(RamFile::new(b"text segment"));
    p.space
        .load_segment(file, 0, 0x8000, 12, PAGE_FRAME_SIZE - 12, false)
        .unwrap();

    assert_eq!(p.read(&vm, 0x8000, 4).unwrap(), b"text");
    vm.evict().unwrap();
    assert_eq!(vm.swap().used_slots(), 0);
    assert!(matches!(
        p.space.spt().find(0x8000).unwrap().origin(),
        PageOrigin::Binary(_)
    ));
    assert_eq!(p.read(&vm, 0x8005, 7).unwrap(), b"segment");
    assert_eq!(p.write(&vm, 0x8000, b"x"), Err(VmError::ReadOnly { addr: 0x8000 }));
}

#[test]
fn test_evicted_mmap_page_is_written_back() {
    let vm = vm(1, 4);
    let p = Process::new(1);
    let file = Arc::new(RamFile::new(b"0123456789"));
    let id = vm.mmap(&p.space, file.clone(), 0x20000).unwrap();

    p.write(&vm, 0x20002, b"AB").unwrap();
    vm.evict().unwrap();
    assert_eq!(file.contents(), b"01AB456789");
    assert_eq!(file.write_count(), 1);
    assert_eq!(vm.swap().used_slots(), 0);

    // Reloaded from the file; clean now, so unmapping writes nothing.
    assert_eq!(p.read(&vm, 0x20000, 4).unwrap(), b"01AB");
    vm.munmap(&p.space, id).unwrap();
    assert_eq!(file.write_count(), 1);
}

#[test]
fn test_clean_mmap_page_is_reread_after_eviction() {
    let vm = vm(1, 4);
    let p = Process::new(1);
    let file = Arc::new(RamFile::new(b"mapped file"));
    vm.mmap(&p.space, file.clone(), 0x20000).unwrap();

    assert_eq!(p.read(&vm, 0x20000, 6).unwrap(), b"mapped");
    vm.evict().unwrap();
    assert!(!p.space.spt().find(0x20000).unwrap().is_loaded());
    assert_eq!(vm.swap().used_slots(), 0);
    assert_eq!(file.write_count(), 0);

    assert_eq!(p.read(&vm, 0x20000, 11).unwrap(), b"mapped file");
    assert!(matches!(
        p.space.spt().find(0x20000).unwrap().origin(),
        PageOrigin::File(_)
    ));
    assert_eq!(file.write_count(), 0);
}

#[test]
fn test_evicted_full_mmap_page_is_written_back() {
    let vm = vm(1, 4);
    let p = Process::new(1);
    let original: Vec<u8> = (0..PAGE_FRAME_SIZE).map(|i| (i % 251) as u8).collect();
    let file = Arc::new(RamFile::new(&original));
    vm.mmap(&p.space, file.clone(), 0x30000).unwrap();

    p.write(&vm, 0x30000, b"0123456789").unwrap();
    vm.evict().unwrap();
    let contents = file.contents();
    assert_eq!(contents.len(), PAGE_FRAME_SIZE);
    assert_eq!(&contents[..10], b"0123456789");
    assert_eq!(&contents[10..], &original[10..]);
    assert_eq!(file.write_count(), 1);
    assert_eq!(vm.swap().used_slots(), 0);
}

#[test]
fn test_delete_during_swap_in_keeps_reused_slot() {
    let vm = vm(2, 2);
    let (p, q, r) = (Process::new(1), Process::new(2), Process::new(3));
    for proc in [&p, &q, &r] {
        proc.space.declare_anonymous(0x1000, true).unwrap();
    }
    p.write(&vm, 0x1000, b"AAAA").unwrap();
    vm.evict().unwrap();

    // A loader has pinned P's page and read its slot in, but not committed.
    let origin = p.space.spt().find_mut(0x1000).unwrap().start_load();
    let PageOrigin::Anonymous { slot: Some(slot) } = origin else {
        panic!("page is not in swap");
    };
    let (id, kpage) = vm.frames.allocate(&p.space, 0x1000, &vm.swap).unwrap();
    unsafe { vm.swap.swap_in(slot, kpage) }.unwrap();
    assert_eq!(&unsafe { kpage.as_slice() }[..4], b"AAAA");

    // Q's page is evicted into the slot the loader just emptied.
    q.write(&vm, 0x1000, b"CCCC").unwrap();
    vm.evict().unwrap();
    assert!(matches!(
        q.space.spt().find(0x1000).unwrap().origin(),
        PageOrigin::Anonymous { slot: Some(s) } if *s == slot
    ));

    vm.delete(&p.space, 0x1000).unwrap();
    assert!(vm.swap().is_used(slot));
    vm.frames.release(id);

    r.write(&vm, 0x1000, b"DDDD").unwrap();
    vm.evict().unwrap();
    assert_eq!(q.read(&vm, 0x1000, 4).unwrap(), b"CCCC");
    assert_eq!(r.read(&vm, 0x1000, 4).unwrap(), b"DDDD");
}

#[test]
fn test_swap_exhaustion() {
    let vm = vm(1, 1);
    let p = Process::new(1);
    for upage in [0x1000, 0x2000, 0x3000] {
        p.space.declare_anonymous(upage, true).unwrap();
    }

    p.write(&vm, 0x1000, b"a").unwrap();
    p.write(&vm, 0x2000, b"b").unwrap();
    assert_eq!(p.write(&vm, 0x3000, b"c"), Err(VmError::SwapExhausted));
    assert!(p.space.spt().find(0x2000).unwrap().is_loaded());
    assert!(!p.space.spt().find(0x3000).unwrap().is_pinned());

    // Dropping the swapped page frees its slot.
    vm.delete(&p.space, 0x1000).unwrap();
    assert_eq!(vm.swap().used_slots(), 0);
    p.write(&vm, 0x3000, b"c").unwrap();
    assert_eq!(p.read(&vm, 0x3000, 1).unwrap(), b"c");
    assert!(matches!(
        p.space.spt().find(0x2000).unwrap().origin(),
        PageOrigin::Anonymous { slot: Some(_) }
    ));
}

#[test]
fn test_delete() {
    let vm = vm(2, 4);
    let p = Process::new(1);
    p.space.declare_anonymous(0x1000, true).unwrap();
    p.write(&vm, 0x1000, b"gone").unwrap();

    vm.delete(&p.space, 0x1234).unwrap();
    assert_eq!(vm.delete(&p.space, 0x1000), Err(VmError::NotFound));
    assert_eq!(vm.resident_frames(), 0);
    assert_eq!(p.pd.mapped_pages(), 0);
    assert_eq!(
        vm.handle_fault(&p.space, 0x1000, None),
        Err(VmError::IllegalAccess { addr: 0x1000 })
    );
}

#[test]
fn test_destroy_releases_everything() {
    let vm = vm(2, 8);
    let p = Process::new(1);
    let file = Arc::new(RamFile::new(&[b'.'; 100]));
    vm.mmap(&p.space, file.clone(), 0x40000).unwrap();
    for i in 0..4 {
        p.space
            .declare_anonymous(0x1000 * (i + 1), true)
            .unwrap();
        p.write(&vm, 0x1000 * (i + 1), &[i as u8; 8]).unwrap();
    }
    p.write(&vm, 0x40000, b"mm").unwrap();
    assert!(vm.swap().used_slots() > 0);

    vm.destroy_all(&p.space).unwrap();
    assert_eq!(p.space.page_count(), 0);
    assert_eq!(vm.resident_frames(), 0);
    assert_eq!(vm.swap().used_slots(), 0);
    assert_eq!(vm.frames().allocator().pages_allocated(), 0);
    assert_eq!(vm.frames().allocator().user_pages(), 0);
    assert_eq!(p.pd.mapped_pages(), 0);
    assert_eq!(&file.contents()[..3], b"mm.");
}

#[test]
fn test_concurrent_processes_under_pressure() {
    const THREADS: usize = 4;
    const PAGES: usize = 6;
    const ROUNDS: u8 = 3;

    let vm = vm(8, (THREADS * PAGES) as u32);
    let procs: Vec<Process> = (0..THREADS).map(|pid| Process::new(pid as u16 + 1)).collect();
    for p in &procs {
        for i in 0..PAGES {
            p.space
                .declare_anonymous(0x10000 + i * PAGE_FRAME_SIZE, true)
                .unwrap();
        }
    }

    std::thread::scope(|s| {
        for (t, p) in procs.iter().enumerate() {
            let vm = &vm;
            s.spawn(move || {
                for round in 0..ROUNDS {
                    for i in 0..PAGES {
                        let tag = [t as u8, i as u8, round];
                        p.write(vm, 0x10000 + i * PAGE_FRAME_SIZE + 100, &tag).unwrap();
                    }
                    for i in 0..PAGES {
                        let got = p.read(vm, 0x10000 + i * PAGE_FRAME_SIZE + 100, 3).unwrap();
                        assert_eq!(got, [t as u8, i as u8, round]);
                    }
                }
            });
        }
    });

    assert!(vm.resident_frames() <= 8);
    for p in &procs {
        vm.destroy_all(&p.space).unwrap();
    }
    assert_eq!(vm.resident_frames(), 0);
    assert_eq!(vm.swap().used_slots(), 0);
}
