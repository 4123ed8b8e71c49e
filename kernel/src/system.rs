use crate::{
    config::VmConfig,
    mem::{
        frame_table::{FrameTable, VmStats},
        mmap::Unmap,
        page_replacement::Clock,
        swap::{SwapDevice, SwapError, SwapSpace},
        FrameAllocator,
    },
    sync::Mutex,
    threading::process::{AddressSpace, Pages, Process},
};
use alloc::{boxed::Box, sync::Arc};
use kidneyos_shared::println;
use once_cell::race::OnceBox;

/// The virtual memory system.
///
/// Locks are always taken in field order: `frames`, then an address space's
/// pages, then `swap`, then [`crate::fs::FILESYS_LOCK`].
pub struct Vm {
    pub(crate) config: VmConfig,
    pub(crate) frames: Mutex<FrameTable>,
    pub(crate) swap: Mutex<SwapSpace>,
}

impl Vm {
    pub fn new(config: VmConfig, allocator: Box<dyn FrameAllocator>, swap: SwapSpace) -> Self {
        Self {
            config,
            frames: Mutex::new(FrameTable::new(
                allocator,
                Box::<Clock>::default(),
                config.trace,
            )),
            swap: Mutex::new(swap),
        }
    }

    /// Bring up the VM on `device`, formatting the swap area if it has no
    /// valid header.
    pub fn boot(
        config: VmConfig,
        allocator: Box<dyn FrameAllocator>,
        device: Box<dyn SwapDevice>,
    ) -> Result<Self, SwapError> {
        let swap = SwapSpace::open(device, config.swap_area())?;
        Ok(Self::new(config, allocator, swap))
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn stats(&self) -> VmStats {
        self.frames.lock().stats()
    }

    /// Frames currently backing a user page.
    pub fn resident_frames(&self) -> usize {
        self.frames.lock().resident_count()
    }

    pub fn swap_slots_in_use(&self) -> usize {
        self.swap.lock().in_use()
    }

    /// Release everything `space` holds: mappings first, then resident frames
    /// and swap slots of the remaining pages.
    pub fn tear_down(&self, space: &Arc<AddressSpace>) {
        self.munmap(space, Unmap::All);

        let mut frames = self.frames.lock();
        let mut pages = space.pages();
        let Pages { page_dir, spt } = &mut *pages;

        for entry in spt.drain() {
            if let Some(id) = entry.frame() {
                page_dir.clear(entry.vaddr());
                frames.release(id);
            } else if let Some(slot) = entry.swap_slot() {
                self.swap.lock().free(slot);
            }
        }

        if self.config.trace {
            println!("vm: tore down address space of pid {}", space.pid());
        }
    }
}

static VM: OnceBox<Vm> = OnceBox::new();

/// Make `vm` the system VM. Panics if one is already installed.
pub fn install(vm: Vm) -> &'static Vm {
    if VM.set(Box::new(vm)).is_err() {
        panic!("VM already installed");
    }
    unwrap_vm()
}

pub fn unwrap_vm() -> &'static Vm {
    match VM.get() {
        Some(vm) => vm,
        None => panic!("VM not initialized"),
    }
}

/// Entry point from the page fault trap for faults in user mode.
pub fn page_fault_handler(process: &dyn Process, fault_addr: usize, write: bool) {
    unwrap_vm().page_fault(process, fault_addr, write);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fs::{memfile::MemFile, File},
        mem::{
            frame_allocator::CoreMap,
            page::{FileSpan, PageKind, VirtualPageEntry},
            swap::RamDisk,
        },
        testing::{check_invariants, test_vm, TestProcess},
    };
    use kidneyos_shared::mem::PAGE_FRAME_SIZE;

    const BASE: usize = 0x0805_0000;

    fn pattern(page: usize) -> Vec<u8> {
        (0..PAGE_FRAME_SIZE)
            .map(|i| (i * 7 + page * 31) as u8)
            .collect()
    }

    fn add_anonymous(space: &Arc<AddressSpace>, count: usize) {
        for i in 0..count {
            add_anonymous_at(space, BASE + i * PAGE_FRAME_SIZE);
        }
    }

    #[test]
    fn anonymous_pages_round_trip_through_swap() {
        let vm = test_vm(2, 8);
        let space = AddressSpace::new(1);
        add_anonymous(&space, 5);

        for i in 0..5 {
            vm.copy_to_user(&space, BASE + i * PAGE_FRAME_SIZE, &pattern(i)).unwrap();
            check_invariants(&vm, &[&space]);
        }
        assert_eq!(vm.resident_frames(), 2);
        assert!(vm.stats().swap_outs >= 3);

        for i in (0..5).rev() {
            let mut buf = vec![0; PAGE_FRAME_SIZE];
            vm.copy_from_user(&space, BASE + i * PAGE_FRAME_SIZE, &mut buf).unwrap();
            assert_eq!(buf, pattern(i), "page {i}");
            check_invariants(&vm, &[&space]);
        }
    }

    #[test]
    fn dirty_private_file_page_moves_to_swap() {
        let vm = test_vm(1, 4);
        let space = AddressSpace::new(1);
        let file = MemFile::new(vec![b'a'; 64]);
        let span = FileSpan {
            file: file.clone(),
            offset: 0,
            read_bytes: 64,
            zero_bytes: PAGE_FRAME_SIZE - 64,
            shared: false,
        };
        assert!(space.insert_page(VirtualPageEntry::file_backed(BASE, span, true)));
        add_anonymous_at(&space, BASE + PAGE_FRAME_SIZE);

        vm.copy_to_user(&space, BASE, b"zz").unwrap();
        // Touching the other page evicts BASE.
        vm.copy_to_user(&space, BASE + PAGE_FRAME_SIZE, b"x").unwrap();

        let entry = space.entry(BASE).unwrap();
        assert!(matches!(entry.kind(), PageKind::Anonymous { swap_slot: Some(_) }));
        assert_eq!(file.contents(), vec![b'a'; 64]);

        let mut buf = [0u8; 3];
        vm.copy_from_user(&space, BASE, &mut buf).unwrap();
        assert_eq!(&buf, b"zza");
    }

    #[test]
    fn clean_private_file_page_is_reread() {
        let vm = test_vm(1, 1);
        let space = AddressSpace::new(1);
        let span = FileSpan {
            file: MemFile::new(b"text".to_vec()),
            offset: 0,
            read_bytes: 4,
            zero_bytes: PAGE_FRAME_SIZE - 4,
            shared: false,
        };
        assert!(space.insert_page(VirtualPageEntry::file_backed(BASE, span, false)));
        add_anonymous_at(&space, BASE + PAGE_FRAME_SIZE);

        let mut buf = [0u8; 4];
        vm.copy_from_user(&space, BASE, &mut buf).unwrap();
        vm.copy_from_user(&space, BASE + PAGE_FRAME_SIZE, &mut buf).unwrap();

        assert!(!space.entry(BASE).unwrap().is_loaded());
        assert_eq!(vm.stats().swap_outs, 0);
        assert_eq!(vm.swap_slots_in_use(), 0);

        vm.copy_from_user(&space, BASE, &mut buf).unwrap();
        assert_eq!(&buf, b"text");
    }

    #[test]
    fn evicted_mapped_page_is_written_to_file() {
        let vm = test_vm(1, 1);
        let process = TestProcess::new("p", 1);
        let file = MemFile::new(vec![0; 10]);
        process.open(3, file.clone());
        let space = process.address_space();

        vm.mmap(&process, 3, BASE).unwrap();
        add_anonymous_at(space, BASE + 0x10000);

        vm.copy_to_user(space, BASE + 2, b"mm").unwrap();
        vm.copy_to_user(space, BASE + 0x10000, b"x").unwrap();

        assert_eq!(vm.stats().write_backs, 1);
        assert_eq!(vm.swap_slots_in_use(), 0);
        assert_eq!(file.contents(), b"\0\0mm\0\0\0\0\0\0");
        assert!(matches!(space.entry(BASE).unwrap().kind(), PageKind::FileBacked(_)));
    }

    #[test]
    fn failed_write_back_is_not_counted() {
        let vm = test_vm(1, 1);
        let space = AddressSpace::new(1);
        let file = MemFile::new(vec![0; 10]);
        let span = FileSpan {
            file: file.clone(),
            offset: 0,
            read_bytes: 10,
            zero_bytes: PAGE_FRAME_SIZE - 10,
            shared: true,
        };
        assert!(space.insert_page(VirtualPageEntry::file_backed(BASE, span, true)));
        add_anonymous_at(&space, BASE + PAGE_FRAME_SIZE);

        vm.copy_to_user(&space, BASE, b"lost").unwrap();
        file.close();
        vm.copy_to_user(&space, BASE + PAGE_FRAME_SIZE, b"x").unwrap();

        assert_eq!(vm.stats().evictions, 1);
        assert_eq!(vm.stats().write_backs, 0);
        assert_eq!(file.contents(), vec![0; 10]);
        assert!(!space.entry(BASE).unwrap().is_loaded());
    }

    fn add_anonymous_at(space: &Arc<AddressSpace>, vaddr: usize) {
        assert!(space.insert_page(VirtualPageEntry::anonymous(vaddr, true)));
    }

    #[test]
    fn processes_compete_for_frames() {
        let vm = test_vm(3, 16);
        let a = AddressSpace::new(1);
        let b = AddressSpace::new(2);
        add_anonymous(&a, 4);
        add_anonymous(&b, 4);

        for round in 0..3 {
            for (n, space) in [&a, &b].into_iter().enumerate() {
                for i in 0..4 {
                    let vaddr = BASE + i * PAGE_FRAME_SIZE;
                    vm.copy_to_user(space, vaddr, &pattern(i + n * 4 + round)).unwrap();
                    check_invariants(&vm, &[&a, &b]);
                }
            }
        }

        for (n, space) in [&a, &b].into_iter().enumerate() {
            for i in 0..4 {
                let mut buf = vec![0; PAGE_FRAME_SIZE];
                vm.copy_from_user(space, BASE + i * PAGE_FRAME_SIZE, &mut buf).unwrap();
                assert_eq!(buf, pattern(i + n * 4 + 2));
            }
        }
        check_invariants(&vm, &[&a, &b]);
    }

    #[test]
    fn concurrent_processes_keep_their_data() {
        let vm = test_vm(4, 32);

        std::thread::scope(|s| {
            for pid in 1..=4u16 {
                let vm = &vm;
                s.spawn(move || {
                    let space = AddressSpace::new(pid);
                    add_anonymous(&space, 3);
                    for round in 0..20 {
                        for i in 0..3 {
                            let data = pattern(i + round + usize::from(pid));
                            vm.copy_to_user(&space, BASE + i * PAGE_FRAME_SIZE, &data).unwrap();
                        }
                        for i in 0..3 {
                            let mut buf = vec![0; PAGE_FRAME_SIZE];
                            vm.copy_from_user(&space, BASE + i * PAGE_FRAME_SIZE, &mut buf)
                                .unwrap();
                            assert_eq!(buf, pattern(i + round + usize::from(pid)));
                        }
                    }
                    vm.tear_down(&space);
                });
            }
        });

        assert_eq!(vm.resident_frames(), 0);
        assert_eq!(vm.swap_slots_in_use(), 0);
        assert_eq!(vm.frames.lock().pinned_count(), 0);
    }

    #[test]
    fn tear_down_releases_everything() {
        let vm = test_vm(2, 8);
        let process = TestProcess::new("p", 1);
        let file = MemFile::new(vec![1; 3 * PAGE_FRAME_SIZE]);
        process.open(3, file.clone());
        let space = process.address_space();

        add_anonymous(space, 3);
        vm.mmap(&process, 3, BASE + 0x10000).unwrap();
        for i in 0..3 {
            vm.copy_to_user(space, BASE + i * PAGE_FRAME_SIZE, b"anon").unwrap();
            vm.copy_to_user(space, BASE + 0x10000 + i * PAGE_FRAME_SIZE, b"file").unwrap();
        }
        assert!(vm.swap_slots_in_use() > 0);

        vm.tear_down(space);

        assert_eq!(space.page_count(), 0);
        assert_eq!(space.mapping_count(), 0);
        assert_eq!(vm.resident_frames(), 0);
        assert_eq!(vm.swap_slots_in_use(), 0);
        assert_eq!(file.open_count(), 1);
        for i in 0..3 {
            let at = i * PAGE_FRAME_SIZE;
            assert_eq!(&file.contents()[at..at + 4], b"file");
        }

        // Nothing left to do the second time.
        vm.tear_down(space);
    }

    #[test]
    fn boot_formats_blank_device() {
        let config = VmConfig::parse("vm.swap_start=8 vm.swap_sectors=32").unwrap();
        let vm = Vm::boot(config, Box::new(CoreMap::boxed(1)), Box::new(RamDisk::new(40)))
            .unwrap();
        assert_eq!(vm.config().swap_area(), 8..40);
        assert_eq!(vm.swap.lock().capacity(), 3);

        assert_eq!(
            Vm::boot(config, Box::new(CoreMap::boxed(1)), Box::new(RamDisk::new(16))).err(),
            Some(SwapError::DeviceTooSmall)
        );
    }

    #[test]
    fn installed_vm_handles_page_faults() {
        let vm = install(test_vm(1, 1));
        assert!(core::ptr::eq(vm, unwrap_vm()));

        let process = TestProcess::new("init", 1);
        add_anonymous_at(process.address_space(), BASE);
        page_fault_handler(&process, BASE + 4, true);
        assert!(process.address_space().entry(BASE).unwrap().is_loaded());

        vm.tear_down(process.address_space());
    }
}
