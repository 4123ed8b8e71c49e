//! Collaborators for unit tests: a process whose `exit` panics, a small VM
//! over heap memory, and a checker for the frame/page join.

use crate::{
    config::VmConfig,
    fs::{with_file_lock, File, FileDescriptor},
    mem::{
        frame_allocator::CoreMap,
        swap::{RamDisk, SwapSpace, SECTORS_PER_PAGE},
    },
    sync::Mutex,
    system::Vm,
    threading::process::{AddressSpace, Pid, Process},
};
use std::{
    collections::BTreeMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

pub struct TestProcess {
    name: String,
    space: Arc<AddressSpace>,
    files: Mutex<BTreeMap<FileDescriptor, Arc<dyn File>>>,
}

impl TestProcess {
    pub fn new(name: &str, pid: Pid) -> Self {
        Self {
            name: name.into(),
            space: AddressSpace::new(pid),
            files: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn open(&self, fd: FileDescriptor, file: Arc<dyn File>) {
        self.files.lock().insert(fd, file);
    }

    pub fn close(&self, fd: FileDescriptor) {
        if let Some(file) = self.files.lock().remove(&fd) {
            with_file_lock(|| file.close());
        }
    }
}

impl Process for TestProcess {
    fn name(&self) -> &str {
        &self.name
    }

    fn address_space(&self) -> &Arc<AddressSpace> {
        &self.space
    }

    fn file(&self, fd: FileDescriptor) -> Option<Arc<dyn File>> {
        self.files.lock().get(&fd).cloned()
    }

    fn exit(&self, status: i32) -> ! {
        panic!("{}: exit({status})", self.name);
    }
}

/// A VM with `frames` physical frames and `swap_slots` swap slots.
pub fn test_vm(frames: usize, swap_slots: u32) -> Vm {
    let config = VmConfig {
        swap_start: 0,
        swap_sectors: (swap_slots + 1) * SECTORS_PER_PAGE,
        ..VmConfig::default()
    };
    let swap = SwapSpace::format(
        Box::new(RamDisk::new(config.swap_sectors)),
        config.swap_area(),
    )
    .unwrap();
    Vm::new(config, Box::new(CoreMap::boxed(frames)), swap)
}

/// Run `f`, returning the panic message if it panicked, which is how a
/// [`TestProcess`] exits.
pub fn exit_message(f: impl FnOnce()) -> Option<String> {
    let payload = catch_unwind(AssertUnwindSafe(f)).err()?;
    match payload.downcast::<String>() {
        Ok(message) => Some(*message),
        Err(payload) => payload.downcast_ref::<&str>().map(|s| s.to_string()),
    }
}

/// Every resident page has exactly one frame, mapped at its address and on
/// the eviction list, and every frame on the eviction list has such a page.
pub fn check_invariants(vm: &Vm, spaces: &[&Arc<AddressSpace>]) {
    let frames = vm.frames.lock();
    let mut resident = 0;

    for space in spaces {
        let pages = space.pages();
        for entry in pages.spt.iter() {
            let vaddr = entry.vaddr();
            let Some(id) = entry.frame() else {
                assert_eq!(
                    pages.page_dir.translate(vaddr),
                    None,
                    "{vaddr:#x} mapped but not loaded"
                );
                continue;
            };
            resident += 1;

            assert!(frames.is_evictable(id), "{vaddr:#x} not on the eviction list");
            let (owner, owner_vaddr) = frames.owner(id).unwrap();
            assert!(Arc::ptr_eq(&owner, space));
            assert_eq!(owner_vaddr, vaddr);
            assert_eq!(pages.page_dir.translate(vaddr), Some(frames.frame(id).number));
            assert_eq!(entry.swap_slot(), None);
        }
    }

    assert_eq!(frames.resident_count(), resident);
}
