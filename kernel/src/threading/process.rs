use crate::{
    fs::{File, FileDescriptor},
    mem::{mmap::MapList, page::VirtualPageEntry, spt::SupplementalPageTable},
    paging::{PageManager, PageMapper},
    sync::{Mutex, MutexGuard},
};
use alloc::{boxed::Box, sync::Arc};

pub type Pid = u16;

/// The parts of an address space that change together on page-in and
/// page-out: the hardware page table and the supplemental page table.
pub struct Pages {
    pub page_dir: Box<dyn PageMapper>,
    pub spt: SupplementalPageTable,
}

/// A process's view of memory.
///
/// `pages` is taken after the frame table lock and before the swap and file
/// locks. `mappings` is never held together with any other VM lock.
pub struct AddressSpace {
    pid: Pid,
    pages: Mutex<Pages>,
    mappings: Mutex<MapList>,
}

impl AddressSpace {
    pub fn new(pid: Pid) -> Arc<Self> {
        Self::with_page_mapper(pid, Box::<PageManager>::default())
    }

    pub fn with_page_mapper(pid: Pid, page_dir: Box<dyn PageMapper>) -> Arc<Self> {
        Arc::new(Self {
            pid,
            pages: Mutex::new(Pages {
                page_dir,
                spt: SupplementalPageTable::default(),
            }),
            mappings: Mutex::new(MapList::default()),
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub(crate) fn pages(&self) -> MutexGuard<'_, Pages> {
        self.pages.lock()
    }

    pub(crate) fn mappings(&self) -> MutexGuard<'_, MapList> {
        self.mappings.lock()
    }

    /// Add a non-resident page, as the loader does for segments and stack.
    /// Returns false if the page already has an entry.
    #[must_use]
    pub fn insert_page(&self, entry: VirtualPageEntry) -> bool {
        self.pages().spt.insert(entry)
    }

    /// A snapshot of the entry covering `vaddr`.
    pub fn entry(&self, vaddr: usize) -> Option<VirtualPageEntry> {
        self.pages().spt.lookup(vaddr).cloned()
    }

    pub fn page_count(&self) -> usize {
        self.pages().spt.len()
    }

    /// Number of live mmap regions.
    pub fn mapping_count(&self) -> usize {
        self.mappings().len()
    }
}

/// What the VM needs from the process that triggered it.
pub trait Process {
    fn name(&self) -> &str;

    fn address_space(&self) -> &Arc<AddressSpace>;

    /// Resolve an open file descriptor.
    fn file(&self, fd: FileDescriptor) -> Option<Arc<dyn File>>;

    /// Terminate the process. Does not return to the caller.
    fn exit(&self, status: i32) -> !;
}
