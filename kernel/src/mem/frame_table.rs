//! The global table of frames backing user pages.
//!
//! Every frame handed to a user page is tracked here by [`FrameId`]. A frame
//! is pinned from [`FrameTable::allocate`] until [`FrameTable::install`] binds
//! it to a page; only installed frames are on the eviction list.

use super::{
    page::PageKind,
    page_replacement::PageReplacementPolicy,
    swap::{SwapSlot, SwapSpace},
    AllocFlags, FrameAllocator, PhysFrame,
};
use crate::{
    sync::Mutex,
    threading::process::{AddressSpace, Pages},
};
use alloc::{
    boxed::Box,
    sync::{Arc, Weak},
    vec::Vec,
};
use kidneyos_shared::{eprintln, println};

/// Index of a frame in the frame table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(pub(crate) usize);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VmStats {
    pub page_ins: usize,
    pub evictions: usize,
    pub swap_outs: usize,
    pub write_backs: usize,
}

struct Owner {
    space: Weak<AddressSpace>,
    vaddr: usize,
}

impl Owner {
    /// Test and clear the hardware accessed bit.
    fn referenced(&self) -> bool {
        let Some(space) = self.space.upgrade() else {
            return false;
        };
        let mut pages = space.pages();
        let accessed = pages.page_dir.is_accessed(self.vaddr);
        if accessed {
            pages.page_dir.set_accessed(self.vaddr, false);
        }
        accessed
    }
}

struct Slot {
    frame: PhysFrame,
    /// `None` while pinned.
    owner: Option<Owner>,
}

pub struct FrameTable {
    allocator: Box<dyn FrameAllocator>,
    slots: Vec<Option<Slot>>,
    free_ids: Vec<usize>,
    policy: Box<dyn PageReplacementPolicy>,
    stats: VmStats,
    trace: bool,
}

impl FrameTable {
    pub fn new(
        allocator: Box<dyn FrameAllocator>,
        policy: Box<dyn PageReplacementPolicy>,
        trace: bool,
    ) -> Self {
        Self {
            allocator,
            slots: Vec::new(),
            free_ids: Vec::new(),
            policy,
            stats: VmStats::default(),
            trace,
        }
    }

    /// Get a pinned frame, evicting resident pages until the allocator has
    /// one to give.
    pub fn allocate(
        &mut self,
        flags: AllocFlags,
        swap: &Mutex<SwapSpace>,
    ) -> (FrameId, PhysFrame) {
        loop {
            if let Some(frame) = self.allocator.alloc(flags) {
                return (self.track(frame), frame);
            }
            self.evict(swap);
        }
    }

    fn track(&mut self, frame: PhysFrame) -> FrameId {
        let slot = Some(Slot { frame, owner: None });
        match self.free_ids.pop() {
            Some(index) => {
                self.slots[index] = slot;
                FrameId(index)
            }
            None => {
                self.slots.push(slot);
                FrameId(self.slots.len() - 1)
            }
        }
    }

    fn slot(&self, id: FrameId) -> &Slot {
        match self.slots.get(id.0) {
            Some(Some(slot)) => slot,
            _ => panic!("stale frame id {}", id.0),
        }
    }

    /// Bind a pinned frame to the page at `vaddr` and make it evictable.
    pub fn install(&mut self, id: FrameId, space: &Arc<AddressSpace>, vaddr: usize) {
        let Some(Some(slot)) = self.slots.get_mut(id.0) else {
            panic!("stale frame id {}", id.0);
        };
        assert!(slot.owner.is_none(), "frame {} installed twice", id.0);

        slot.owner = Some(Owner {
            space: Arc::downgrade(space),
            vaddr,
        });
        self.policy.insert(id);
    }

    /// Give a frame back to the allocator without saving its contents.
    pub fn release(&mut self, id: FrameId) {
        let Some(slot) = self.slots.get_mut(id.0).and_then(Option::take) else {
            panic!("stale frame id {}", id.0);
        };
        self.policy.remove(id);
        self.allocator.dealloc(slot.frame);
        self.free_ids.push(id.0);
    }

    pub fn frame(&self, id: FrameId) -> PhysFrame {
        self.slot(id).frame
    }

    /// Kernel view of physical frame `number`, which must be allocated.
    pub fn physical(&self, number: usize) -> Option<PhysFrame> {
        self.allocator.frame(number)
    }

    /// The page bound to `id`, or `None` while it is pinned or after its
    /// address space is gone.
    pub fn owner(&self, id: FrameId) -> Option<(Arc<AddressSpace>, usize)> {
        let owner = self.slot(id).owner.as_ref()?;
        Some((owner.space.upgrade()?, owner.vaddr))
    }

    pub fn is_evictable(&self, id: FrameId) -> bool {
        self.policy.contains(id)
    }

    /// Frames on the eviction list.
    pub fn resident_count(&self) -> usize {
        self.policy.len()
    }

    /// Frames allocated but not yet installed.
    pub fn pinned_count(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|slot| slot.owner.is_none())
            .count()
    }

    pub fn stats(&self) -> VmStats {
        self.stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut VmStats {
        &mut self.stats
    }

    fn evict(&mut self, swap: &Mutex<SwapSpace>) {
        let slots = &self.slots;
        let victim = self.policy.select_victim(&mut |id| {
            slots[id.0]
                .as_ref()
                .and_then(|slot| slot.owner.as_ref())
                .is_some_and(Owner::referenced)
        });
        let Some(victim) = victim else {
            eprintln!(
                "vm: out of frames and nothing to evict ({} pinned)",
                self.pinned_count()
            );
            panic!("out of memory");
        };

        let slot = self.slot(victim);
        let frame = slot.frame;
        let owner = slot
            .owner
            .as_ref()
            .and_then(|owner| Some((owner.space.upgrade()?, owner.vaddr)));

        // A dead owner is mid-teardown; its frame just goes back.
        if let Some((space, vaddr)) = owner {
            self.page_out(&space, vaddr, frame, swap);
            if self.trace {
                println!("vm: evicted {:#x} of pid {}", vaddr, space.pid());
            }
        }

        self.release(victim);
        self.stats.evictions += 1;
    }

    /// Save the contents of `frame`, resident at `vaddr`, and unmap it.
    fn page_out(
        &mut self,
        space: &Arc<AddressSpace>,
        vaddr: usize,
        frame: PhysFrame,
        swap: &Mutex<SwapSpace>,
    ) {
        let mut pages = space.pages();
        let Pages { page_dir, spt } = &mut *pages;

        let dirty = page_dir.is_dirty(vaddr);
        page_dir.clear(vaddr);

        let Some(entry) = spt.lookup_mut(vaddr) else {
            panic!("resident frame for {vaddr:#x} has no page entry");
        };

        // SAFETY: the page is unmapped and the frame table is locked, so
        // nobody else reads or writes the frame.
        let bytes = unsafe { frame.as_slice() };

        let slot: Option<SwapSlot> = match entry.kind() {
            PageKind::FileBacked(span) if dirty && span.shared => {
                if span.write_back(vaddr, bytes) {
                    self.stats.write_backs += 1;
                }
                None
            }
            PageKind::FileBacked(_) if dirty => Some(swap.lock().swap_out(bytes)),
            PageKind::FileBacked(_) => None,
            PageKind::Anonymous { .. } => Some(swap.lock().swap_out(bytes)),
            PageKind::Error => unreachable!("error page {vaddr:#x} was resident"),
        };
        if slot.is_some() {
            self.stats.swap_outs += 1;
        }

        entry.set_evicted(slot);
    }
}
