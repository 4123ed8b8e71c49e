use super::{AllocFlags, FrameAllocator, PhysFrame};
use alloc::boxed::Box;
use bitbybit::bitfield;
use core::ptr::NonNull;
use kidneyos_shared::mem::PAGE_FRAME_SIZE;

#[bitfield(u8, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
    #[bit(1, rw)]
    is_kernel: bool,
}

#[repr(C, align(4096))]
struct PageBuf([u8; PAGE_FRAME_SIZE]);

/// Frame number given to the first frame of a heap-backed [`CoreMap`].
const HEAP_FIRST_FRAME: usize = 0x400;

/// Single-frame allocator over a contiguous run of physical memory, with one
/// [`CoreMapEntry`] per frame and a next-fit cursor.
pub struct CoreMap {
    start: NonNull<u8>,
    first_frame: usize,
    core_map: Box<[CoreMapEntry]>,
    frames_allocated: usize,
    position: usize,
    // Keeps heap memory alive for `boxed` core maps.
    _backing: Option<Box<[PageBuf]>>,
}

// SAFETY: The core map owns the frames it hands out bookkeeping for; the raw
// start pointer is never shared outside of PhysFrame.
unsafe impl Send for CoreMap {}

impl CoreMap {
    /// # Safety
    ///
    /// `start` must point to `frames * PAGE_FRAME_SIZE` bytes that nothing else
    /// uses for the lifetime of the core map, and `first_frame` must be the
    /// physical frame number of `start`.
    pub unsafe fn new_in(start: NonNull<u8>, first_frame: usize, frames: usize) -> Self {
        Self {
            start,
            first_frame,
            core_map: alloc::vec![CoreMapEntry::DEFAULT; frames].into_boxed_slice(),
            frames_allocated: 0,
            position: 0,
            _backing: None,
        }
    }

    /// A core map over `frames` frames of kernel heap.
    pub fn boxed(frames: usize) -> Self {
        let mut backing: Box<[PageBuf]> = (0..frames)
            .map(|_| PageBuf([0; PAGE_FRAME_SIZE]))
            .collect();
        let start = backing
            .first_mut()
            .map_or(NonNull::dangling(), |page| NonNull::from(page).cast());

        // SAFETY: `backing` holds `frames` pages and moves in with the pointer.
        let mut core_map = unsafe { Self::new_in(start, HEAP_FIRST_FRAME, frames) };
        core_map._backing = Some(backing);
        core_map
    }

    pub fn frames_allocated(&self) -> usize {
        self.frames_allocated
    }

    pub fn capacity(&self) -> usize {
        self.core_map.len()
    }

    fn kaddr(&self, index: usize) -> NonNull<u8> {
        // SAFETY: index is within the region given to `new_in`.
        unsafe { NonNull::new_unchecked(self.start.as_ptr().add(index * PAGE_FRAME_SIZE)) }
    }

    fn index_of(&self, number: usize) -> Option<usize> {
        number
            .checked_sub(self.first_frame)
            .filter(|&index| index < self.core_map.len())
    }
}

impl FrameAllocator for CoreMap {
    fn alloc(&mut self, flags: AllocFlags) -> Option<PhysFrame> {
        let total = self.core_map.len();
        if self.frames_allocated == total {
            return None;
        }

        let index = (0..total)
            .map(|i| (self.position + i) % total)
            .find(|&i| !self.core_map[i].allocated())?;

        self.core_map[index] = self.core_map[index]
            .with_allocated(true)
            .with_is_kernel(!flags.user());
        self.position = (index + 1) % total;
        self.frames_allocated += 1;

        let frame = PhysFrame {
            number: self.first_frame + index,
            kaddr: self.kaddr(index),
        };
        if flags.zero() {
            // SAFETY: the frame was free a moment ago, so nobody else holds it.
            unsafe { frame.kaddr.as_ptr().write_bytes(0, PAGE_FRAME_SIZE) };
        }
        Some(frame)
    }

    fn dealloc(&mut self, frame: PhysFrame) {
        let Some(index) = self.index_of(frame.number) else {
            panic!("frame {:#x} does not belong to this core map", frame.number);
        };
        assert!(
            self.core_map[index].allocated(),
            "double free of frame {:#x}",
            frame.number
        );

        self.core_map[index] = CoreMapEntry::DEFAULT;
        self.frames_allocated -= 1;
    }

    fn frame(&self, number: usize) -> Option<PhysFrame> {
        let index = self.index_of(number)?;
        self.core_map[index].allocated().then(|| PhysFrame {
            number,
            kaddr: self.kaddr(index),
        })
    }
}
