pub mod fault;
pub mod frame_allocator;
pub mod frame_table;
pub mod mmap;
pub mod page;
pub mod page_replacement;
pub mod spt;
pub mod swap;
pub mod user;

use bitbybit::bitfield;
use core::ptr::NonNull;
use kidneyos_shared::mem::PAGE_FRAME_SIZE;

#[bitfield(u8, default = 0)]
pub struct AllocFlags {
    /// Fill the frame with zeroes before handing it out.
    #[bit(0, rw)]
    zero: bool,
    /// The frame will back a user page.
    #[bit(1, rw)]
    user: bool,
}

/// One physical page frame, as seen from the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysFrame {
    /// Physical frame number, as stored in a page table entry.
    pub number: usize,
    /// Where the kernel can reach the frame's bytes.
    pub kaddr: NonNull<u8>,
}

// SAFETY: A PhysFrame is only a name for memory owned by the frame allocator;
// access to the bytes is synchronized by whoever holds the frame.
unsafe impl Send for PhysFrame {}

impl PhysFrame {
    /// # Safety
    ///
    /// The frame must be allocated, and nobody may write to it for `'a`.
    pub unsafe fn as_slice<'a>(self) -> &'a [u8] {
        core::slice::from_raw_parts(self.kaddr.as_ptr(), PAGE_FRAME_SIZE)
    }

    /// # Safety
    ///
    /// The frame must be allocated, and the caller must be its only user for `'a`.
    pub unsafe fn as_mut_slice<'a>(self) -> &'a mut [u8] {
        core::slice::from_raw_parts_mut(self.kaddr.as_ptr(), PAGE_FRAME_SIZE)
    }
}

/// The physical page allocator the VM draws user frames from.
pub trait FrameAllocator: Send {
    /// Allocate one frame, or `None` when physical memory is exhausted.
    fn alloc(&mut self, flags: AllocFlags) -> Option<PhysFrame>;

    /// Return a frame obtained from [`FrameAllocator::alloc`].
    fn dealloc(&mut self, frame: PhysFrame);

    /// Look up an allocated frame by its physical frame number.
    fn frame(&self, number: usize) -> Option<PhysFrame>;
}
