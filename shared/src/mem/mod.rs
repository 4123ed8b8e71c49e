use crate::sizes::KB;

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4 * KB;

// Any virtual address at or above OFFSET is a kernel address.
pub const OFFSET: usize = 0x80000000;

// User programs are linked at 0x08048000; nothing below it is ever handed out to
// a process, so any pointer under it is treated as garbage.
pub const USER_VADDR_START: usize = 0x0804_8000;

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

/// Whether `addr` may be touched by user code.
#[inline]
pub const fn is_user_vaddr(addr: usize) -> bool {
    addr >= USER_VADDR_START && addr < OFFSET
}
