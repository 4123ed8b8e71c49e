#![no_std]

mod defs;

pub use defs::*;

#[cfg(target_arch = "x86")]
mod stubs {
    use super::MapId;
    use core::arch::asm;

    /// Map the whole of open file `fd` at page-aligned `addr`.
    ///
    /// Returns the mapping id, or [`super::MAP_FAILED`].
    #[no_mangle]
    pub extern "C" fn mmap(fd: u32, addr: *mut u8) -> MapId {
        let result;
        unsafe {
            asm!("
                mov eax, 0x5a
                int 0x80
            ", in("ebx") fd, in("ecx") addr, out("eax") result);
        }
        result
    }

    /// Unmap `mapping`, writing dirty pages back to the file first.
    #[no_mangle]
    pub extern "C" fn munmap(mapping: MapId) {
        unsafe {
            asm!("
                mov eax, 0x5b
                int 0x80
            ", in("ebx") mapping, lateout("eax") _);
        }
    }
}

#[cfg(target_arch = "x86")]
pub use stubs::*;
