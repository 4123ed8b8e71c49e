//! Checking and copying user memory on behalf of system calls.
//!
//! The kernel never dereferences a user pointer directly. Every address is
//! checked against the user range and its page is made resident through the
//! fault path first, so a bad pointer terminates the calling process instead
//! of faulting inside the kernel.

use super::{fault::FaultError, page::VirtualPageEntry};
use crate::{
    system::Vm,
    threading::process::{AddressSpace, Pages, Process},
};
use alloc::{string::String, sync::Arc, vec::Vec};
use kidneyos_shared::{
    mem::{is_user_vaddr, page_offset, page_round_down, PAGE_FRAME_SIZE},
    println,
};
use kidneyos_syscalls::{EFAULT, EILSEQ, ERANGE, EXIT_FAULT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserFault {
    /// Outside the user address range.
    BadAddress,
    /// No page entry covers the address.
    Unmapped,
    /// A page entry exists but could not be loaded.
    NotResident,
    /// Write access to a read-only page.
    ReadOnly,
    /// No NUL within the string length cap.
    StringTooLong,
    BadUtf8,
}

impl core::fmt::Display for UserFault {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::BadAddress => write!(f, "bad user address"),
            Self::Unmapped => write!(f, "user address not mapped"),
            Self::NotResident => write!(f, "user page could not be loaded"),
            Self::ReadOnly => write!(f, "user page is read-only"),
            Self::StringTooLong => write!(f, "user string too long"),
            Self::BadUtf8 => write!(f, "user string is not UTF-8"),
        }
    }
}

impl core::error::Error for UserFault {}

impl UserFault {
    pub fn to_isize(self) -> isize {
        match self {
            Self::StringTooLong => ERANGE,
            Self::BadUtf8 => EILSEQ,
            _ => EFAULT,
        }
    }
}

impl From<FaultError> for UserFault {
    fn from(e: FaultError) -> Self {
        match e {
            FaultError::NotMapped => Self::Unmapped,
            _ => Self::NotResident,
        }
    }
}

impl Vm {
    fn kill(&self, process: &dyn Process, addr: usize, fault: UserFault) -> ! {
        if self.config.trace {
            println!("{}: {fault} at {addr:#x}", process.name());
        }
        process.exit(EXIT_FAULT)
    }

    /// Check `addr` and load its page. A missing entry is not an error here;
    /// the caller decides what that means.
    pub fn check_address(
        &self,
        space: &Arc<AddressSpace>,
        addr: usize,
    ) -> Result<Option<VirtualPageEntry>, UserFault> {
        if !is_user_vaddr(addr) {
            return Err(UserFault::BadAddress);
        }
        match self.handle_fault(space, addr) {
            Ok(()) => Ok(space.entry(addr)),
            Err(FaultError::NotMapped) => Ok(None),
            Err(_) => Err(UserFault::NotResident),
        }
    }

    /// [`Vm::check_address`], terminating `process` on failure.
    pub fn validate(&self, process: &dyn Process, addr: usize) -> Option<VirtualPageEntry> {
        self.check_address(process.address_space(), addr)
            .unwrap_or_else(|fault| self.kill(process, addr, fault))
    }

    /// Check every page of `[addr, addr + len)`. Each page needs an entry,
    /// and write targets must not land on read-only pages.
    pub fn check_buffer(
        &self,
        space: &Arc<AddressSpace>,
        addr: usize,
        len: usize,
        to_write: bool,
    ) -> Result<(), UserFault> {
        if len == 0 {
            return Ok(());
        }
        let last = addr.checked_add(len - 1).ok_or(UserFault::BadAddress)?;

        let mut at = addr;
        loop {
            let entry = self.check_address(space, at)?.ok_or(UserFault::Unmapped)?;
            if to_write && !entry.writable() {
                return Err(UserFault::ReadOnly);
            }

            let next = page_round_down(at) + PAGE_FRAME_SIZE;
            if next > last {
                return Ok(());
            }
            at = next;
        }
    }

    pub fn validate_buffer(&self, process: &dyn Process, addr: usize, len: usize, to_write: bool) {
        if let Err(fault) = self.check_buffer(process.address_space(), addr, len, to_write) {
            self.kill(process, addr, fault);
        }
    }

    /// Read a NUL-terminated string one byte at a time, checking each byte
    /// before it is read. The result excludes the NUL. Strings that need more
    /// than `vm.cstr_max` bytes, NUL included, are rejected.
    pub fn check_string(
        &self,
        space: &Arc<AddressSpace>,
        addr: usize,
    ) -> Result<Vec<u8>, UserFault> {
        let mut bytes = Vec::new();

        for i in 0..self.config.cstr_max {
            let at = addr.checked_add(i).ok_or(UserFault::BadAddress)?;
            if self.check_address(space, at)?.is_none() {
                return Err(UserFault::Unmapped);
            }

            let mut byte = [0u8];
            self.copy_from_user(space, at, &mut byte)?;
            if byte[0] == 0 {
                return Ok(bytes);
            }
            bytes.push(byte[0]);
        }

        Err(UserFault::StringTooLong)
    }

    pub fn validate_string(&self, process: &dyn Process, addr: usize) -> Vec<u8> {
        self.check_string(process.address_space(), addr)
            .unwrap_or_else(|fault| self.kill(process, addr, fault))
    }

    pub fn read_user_cstr(
        &self,
        space: &Arc<AddressSpace>,
        addr: usize,
    ) -> Result<String, UserFault> {
        String::from_utf8(self.check_string(space, addr)?).map_err(|_| UserFault::BadUtf8)
    }

    /// Run `f` on the resident page holding `addr`, with the frame table and
    /// the page locked, and update the accessed and dirty bits the way the
    /// MMU would.
    fn with_user_page(
        &self,
        space: &Arc<AddressSpace>,
        addr: usize,
        write: bool,
        f: impl FnOnce(&mut [u8]),
    ) -> Result<(), UserFault> {
        if !is_user_vaddr(addr) {
            return Err(UserFault::BadAddress);
        }

        loop {
            self.handle_fault(space, addr)?;

            let frames = self.frames.lock();
            let mut pages = space.pages();
            let Pages { page_dir, spt } = &mut *pages;

            let entry = spt.lookup(addr).ok_or(UserFault::Unmapped)?;
            if write && !entry.writable() {
                return Err(UserFault::ReadOnly);
            }
            // Evicted again between the fault and taking the locks.
            let Some(number) = page_dir.translate(addr) else {
                continue;
            };
            let Some(frame) = frames.physical(number) else {
                panic!("page {addr:#x} maps unallocated frame {number:#x}");
            };

            page_dir.set_accessed(addr, true);
            if write {
                page_dir.set_dirty(addr, true);
            }

            // SAFETY: the frame is mapped at `addr` and both locks are held,
            // so it can be neither evicted nor touched by another copy.
            f(unsafe { frame.as_mut_slice() });
            return Ok(());
        }
    }

    /// Copy `dst.len()` bytes from user address `src`.
    pub fn copy_from_user(
        &self,
        space: &Arc<AddressSpace>,
        src: usize,
        dst: &mut [u8],
    ) -> Result<(), UserFault> {
        let mut done = 0;
        while done < dst.len() {
            let at = src.checked_add(done).ok_or(UserFault::BadAddress)?;
            let offset = page_offset(at);
            let n = (PAGE_FRAME_SIZE - offset).min(dst.len() - done);

            self.with_user_page(space, at, false, |page| {
                dst[done..done + n].copy_from_slice(&page[offset..offset + n]);
            })?;
            done += n;
        }
        Ok(())
    }

    /// Copy `src` to user address `dst`.
    pub fn copy_to_user(
        &self,
        space: &Arc<AddressSpace>,
        dst: usize,
        src: &[u8],
    ) -> Result<(), UserFault> {
        let mut done = 0;
        while done < src.len() {
            let at = dst.checked_add(done).ok_or(UserFault::BadAddress)?;
            let offset = page_offset(at);
            let n = (PAGE_FRAME_SIZE - offset).min(src.len() - done);

            self.with_user_page(space, at, true, |page| {
                page[offset..offset + n].copy_from_slice(&src[done..done + n]);
            })?;
            done += n;
        }
        Ok(())
    }
}
