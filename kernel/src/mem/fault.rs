//! Making pages resident.
//!
//! Hardware page faults and the user pointer validator both end up in
//! [`Vm::handle_fault`].

use super::{
    page::{FileSpan, PageKind},
    swap::SwapSlot,
    AllocFlags,
};
use crate::{
    fs::{self, with_file_lock},
    system::Vm,
    threading::process::{AddressSpace, Pages, Process},
};
use alloc::sync::Arc;
use kidneyos_shared::{
    mem::{is_user_vaddr, page_round_down},
    println,
};
use kidneyos_syscalls::{EFAULT, EIO, EXIT_FAULT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    /// No page entry covers the address.
    NotMapped,
    /// The page is an error page.
    BadPage,
    /// The backing file ended early.
    ShortRead { expected: usize, actual: usize },
    Io(fs::Error),
}

impl core::fmt::Display for FaultError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotMapped => write!(f, "address not mapped"),
            Self::BadPage => write!(f, "error page"),
            Self::ShortRead { expected, actual } => {
                write!(f, "short read: wanted {expected} bytes, got {actual}")
            }
            Self::Io(e) => write!(f, "{e}"),
        }
    }
}

impl core::error::Error for FaultError {}

impl FaultError {
    pub fn to_isize(self) -> isize {
        match self {
            Self::NotMapped | Self::BadPage => EFAULT,
            Self::ShortRead { .. } => EIO,
            Self::Io(e) => e.to_isize(),
        }
    }
}

/// Where the contents of a non-resident page come from.
enum Source {
    Zero,
    Swap(SwapSlot),
    File(FileSpan),
}

fn read_span(span: &FileSpan, page: &mut [u8]) -> Result<(), FaultError> {
    let actual = with_file_lock(|| span.file.read_at(&mut page[..span.read_bytes], span.offset))
        .map_err(FaultError::Io)?;
    if actual != span.read_bytes {
        return Err(FaultError::ShortRead {
            expected: span.read_bytes,
            actual,
        });
    }
    page[span.read_bytes..].fill(0);
    Ok(())
}

impl Vm {
    /// Make the page containing `vaddr` resident in `space`. Does nothing if
    /// it already is.
    pub fn handle_fault(&self, space: &Arc<AddressSpace>, vaddr: usize) -> Result<(), FaultError> {
        let page = page_round_down(vaddr);

        let source = {
            let pages = space.pages();
            let entry = pages.spt.lookup(page).ok_or(FaultError::NotMapped)?;
            if entry.is_loaded() {
                return Ok(());
            }
            match entry.kind() {
                PageKind::Error => return Err(FaultError::BadPage),
                PageKind::Anonymous { swap_slot: None } => Source::Zero,
                PageKind::Anonymous {
                    swap_slot: Some(slot),
                } => Source::Swap(*slot),
                PageKind::FileBacked(span) => Source::File(span.clone()),
            }
        };

        let flags = AllocFlags::DEFAULT
            .with_user(true)
            .with_zero(matches!(source, Source::Zero));
        let (id, frame) = self.frames.lock().allocate(flags, &self.swap);

        // SAFETY: the frame is pinned: it is mapped nowhere and not on the
        // eviction list, so this is the only reference to its bytes.
        let bytes = unsafe { frame.as_mut_slice() };
        match &source {
            Source::Zero => {}
            Source::Swap(slot) => self.swap.lock().swap_in(*slot, bytes),
            Source::File(span) => {
                if let Err(e) = read_span(span, bytes) {
                    self.frames.lock().release(id);
                    return Err(e);
                }
            }
        }

        let mut frames = self.frames.lock();
        let mut pages = space.pages();
        let Pages { page_dir, spt } = &mut *pages;

        // The entry may have been unmapped while the frame was filling.
        let Some(entry) = spt.lookup_mut(page) else {
            frames.release(id);
            return Err(FaultError::NotMapped);
        };
        entry.set_resident(id);
        page_dir.map(page, frame.number, entry.writable());
        frames.install(id, space, page);
        frames.stats_mut().page_ins += 1;

        Ok(())
    }

    /// Handle a page fault taken in user mode, terminating the process if the
    /// access was not legal.
    pub fn page_fault(&self, process: &dyn Process, fault_addr: usize, write: bool) {
        let space = process.address_space();

        let result = if !is_user_vaddr(fault_addr) {
            Err(FaultError::NotMapped)
        } else if write && space.entry(fault_addr).is_some_and(|e| !e.writable()) {
            Err(FaultError::BadPage)
        } else {
            self.handle_fault(space, fault_addr)
        };

        if let Err(e) = result {
            if self.config.trace {
                println!("{}: page fault at {fault_addr:#x}: {e}", process.name());
            }
            process.exit(EXIT_FAULT);
        }
    }
}
