use super::{frame_table::FrameId, swap::SwapSlot};
use crate::fs::{with_file_lock, File};
use alloc::sync::Arc;
use kidneyos_shared::{
    eprintln,
    mem::{is_page_aligned, PAGE_FRAME_SIZE},
};

/// Where a file-backed page's bytes come from.
#[derive(Debug, Clone)]
pub struct FileSpan {
    pub file: Arc<dyn File>,
    pub offset: u64,
    /// Bytes read from `file` at `offset`.
    pub read_bytes: usize,
    /// Bytes zeroed after those. `read_bytes + zero_bytes` is one page.
    pub zero_bytes: usize,
    /// Dirty pages are written back to the file (mmap). Private pages are
    /// swapped instead once written.
    pub shared: bool,
}

impl FileSpan {
    /// Write the file part of `page`, resident at `vaddr`, back at its offset.
    /// Returns whether all of it was written; failures are logged.
    pub(crate) fn write_back(&self, vaddr: usize, page: &[u8]) -> bool {
        match with_file_lock(|| self.file.write_at(&page[..self.read_bytes], self.offset)) {
            Ok(n) if n == self.read_bytes => true,
            Ok(n) => {
                eprintln!(
                    "vm: short write-back of {vaddr:#x}: {n} of {} bytes",
                    self.read_bytes
                );
                false
            }
            Err(e) => {
                eprintln!("vm: write-back of {vaddr:#x} failed: {e}");
                false
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum PageKind {
    /// Zero-filled on first touch. Holds its swap slot while evicted.
    Anonymous { swap_slot: Option<SwapSlot> },
    FileBacked(FileSpan),
    /// Never loadable; any access kills the process.
    Error,
}

/// Supplemental page table entry: one page of one address space.
#[derive(Debug, Clone)]
pub struct VirtualPageEntry {
    vaddr: usize,
    kind: PageKind,
    writable: bool,
    frame: Option<FrameId>,
}

impl VirtualPageEntry {
    fn new(vaddr: usize, kind: PageKind, writable: bool) -> Self {
        assert!(is_page_aligned(vaddr), "page entry at unaligned {vaddr:#x}");
        Self {
            vaddr,
            kind,
            writable,
            frame: None,
        }
    }

    pub fn anonymous(vaddr: usize, writable: bool) -> Self {
        Self::new(vaddr, PageKind::Anonymous { swap_slot: None }, writable)
    }

    pub fn file_backed(vaddr: usize, span: FileSpan, writable: bool) -> Self {
        assert_eq!(span.read_bytes + span.zero_bytes, PAGE_FRAME_SIZE);
        Self::new(vaddr, PageKind::FileBacked(span), writable)
    }

    pub fn error(vaddr: usize) -> Self {
        Self::new(vaddr, PageKind::Error, false)
    }

    pub fn vaddr(&self) -> usize {
        self.vaddr
    }

    pub fn kind(&self) -> &PageKind {
        &self.kind
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn frame(&self) -> Option<FrameId> {
        self.frame
    }

    pub fn is_loaded(&self) -> bool {
        self.frame.is_some()
    }

    pub fn swap_slot(&self) -> Option<SwapSlot> {
        match self.kind {
            PageKind::Anonymous { swap_slot } => swap_slot,
            _ => None,
        }
    }

    /// Bind the entry to `frame`. Any swap slot was consumed by the page-in.
    pub(crate) fn set_resident(&mut self, frame: FrameId) {
        assert!(
            !matches!(self.kind, PageKind::Error),
            "error page {:#x} made resident",
            self.vaddr
        );
        if let PageKind::Anonymous { swap_slot } = &mut self.kind {
            *swap_slot = None;
        }
        self.frame = Some(frame);
    }

    /// Unbind the entry from its frame. `slot` is where an anonymous page's
    /// bytes went; a private file page with a slot turns anonymous.
    pub(crate) fn set_evicted(&mut self, slot: Option<SwapSlot>) {
        self.frame = None;
        match (&self.kind, slot) {
            (PageKind::Error, _) => unreachable!("error pages are never resident"),
            (PageKind::FileBacked(_), None) => {}
            (_, swap_slot) => self.kind = PageKind::Anonymous { swap_slot },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::memfile::MemFile;

    #[test]
    fn evicted_private_page_turns_anonymous() {
        let span = FileSpan {
            file: MemFile::new(vec![1; 10]),
            offset: 0,
            read_bytes: 10,
            zero_bytes: PAGE_FRAME_SIZE - 10,
            shared: false,
        };
        let mut entry = VirtualPageEntry::file_backed(0x0804_8000, span, true);
        assert!(!entry.is_loaded());

        entry.set_resident(FrameId(3));
        assert!(entry.is_loaded());

        let mut swap = crate::mem::swap::SwapSpace::format(
            alloc::boxed::Box::new(crate::mem::swap::RamDisk::new(16)),
            0..16,
        )
        .unwrap();
        let slot = swap.swap_out(&[0; PAGE_FRAME_SIZE]);
        entry.set_evicted(Some(slot));

        assert!(!entry.is_loaded());
        assert!(matches!(entry.kind(), PageKind::Anonymous { .. }));
        assert_eq!(entry.swap_slot(), Some(slot));

        entry.set_resident(FrameId(0));
        assert_eq!(entry.swap_slot(), None);
    }

    #[test]
    fn write_back_reports_short_and_failed_writes() {
        let file = MemFile::new(vec![0; 16]);
        let mut page = vec![0; PAGE_FRAME_SIZE];
        page[..16].copy_from_slice(b"0123456789abcdef");

        let span = |offset, read_bytes| FileSpan {
            file: file.clone(),
            offset,
            read_bytes,
            zero_bytes: PAGE_FRAME_SIZE - read_bytes,
            shared: true,
        };

        assert!(span(0, 16).write_back(0x0805_0000, &page));
        assert_eq!(file.contents(), b"0123456789abcdef");

        // Only 6 bytes fit before the end of the file.
        assert!(!span(10, 16).write_back(0x0805_0000, &page));
        assert_eq!(file.contents(), b"0123456789012345");

        file.close();
        assert!(!span(0, 16).write_back(0x0805_0000, &page));
    }

    #[test]
    #[should_panic(expected = "unaligned")]
    fn unaligned_entry_panics() {
        VirtualPageEntry::anonymous(0x0804_8010, true);
    }
}
