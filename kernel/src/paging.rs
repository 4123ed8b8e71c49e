//! Per-process hardware page tables.
//!
//! The VM core only touches page tables through [`PageMapper`], which exposes
//! the handful of operations the fault, eviction and unmap paths need.

// Avoids lots of warnings about casting usize to u32 which cannot result in
// truncation on a 32-bit platform, which is all we support.
#![allow(clippy::cast_possible_truncation)]

use alloc::{boxed::Box, vec::Vec};
use kidneyos_shared::paging::{PageTable, PageTableEntry, VirtualAddress, PAGE_TABLE_LEN};

pub trait PageMapper: Send {
    /// Point `vaddr`'s page at physical frame `frame`. The page must not
    /// already be mapped.
    fn map(&mut self, vaddr: usize, frame: usize, writable: bool);

    /// Mark `vaddr`'s page not present. Later accesses fault.
    fn clear(&mut self, vaddr: usize);

    /// Physical frame number backing `vaddr`, if the page is present.
    fn translate(&self, vaddr: usize) -> Option<usize>;

    fn is_accessed(&self, vaddr: usize) -> bool;
    fn set_accessed(&mut self, vaddr: usize, accessed: bool);
    fn is_dirty(&self, vaddr: usize) -> bool;
    fn set_dirty(&mut self, vaddr: usize, dirty: bool);
    fn is_writable(&self, vaddr: usize) -> bool;
}

/// A two-level x86 page directory.
///
/// Tables are allocated on first use and live on the kernel heap. The
/// directory entries themselves are kept implicitly: a slot in `tables` is
/// the page directory entry for that 4 MiB region.
pub struct PageManager {
    tables: Vec<Option<Box<PageTable>>>,
}

impl Default for PageManager {
    fn default() -> Self {
        Self {
            tables: core::iter::repeat_with(|| None)
                .take(PAGE_TABLE_LEN)
                .collect(),
        }
    }
}

impl PageManager {
    fn entry(&self, vaddr: usize) -> Option<&PageTableEntry> {
        let va = VirtualAddress::of(vaddr);
        let table = self.tables[va.page_directory_index().value() as usize].as_ref()?;
        Some(&table[va.page_table_index().value() as usize]).filter(|pte| pte.present())
    }

    fn entry_mut(&mut self, vaddr: usize) -> Option<&mut PageTableEntry> {
        let va = VirtualAddress::of(vaddr);
        let table = self.tables[va.page_directory_index().value() as usize].as_mut()?;
        Some(&mut table[va.page_table_index().value() as usize]).filter(|pte| pte.present())
    }

    fn update(&mut self, vaddr: usize, f: impl FnOnce(PageTableEntry) -> PageTableEntry) {
        if let Some(pte) = self.entry_mut(vaddr) {
            *pte = f(*pte);
        }
    }

    /// Number of present user pages.
    pub fn mapped(&self) -> usize {
        self.tables
            .iter()
            .flatten()
            .map(|table| table.iter().filter(|pte| pte.present()).count())
            .sum()
    }
}

impl PageMapper for PageManager {
    fn map(&mut self, vaddr: usize, frame: usize, writable: bool) {
        let va = VirtualAddress::of(vaddr);
        let table = self.tables[va.page_directory_index().value() as usize]
            .get_or_insert_with(Box::default);
        let pte = &mut table[va.page_table_index().value() as usize];

        assert!(!pte.present(), "page {vaddr:#x} is already mapped");
        *pte = PageTableEntry::user_page(frame, writable);
    }

    fn clear(&mut self, vaddr: usize) {
        self.update(vaddr, |pte| pte.with_present(false));
    }

    fn translate(&self, vaddr: usize) -> Option<usize> {
        self.entry(vaddr).and_then(PageTableEntry::frame)
    }

    fn is_accessed(&self, vaddr: usize) -> bool {
        self.entry(vaddr).is_some_and(|pte| pte.accessed())
    }

    fn set_accessed(&mut self, vaddr: usize, accessed: bool) {
        self.update(vaddr, |pte| pte.with_accessed(accessed));
    }

    fn is_dirty(&self, vaddr: usize) -> bool {
        self.entry(vaddr).is_some_and(|pte| pte.dirty())
    }

    fn set_dirty(&mut self, vaddr: usize, dirty: bool) {
        self.update(vaddr, |pte| pte.with_dirty(dirty));
    }

    fn is_writable(&self, vaddr: usize) -> bool {
        self.entry(vaddr).is_some_and(|pte| pte.read_write())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 0x0805_0000;

    #[test]
    fn map_translate_clear() {
        let mut pd = PageManager::default();
        assert_eq!(pd.translate(PAGE), None);

        pd.map(PAGE, 0x1234, true);
        assert_eq!(pd.translate(PAGE), Some(0x1234));
        assert_eq!(pd.translate(PAGE + 0xfff), Some(0x1234));
        assert_eq!(pd.translate(PAGE + 0x1000), None);
        assert!(pd.is_writable(PAGE));
        assert_eq!(pd.mapped(), 1);

        pd.clear(PAGE);
        assert_eq!(pd.translate(PAGE), None);
        assert_eq!(pd.mapped(), 0);

        // A cleared page can be mapped again.
        pd.map(PAGE, 0x99, false);
        assert!(!pd.is_writable(PAGE));
    }

    #[test]
    fn accessed_and_dirty_bits() {
        let mut pd = PageManager::default();
        pd.map(PAGE, 7, true);
        assert!(!pd.is_accessed(PAGE));
        assert!(!pd.is_dirty(PAGE));

        pd.set_accessed(PAGE, true);
        pd.set_dirty(PAGE, true);
        assert!(pd.is_accessed(PAGE));
        assert!(pd.is_dirty(PAGE));

        pd.set_accessed(PAGE, false);
        assert!(!pd.is_accessed(PAGE));
        assert!(pd.is_dirty(PAGE));
    }

    #[test]
    fn bits_on_unmapped_pages_are_clear() {
        let mut pd = PageManager::default();
        pd.set_dirty(PAGE, true);
        assert!(!pd.is_dirty(PAGE));
        assert!(!pd.is_accessed(PAGE));
    }

    #[test]
    #[should_panic(expected = "already mapped")]
    fn double_map_panics() {
        let mut pd = PageManager::default();
        pd.map(PAGE, 1, true);
        pd.map(PAGE, 2, true);
    }
}
