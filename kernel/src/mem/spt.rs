use super::page::VirtualPageEntry;
use hashbrown::{hash_map::Entry, HashMap};
use kidneyos_shared::mem::page_round_down;

/// Per-address-space map from page address to [`VirtualPageEntry`].
///
/// Lookups accept any address inside a page.
#[derive(Debug, Default)]
pub struct SupplementalPageTable(HashMap<usize, VirtualPageEntry>);

impl SupplementalPageTable {
    pub fn lookup(&self, vaddr: usize) -> Option<&VirtualPageEntry> {
        self.0.get(&page_round_down(vaddr))
    }

    pub fn lookup_mut(&mut self, vaddr: usize) -> Option<&mut VirtualPageEntry> {
        self.0.get_mut(&page_round_down(vaddr))
    }

    pub fn contains(&self, vaddr: usize) -> bool {
        self.0.contains_key(&page_round_down(vaddr))
    }

    /// Returns false, leaving the table untouched, if the page already has an
    /// entry.
    #[must_use]
    pub fn insert(&mut self, entry: VirtualPageEntry) -> bool {
        match self.0.entry(entry.vaddr()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(entry);
                true
            }
        }
    }

    pub fn remove(&mut self, vaddr: usize) -> Option<VirtualPageEntry> {
        self.0.remove(&page_round_down(vaddr))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VirtualPageEntry> {
        self.0.values()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = VirtualPageEntry> + '_ {
        self.0.drain().map(|(_, entry)| entry)
    }
}
