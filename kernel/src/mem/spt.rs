use crate::mem::page::Page;
use crate::mem::{Result, VmError};
use alloc::collections::BTreeMap;
use marrowos_shared::mem::page_round_down;

/// Supplemental page table: everything an address space knows about its
/// virtual pages that the hardware page table cannot hold. One entry per
/// registered virtual page, keyed by page-aligned address.
pub struct SupplementalPageTable {
    pages: BTreeMap<usize, Page>,
}

impl Default for SupplementalPageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self {
            pages: BTreeMap::new(),
        }
    }

    /// Add `page` to the table. Fails without side effects if the page's
    /// address is already registered. Performs no I/O.
    pub fn register(&mut self, page: Page) -> Result<()> {
        let vpn = page.vpn();
        if self.pages.contains_key(&vpn) {
            return Err(VmError::AlreadyMapped(vpn));
        }
        self.pages.insert(vpn, page);
        Ok(())
    }

    /// The page covering `addr`, which need not be aligned. Pure lookup.
    pub fn lookup(&self, addr: usize) -> Option<&Page> {
        self.pages.get(&page_round_down(addr))
    }

    pub fn lookup_mut(&mut self, addr: usize) -> Option<&mut Page> {
        self.pages.get_mut(&page_round_down(addr))
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.pages.contains_key(&page_round_down(addr))
    }

    /// Drop the entry for `vpn`, returning the page. The caller must already
    /// have released the page's frame and written back dirty content.
    pub fn remove(&mut self, vpn: usize) -> Option<Page> {
        self.pages.remove(&page_round_down(vpn))
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Page)> {
        self.pages.iter().map(|(&vpn, page)| (vpn, page))
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub(crate) fn take_pages(&mut self) -> BTreeMap<usize, Page> {
        core::mem::take(&mut self.pages)
    }
}
