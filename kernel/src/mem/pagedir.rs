use crate::mem::palloc::PhysFrame;
use alloc::collections::BTreeMap;
use marrowos_shared::mem::is_page_aligned;
use marrowos_shared::paging::PageTableEntry;

/// The hardware page table of one address space, walked in software. Entries
/// use the real x86 PTE layout; the accessed and dirty bits are maintained by
/// the user-memory access path in `mem`, standing in for the MMU.
pub struct PageDirectory {
    entries: BTreeMap<usize, PageTableEntry>,
}

impl Default for PageDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl PageDirectory {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Install a mapping from `vpn` to `frame`. Returns false if `vpn` is
    /// already mapped.
    #[must_use]
    pub fn map(&mut self, vpn: usize, frame: PhysFrame, writable: bool) -> bool {
        debug_assert!(is_page_aligned(vpn));
        if self.entries.contains_key(&vpn) {
            return false;
        }
        self.entries
            .insert(vpn, PageTableEntry::user_mapping(frame.number(), writable));
        true
    }

    /// Remove the mapping for `vpn`, if any.
    pub fn unmap(&mut self, vpn: usize) {
        self.entries.remove(&vpn);
    }

    /// The frame `vpn` maps to and whether the mapping is writable.
    pub fn translate(&self, vpn: usize) -> Option<(PhysFrame, bool)> {
        self.entries
            .get(&vpn)
            .map(|pte| (PhysFrame(pte.frame_number()), pte.read_write()))
    }

    pub fn is_mapped(&self, vpn: usize) -> bool {
        self.entries.contains_key(&vpn)
    }

    pub fn is_dirty(&self, vpn: usize) -> bool {
        self.entries.get(&vpn).is_some_and(|pte| pte.dirty())
    }

    pub fn clear_dirty(&mut self, vpn: usize) {
        if let Some(pte) = self.entries.get_mut(&vpn) {
            *pte = pte.with_dirty(false);
        }
    }

    pub fn is_accessed(&self, vpn: usize) -> bool {
        self.entries.get(&vpn).is_some_and(|pte| pte.accessed())
    }

    pub fn clear_accessed(&mut self, vpn: usize) {
        if let Some(pte) = self.entries.get_mut(&vpn) {
            *pte = pte.with_accessed(false);
        }
    }

    // The MMU sets these on real hardware; the user-access path calls them
    // on every emulated access.

    pub fn set_accessed(&mut self, vpn: usize) {
        if let Some(pte) = self.entries.get_mut(&vpn) {
            *pte = pte.with_accessed(true);
        }
    }

    pub fn set_dirty(&mut self, vpn: usize) {
        if let Some(pte) = self.entries.get_mut(&vpn) {
            *pte = pte.with_dirty(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_translate_unmap() {
        let mut pd = PageDirectory::new();
        assert!(pd.map(0x4000, PhysFrame(7), true));
        assert_eq!(pd.translate(0x4000), Some((PhysFrame(7), true)));
        assert!(pd.is_mapped(0x4000));
        // Double-mapping is refused.
        assert!(!pd.map(0x4000, PhysFrame(8), false));
        pd.unmap(0x4000);
        assert_eq!(pd.translate(0x4000), None);
    }

    #[test]
    fn dirty_and_accessed_bits() {
        let mut pd = PageDirectory::new();
        assert!(pd.map(0x1000, PhysFrame(0), true));
        assert!(!pd.is_dirty(0x1000));
        assert!(!pd.is_accessed(0x1000));

        pd.set_dirty(0x1000);
        pd.set_accessed(0x1000);
        assert!(pd.is_dirty(0x1000));
        assert!(pd.is_accessed(0x1000));

        pd.clear_dirty(0x1000);
        pd.clear_accessed(0x1000);
        assert!(!pd.is_dirty(0x1000));
        assert!(!pd.is_accessed(0x1000));
    }

    #[test]
    fn bits_on_unmapped_pages_read_false() {
        let mut pd = PageDirectory::new();
        assert!(!pd.is_dirty(0x1000));
        assert!(!pd.is_accessed(0x1000));
        // And setting them is a no-op rather than a panic.
        pd.set_dirty(0x1000);
        assert!(!pd.is_dirty(0x1000));
    }
}
