// https://wiki.osdev.org/Paging

// Avoids lots of warnings about casting usize to u32 which cannot result in
// truncation for frame numbers, which never exceed 20 bits.
#![allow(clippy::cast_possible_truncation)]

use arbitrary_int::u20;
use bitbybit::bitfield;

/// One entry of a page table, in the x86 hardware layout. The memory manager
/// only walks these in software, but keeping the hardware bit positions means
/// an entry can be handed to the MMU unchanged.
#[bitfield(u32, default = 0)]
pub struct PageTableEntry {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    read_write: bool,
    #[bit(2, rw)]
    user_supervisor: bool,
    #[bit(3, rw)]
    write_through: bool,
    #[bit(4, rw)]
    cache_disable: bool,
    #[bit(5, rw)]
    accessed: bool,
    #[bit(6, rw)]
    dirty: bool,
    #[bit(7, rw)]
    page_attribute_table: bool,
    #[bit(8, rw)]
    global: bool,
    #[bits(12..=31, rw)]
    page_frame_address: u20,
}

impl PageTableEntry {
    /// Builds a present user entry mapping to physical frame `frame_number`.
    pub fn user_mapping(frame_number: usize, writable: bool) -> Self {
        Self::DEFAULT
            .with_present(true)
            .with_read_write(writable)
            .with_user_supervisor(true)
            .with_page_frame_address(u20::new(frame_number as u32))
    }

    /// The physical frame number this entry maps to.
    pub fn frame_number(&self) -> usize {
        self.page_frame_address().value() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_mapping_bits() {
        let pte = PageTableEntry::user_mapping(42, true);
        assert!(pte.present());
        assert!(pte.read_write());
        assert!(pte.user_supervisor());
        assert!(!pte.dirty());
        assert!(!pte.accessed());
        assert_eq!(pte.frame_number(), 42);

        let ro = PageTableEntry::user_mapping(7, false);
        assert!(!ro.read_write());
    }

    #[test]
    fn dirty_and_accessed_round_trip() {
        let pte = PageTableEntry::user_mapping(3, true)
            .with_dirty(true)
            .with_accessed(true);
        assert!(pte.dirty());
        assert!(pte.accessed());
        let cleared = pte.with_dirty(false).with_accessed(false);
        assert!(!cleared.dirty());
        assert!(!cleared.accessed());
        assert_eq!(cleared.frame_number(), 3);
    }
}
