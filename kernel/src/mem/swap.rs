#![allow(clippy::cast_possible_truncation)]

use crate::block::block_core::{Block, BlockSector, BlockType, BLOCK_SECTOR_SIZE};
use crate::block::block_error::BlockError;
use alloc::{boxed::Box, vec};
use log::debug;
use marrowos_shared::mem::PAGE_FRAME_SIZE;

/// Sectors holding one page's worth of content. 4096 / 512 = 8.
pub const SECTORS_PER_PAGE: usize = PAGE_FRAME_SIZE / BLOCK_SECTOR_SIZE;

/// Index of a page-sized slot on the swap device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapSlot(pub(crate) usize);

impl SwapSlot {
    pub fn index(self) -> usize {
        self.0
    }

    fn first_sector(self) -> BlockSector {
        (self.0 * SECTORS_PER_PAGE) as BlockSector
    }
}

/// The swap device and its slot-occupancy map. Slot `i` covers the
/// `SECTORS_PER_PAGE` consecutive sectors starting at `i * SECTORS_PER_PAGE`;
/// slot 0 begins at sector 0. The device carries no header: occupancy lives
/// only in memory and starts out empty on every boot.
pub struct SwapTable {
    device: Block,
    slots: Box<[bool]>,
}

impl SwapTable {
    pub fn new(device: Block) -> Self {
        debug_assert_eq!(device.get_type(), BlockType::Swap);
        let slot_count = device.get_size() as usize / SECTORS_PER_PAGE;
        Self {
            device,
            slots: vec![false; slot_count].into_boxed_slice(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn free_slots(&self) -> usize {
        self.slots.iter().filter(|&&used| !used).count()
    }

    pub fn is_occupied(&self, slot: SwapSlot) -> bool {
        self.slots[slot.0]
    }

    /// Claim a free slot, or `None` when swap is exhausted.
    pub fn alloc_slot(&mut self) -> Option<SwapSlot> {
        let i = self.slots.iter().position(|&used| !used)?;
        self.slots[i] = true;
        Some(SwapSlot(i))
    }

    /// Mark `slot` free again.
    pub fn release(&mut self, slot: SwapSlot) {
        assert!(self.slots[slot.0], "release of a free swap slot {}", slot.0);
        self.slots[slot.0] = false;
    }

    /// Write one page of content into `slot`.
    pub fn write_page(&mut self, slot: SwapSlot, page: &[u8]) -> Result<(), BlockError> {
        debug_assert_eq!(page.len(), PAGE_FRAME_SIZE);
        debug_assert!(self.slots[slot.0]);
        debug!("swap: writing page to slot {}", slot.0);
        for i in 0..SECTORS_PER_PAGE {
            self.device.write(
                slot.first_sector() + i as BlockSector,
                &page[i * BLOCK_SECTOR_SIZE..(i + 1) * BLOCK_SECTOR_SIZE],
            )?;
        }
        Ok(())
    }

    /// Read one page of content out of `slot`.
    pub fn read_page(&mut self, slot: SwapSlot, page: &mut [u8]) -> Result<(), BlockError> {
        debug_assert_eq!(page.len(), PAGE_FRAME_SIZE);
        debug_assert!(self.slots[slot.0]);
        debug!("swap: reading page from slot {}", slot.0);
        for i in 0..SECTORS_PER_PAGE {
            self.device.read(
                slot.first_sector() + i as BlockSector,
                &mut page[i * BLOCK_SECTOR_SIZE..(i + 1) * BLOCK_SECTOR_SIZE],
            )?;
        }
        Ok(())
    }
}
