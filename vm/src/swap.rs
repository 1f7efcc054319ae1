//! The swap slot manager.
//!
//! The swap device is carved into page-sized slots of [`SECTORS_PER_PAGE`]
//! consecutive sectors. One lock covers both the occupancy bitmap and the
//! sector transfers, so at most one page moves to or from swap at a time.

// Slot and sector numbers are bounded by the device's `u32` sector count.
#![allow(clippy::cast_possible_truncation)]

use crate::block::{Block, BlockOp, BlockSector, BLOCK_SECTOR_SIZE};
use crate::error::{Result, VmError};
use crate::sync::Mutex;
use alloc::{boxed::Box, vec};
use core::fmt::{self, Display, Formatter};
use kidneyos_shared::mem::{PAGE_FRAME_SIZE, SECTORS_PER_PAGE};
use log::{debug, info};

/// Index of a page-sized slot on the swap device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(u32);

impl SwapSlot {
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    pub const fn index(self) -> u32 {
        self.0
    }

    fn first_sector(self) -> BlockSector {
        self.0 * SECTORS_PER_PAGE as BlockSector
    }
}

impl Display for SwapSlot {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "swap slot {}", self.0)
    }
}

struct SwapInner<D> {
    block: Block<D>,
    bitmap: Box<[u64]>,
    used: usize,
}

impl<D> SwapInner<D> {
    fn is_occupied(&self, index: usize) -> bool {
        self.bitmap[index / 64] & (1 << (index % 64)) != 0
    }

    fn set_occupied(&mut self, index: usize, occupied: bool) {
        let word = &mut self.bitmap[index / 64];
        if occupied {
            *word |= 1 << (index % 64);
            self.used += 1;
        } else {
            *word &= !(1 << (index % 64));
            self.used -= 1;
        }
    }
}

pub struct SwapTable<D> {
    inner: Mutex<SwapInner<D>>,
    slot_count: usize,
}

impl<D: BlockOp> SwapTable<D> {
    /// Takes over `block`; every whole page of it becomes a free slot.
    pub fn new(block: Block<D>) -> Self {
        let slot_count = block.size() as usize / SECTORS_PER_PAGE;
        info!(
            target: "vm::swap",
            "swap device {}: {} slots of {} bytes", block.name(), slot_count, PAGE_FRAME_SIZE
        );
        Self {
            inner: Mutex::new(SwapInner {
                block,
                bitmap: vec![0; slot_count.div_ceil(64)].into_boxed_slice(),
                used: 0,
            }),
            slot_count,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn used_slots(&self) -> usize {
        self.inner.lock().used
    }

    pub fn is_occupied(&self, slot: SwapSlot) -> bool {
        let index = slot.index() as usize;
        index < self.slot_count && self.inner.lock().is_occupied(index)
    }

    /// Writes `page` to the first free slot and marks it occupied.
    pub fn swap_out(&self, page: &[u8; PAGE_FRAME_SIZE]) -> Result<SwapSlot> {
        let mut inner = self.inner.lock();
        let index = (0..self.slot_count)
            .find(|&i| !inner.is_occupied(i))
            .ok_or(VmError::SwapFull)?;
        let slot = SwapSlot::new(index as u32);

        let first = slot.first_sector();
        for (sector, chunk) in (first..).zip(page.chunks_exact(BLOCK_SECTOR_SIZE)) {
            inner.block.write(sector, chunk)?;
        }
        inner.set_occupied(index, true);

        debug!(target: "vm::swap", "swapped out to {slot}");
        Ok(slot)
    }

    /// Reads `slot` back into `page` and frees it.
    pub fn swap_in(&self, slot: SwapSlot, page: &mut [u8; PAGE_FRAME_SIZE]) -> Result<()> {
        self.swap_in_then(slot, page, || Ok(()))
    }

    /// Reads `slot` back into `page`, then runs `install`. The slot is freed
    /// only if `install` succeeds; otherwise it keeps the page.
    pub fn swap_in_then(
        &self,
        slot: SwapSlot,
        page: &mut [u8; PAGE_FRAME_SIZE],
        install: impl FnOnce() -> Result<()>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let index = self.check_in_use(&inner, slot)?;

        let first = slot.first_sector();
        for (sector, chunk) in (first..).zip(page.chunks_exact_mut(BLOCK_SECTOR_SIZE)) {
            inner.block.read(sector, chunk)?;
        }
        install()?;
        inner.set_occupied(index, false);

        debug!(target: "vm::swap", "swapped in from {slot}");
        Ok(())
    }

    /// Frees `slot` without reading it.
    pub fn free(&self, slot: SwapSlot) -> Result<()> {
        let mut inner = self.inner.lock();
        let index = self.check_in_use(&inner, slot)?;
        inner.set_occupied(index, false);
        Ok(())
    }

    fn check_in_use(&self, inner: &SwapInner<D>, slot: SwapSlot) -> Result<usize> {
        let index = slot.index() as usize;
        if index >= self.slot_count {
            return Err(VmError::SlotOutOfRange(slot));
        }
        if !inner.is_occupied(index) {
            return Err(VmError::SlotNotInUse(slot));
        }
        Ok(index)
    }

    /// Sector reads and writes issued to the swap device so far.
    pub fn io_counts(&self) -> (u32, u32) {
        let inner = self.inner.lock();
        (inner.block.read_count(), inner.block.write_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemDisk;
    use alloc::vec::Vec;
    use proptest::prelude::*;

    fn table(sectors: u32) -> SwapTable<MemDisk> {
        SwapTable::new(Block::new("swap", MemDisk::new(sectors)))
    }

    fn page(fill: u8) -> Box<[u8; PAGE_FRAME_SIZE]> {
        Box::new([fill; PAGE_FRAME_SIZE])
    }

    #[test]
    fn eighty_sectors_hold_ten_slots() {
        let swap = table(80);
        assert_eq!(swap.slot_count(), 10);

        let slots: Vec<_> = (0..10u8)
            .map(|i| swap.swap_out(&page(i)).unwrap())
            .collect();
        assert_eq!(swap.used_slots(), 10);
        assert_eq!(swap.swap_out(&page(0xff)), Err(VmError::SwapFull));

        let mut buf = page(0);
        swap.swap_in(slots[4], &mut buf).unwrap();
        assert_eq!(*buf, [4; PAGE_FRAME_SIZE]);

        assert_eq!(swap.swap_out(&page(0xee)).unwrap(), slots[4]);
    }

    #[test]
    fn slots_are_taken_first_free() {
        let swap = table(32);
        let a = swap.swap_out(&page(1)).unwrap();
        let b = swap.swap_out(&page(2)).unwrap();
        assert_eq!((a.index(), b.index()), (0, 1));

        swap.free(a).unwrap();
        assert!(!swap.is_occupied(a));
        assert_eq!(swap.swap_out(&page(3)).unwrap(), a);
    }

    #[test]
    fn transfers_are_sector_chunked() {
        let swap = table(16);
        let mut content = page(0);
        for (i, byte) in content.iter_mut().enumerate() {
            *byte = (i / BLOCK_SECTOR_SIZE) as u8;
        }
        let slot = swap.swap_out(&content).unwrap();
        assert_eq!(swap.io_counts(), (0, SECTORS_PER_PAGE as u32));

        let mut buf = page(0);
        swap.swap_in(slot, &mut buf).unwrap();
        assert_eq!(buf, content);
        assert_eq!(
            swap.io_counts(),
            (SECTORS_PER_PAGE as u32, SECTORS_PER_PAGE as u32)
        );
    }

    #[test]
    fn swap_in_of_free_slot_fails() {
        let swap = table(16);
        let mut buf = page(0);
        assert_eq!(
            swap.swap_in(SwapSlot::new(1), &mut buf),
            Err(VmError::SlotNotInUse(SwapSlot::new(1)))
        );
        assert_eq!(
            swap.swap_in(SwapSlot::new(2), &mut buf),
            Err(VmError::SlotOutOfRange(SwapSlot::new(2)))
        );
        assert_eq!(
            swap.free(SwapSlot::new(0)),
            Err(VmError::SlotNotInUse(SwapSlot::new(0)))
        );
    }

    #[test]
    fn failed_install_keeps_the_slot() {
        let swap = table(16);
        let slot = swap.swap_out(&page(0x5a)).unwrap();

        let mut buf = page(0);
        assert_eq!(
            swap.swap_in_then(slot, &mut buf, || Err(VmError::NoVictim)),
            Err(VmError::NoVictim)
        );
        assert!(swap.is_occupied(slot));

        swap.swap_in_then(slot, &mut buf, || Ok(())).unwrap();
        assert_eq!(buf, page(0x5a));
        assert!(!swap.is_occupied(slot));
    }

    #[test]
    fn partial_page_of_sectors_is_unused() {
        let swap = table(SECTORS_PER_PAGE as u32 * 3 + 5);
        assert_eq!(swap.slot_count(), 3);
    }

    proptest! {
        #[test]
        fn swap_round_trip(
            contents in prop::collection::vec(prop::collection::vec(any::<u8>(), PAGE_FRAME_SIZE), 1..6),
        ) {
            let swap = table(64);
            let mut slots = Vec::new();
            for content in &contents {
                let mut buf = page(0);
                buf.copy_from_slice(content);
                slots.push(swap.swap_out(&buf).unwrap());
            }

            let mut sorted = slots.clone();
            sorted.sort();
            sorted.dedup();
            prop_assert_eq!(sorted.len(), slots.len());

            for (slot, content) in slots.iter().zip(&contents) {
                let mut buf = page(0);
                swap.swap_in(*slot, &mut buf).unwrap();
                prop_assert_eq!(&buf[..], &content[..]);
                prop_assert!(!swap.is_occupied(*slot));
            }
            prop_assert_eq!(swap.used_slots(), 0);
        }
    }
}
