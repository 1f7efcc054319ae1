//! Hardware page table access.
//!
//! The memory manager only ever asks the MMU to map, unmap and inspect the
//! accessed and dirty bits of single user pages. [`SoftMmu`] keeps i386-style
//! two-level page tables in ordinary memory so the rest of the crate can run
//! hosted.
//!
//! <https://wiki.osdev.org/Paging>

// Addresses handed to the MMU are user addresses, which are below `OFFSET` and
// always fit in 32 bits.
#![allow(clippy::cast_possible_truncation)]

use crate::addr::{PhysFrame, VirtAddr};
use crate::space::SpaceId;
use crate::sync::Mutex;
use alloc::{boxed::Box, collections::BTreeMap};
use arbitrary_int::{u10, u12, u20};
use bitbybit::bitfield;
use core::error::Error;
use core::fmt::{self, Display, Formatter};
use core::mem::size_of;
use core::ops::{Deref, DerefMut};
use kidneyos_shared::mem::PAGE_FRAME_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// The page already has a present mapping.
    AlreadyMapped,
    /// The page has no present mapping.
    NotMapped,
    /// The page or frame can't be expressed in a page table entry.
    OutOfRange,
}

impl Display for MapError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MapError::AlreadyMapped => write!(f, "page is already mapped"),
            MapError::NotMapped => write!(f, "page is not mapped"),
            MapError::OutOfRange => write!(f, "address does not fit in a page table entry"),
        }
    }
}

impl Error for MapError {}

/// Per-address-space page mappings.
///
/// Every method takes the owning space explicitly so that one MMU can serve
/// all processes. Unmapped pages report `false` for both status bits.
pub trait Mmu: Send + Sync {
    fn get_mapping(&self, space: SpaceId, upage: VirtAddr) -> Option<PhysFrame>;

    /// Maps `upage` to `frame`. Fails if `upage` is already mapped.
    fn set_mapping(
        &self,
        space: SpaceId,
        upage: VirtAddr,
        frame: PhysFrame,
        writable: bool,
    ) -> Result<(), MapError>;

    /// Removes the mapping for `upage`, if any.
    fn clear_mapping(&self, space: SpaceId, upage: VirtAddr);

    fn is_accessed(&self, space: SpaceId, upage: VirtAddr) -> bool;
    fn set_accessed(&self, space: SpaceId, upage: VirtAddr, accessed: bool);
    fn is_dirty(&self, space: SpaceId, upage: VirtAddr) -> bool;
    fn set_dirty(&self, space: SpaceId, upage: VirtAddr, dirty: bool);

    /// Drops every mapping of `space`.
    fn destroy(&self, space: SpaceId);
}

const PAGE_TABLE_LEN: usize = PAGE_FRAME_SIZE / size_of::<PageTableEntry>();

#[repr(align(4096))]
pub struct PageTable(pub [PageTableEntry; PAGE_TABLE_LEN]);

impl Default for PageTable {
    fn default() -> Self {
        Self([PageTableEntry::default(); PAGE_TABLE_LEN])
    }
}

impl Deref for PageTable {
    type Target = [PageTableEntry; PAGE_TABLE_LEN];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for PageTable {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[bitfield(u32, default = 0)]
pub struct PageTableEntry {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    read_write: bool,
    #[bit(2, rw)]
    user_supervisor: bool,
    #[bit(5, rw)]
    accessed: bool,
    #[bit(6, rw)]
    dirty: bool,
    #[bits(12..=31, rw)]
    page_frame_address: u20,
}

#[bitfield(u32)]
pub struct VirtualAddress {
    #[bits(22..=31, r)]
    page_directory_index: u10,
    #[bits(12..=21, r)]
    page_table_index: u10,
    #[bits(0..=11, r)]
    offset: u12,
}

impl VirtualAddress {
    fn from_user(upage: VirtAddr) -> Result<Self, MapError> {
        let raw = u32::try_from(upage.as_usize()).map_err(|_| MapError::OutOfRange)?;
        Ok(Self::new_with_raw_value(raw))
    }
}

type PageDirectory = BTreeMap<u16, Box<PageTable>>;

/// Page tables kept in memory, one directory per address space.
#[derive(Default)]
pub struct SoftMmu {
    spaces: Mutex<BTreeMap<SpaceId, PageDirectory>>,
}

impl SoftMmu {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entry<R>(
        &self,
        space: SpaceId,
        upage: VirtAddr,
        f: impl FnOnce(&mut PageTableEntry) -> R,
    ) -> Option<R> {
        let addr = VirtualAddress::from_user(upage).ok()?;
        let mut spaces = self.spaces.lock();
        let table = spaces
            .get_mut(&space)?
            .get_mut(&addr.page_directory_index().value())?;
        let entry = &mut table[usize::from(addr.page_table_index().value())];
        entry.present().then(|| f(entry))
    }

    /// Simulates a user access to `upage`, setting the accessed bit and, for
    /// writes, the dirty bit. Returns `false` where the hardware would fault.
    pub fn touch(&self, space: SpaceId, upage: VirtAddr, write: bool) -> bool {
        self.with_entry(space, upage.page_base(), |entry| {
            if write && !entry.read_write() {
                return false;
            }
            *entry = entry.with_accessed(true).with_dirty(entry.dirty() || write);
            true
        })
        .unwrap_or(false)
    }

    /// Number of present mappings in `space`.
    pub fn mapped_count(&self, space: SpaceId) -> usize {
        self.spaces.lock().get(&space).map_or(0, |dir| {
            dir.values()
                .map(|table| table.iter().filter(|e| e.present()).count())
                .sum()
        })
    }
}

impl Mmu for SoftMmu {
    fn get_mapping(&self, space: SpaceId, upage: VirtAddr) -> Option<PhysFrame> {
        self.with_entry(space, upage, |entry| {
            PhysFrame::from_number(entry.page_frame_address().value() as usize)
        })
    }

    fn set_mapping(
        &self,
        space: SpaceId,
        upage: VirtAddr,
        frame: PhysFrame,
        writable: bool,
    ) -> Result<(), MapError> {
        let addr = VirtualAddress::from_user(upage)?;
        let number = u32::try_from(frame.number()).map_err(|_| MapError::OutOfRange)?;
        // Frame numbers are 20 bits wide in an entry.
        if number >= 1 << 20 {
            return Err(MapError::OutOfRange);
        }

        let mut spaces = self.spaces.lock();
        let table = spaces
            .entry(space)
            .or_default()
            .entry(addr.page_directory_index().value())
            .or_default();
        let entry = &mut table[usize::from(addr.page_table_index().value())];
        if entry.present() {
            return Err(MapError::AlreadyMapped);
        }
        *entry = PageTableEntry::default()
            .with_present(true)
            .with_read_write(writable)
            .with_user_supervisor(true)
            .with_page_frame_address(u20::new(number));
        Ok(())
    }

    fn clear_mapping(&self, space: SpaceId, upage: VirtAddr) {
        self.with_entry(space, upage, |entry| *entry = PageTableEntry::default());
    }

    fn is_accessed(&self, space: SpaceId, upage: VirtAddr) -> bool {
        self.with_entry(space, upage, |entry| entry.accessed())
            .unwrap_or(false)
    }

    fn set_accessed(&self, space: SpaceId, upage: VirtAddr, accessed: bool) {
        self.with_entry(space, upage, |entry| {
            *entry = entry.with_accessed(accessed);
        });
    }

    fn is_dirty(&self, space: SpaceId, upage: VirtAddr) -> bool {
        self.with_entry(space, upage, |entry| entry.dirty())
            .unwrap_or(false)
    }

    fn set_dirty(&self, space: SpaceId, upage: VirtAddr, dirty: bool) {
        self.with_entry(space, upage, |entry| *entry = entry.with_dirty(dirty));
    }

    fn destroy(&self, space: SpaceId) {
        self.spaces.lock().remove(&space);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: VirtAddr = VirtAddr::new(0x0804_8000);

    #[test]
    fn map_and_unmap() {
        let mmu = SoftMmu::new();
        let frame = PhysFrame::from_number(7);
        mmu.set_mapping(1, PAGE, frame, true).unwrap();
        assert_eq!(mmu.get_mapping(1, PAGE), Some(frame));
        assert_eq!(mmu.get_mapping(2, PAGE), None);
        assert_eq!(
            mmu.set_mapping(1, PAGE, frame, true),
            Err(MapError::AlreadyMapped)
        );

        mmu.clear_mapping(1, PAGE);
        assert_eq!(mmu.get_mapping(1, PAGE), None);
        assert_eq!(mmu.mapped_count(1), 0);
    }

    #[test]
    fn touch_sets_status_bits() {
        let mmu = SoftMmu::new();
        mmu.set_mapping(1, PAGE, PhysFrame::from_number(3), true)
            .unwrap();
        assert!(!mmu.is_accessed(1, PAGE));

        assert!(mmu.touch(1, PAGE.checked_add(12).unwrap(), false));
        assert!(mmu.is_accessed(1, PAGE));
        assert!(!mmu.is_dirty(1, PAGE));

        assert!(mmu.touch(1, PAGE, true));
        assert!(mmu.is_dirty(1, PAGE));

        mmu.set_accessed(1, PAGE, false);
        mmu.set_dirty(1, PAGE, false);
        assert!(!mmu.is_accessed(1, PAGE));
        assert!(!mmu.is_dirty(1, PAGE));
    }

    #[test]
    fn write_to_read_only_page_faults() {
        let mmu = SoftMmu::new();
        mmu.set_mapping(1, PAGE, PhysFrame::from_number(3), false)
            .unwrap();
        assert!(!mmu.touch(1, PAGE, true));
        assert!(!mmu.is_dirty(1, PAGE));
        assert!(!mmu.touch(1, VirtAddr::new(0x1000), false));
    }

    #[test]
    fn frame_number_must_fit_entry() {
        let mmu = SoftMmu::new();
        let frame = PhysFrame::from_number(1 << 20);
        assert_eq!(
            mmu.set_mapping(1, PAGE, frame, true),
            Err(MapError::OutOfRange)
        );

        let last = PhysFrame::from_number((1 << 20) - 1);
        mmu.set_mapping(1, PAGE, last, true).unwrap();
        assert_eq!(mmu.get_mapping(1, PAGE), Some(last));
    }

    #[test]
    fn destroy_drops_all_mappings() {
        let mmu = SoftMmu::new();
        mmu.set_mapping(1, PAGE, PhysFrame::from_number(1), true)
            .unwrap();
        mmu.set_mapping(1, VirtAddr::new(0x4000_0000), PhysFrame::from_number(2), true)
            .unwrap();
        assert_eq!(mmu.mapped_count(1), 2);
        mmu.destroy(1);
        assert_eq!(mmu.mapped_count(1), 0);
    }
}
