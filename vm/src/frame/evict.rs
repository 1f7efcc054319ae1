//! Second-chance (clock) eviction.

use super::{FrameAllocator, FrameEntry, FrameTable, Reclaim};
use crate::addr::{PhysFrame, VirtAddr};
use crate::block::BlockOp;
use crate::error::{Result, VmError};
use crate::mmu::Mmu;
use crate::space::AddressSpace;
use alloc::sync::Arc;
use log::{debug, trace, warn};

struct Victim {
    frame: PhysFrame,
    owner: Arc<AddressSpace>,
    upage: VirtAddr,
}

impl Victim {
    fn is(&self, entry: &FrameEntry) -> bool {
        Arc::ptr_eq(&self.owner, &entry.owner) && self.upage == entry.upage
    }
}

impl<A: FrameAllocator> FrameTable<A> {
    /// Evicts one page and hands its frame, pinned, to `upage` of `owner`.
    ///
    /// Returns `Ok(None)` if the chosen victim was unmapped or torn down
    /// before it could be written out; nothing was evicted and the caller
    /// may try again.
    pub(super) fn evict<M, D>(
        &self,
        owner: &Arc<AddressSpace>,
        upage: VirtAddr,
        zeroed: bool,
        reclaim: &Reclaim<'_, M, D>,
    ) -> Result<Option<PhysFrame>>
    where
        M: Mmu + ?Sized,
        D: BlockOp,
    {
        let victim = self.select_victim(reclaim.mmu)?;
        if !self.write_out(&victim, reclaim)? {
            self.cancel_eviction(&victim);
            return Ok(None);
        }

        let mut inner = self.inner.lock();
        if inner.remove(victim.frame).is_some() {
            inner.allocator.dealloc(victim.frame);
        }
        let frame = inner.allocator.alloc(zeroed).ok_or(VmError::OutOfFrames)?;
        inner.insert(frame, owner, upage);
        drop(inner);

        reclaim.stats.eviction();
        debug!(
            target: "vm::frame",
            "evicted {} of space {} for {upage} of space {}",
            victim.upage,
            victim.owner.id(),
            owner.id()
        );
        Ok(Some(frame))
    }

    /// Sweeps the clock hand until it finds an unpinned frame whose accessed
    /// bit is clear, clearing set bits on the way.
    fn select_victim<M: Mmu + ?Sized>(&self, mmu: &M) -> Result<Victim> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let steps = self.passes.saturating_mul(inner.clock.len());

        for _ in 0..steps {
            let frame = inner.clock[inner.hand];
            inner.hand = (inner.hand + 1) % inner.clock.len();

            let Some(entry) = inner.entries.get_mut(&frame) else {
                continue;
            };
            if entry.pins > 0 || entry.evicting {
                continue;
            }
            let (space, upage) = (entry.owner.id(), entry.upage);
            if mmu.is_accessed(space, upage) {
                trace!(target: "vm::frame", "second chance for {upage} of space {space}");
                mmu.set_accessed(space, upage, false);
                continue;
            }

            entry.evicting = true;
            return Ok(Victim {
                frame,
                owner: entry.owner.clone(),
                upage,
            });
        }
        Err(VmError::NoVictim)
    }

    /// Unmaps the victim and moves its contents to swap, writing dirty file
    /// pages back first. Returns `Ok(false)` if the victim no longer belongs
    /// to the page it was chosen for.
    fn write_out<M, D>(&self, victim: &Victim, reclaim: &Reclaim<'_, M, D>) -> Result<bool>
    where
        M: Mmu + ?Sized,
        D: BlockOp,
    {
        let space = &victim.owner;
        let mut pages = space.pages();
        if !self.is_evicting(victim) {
            return Ok(false);
        }
        let Some(entry) = pages
            .get_mut(victim.upage)
            .filter(|e| e.frame == Some(victim.frame))
        else {
            return Ok(false);
        };

        let (id, upage) = (space.id(), victim.upage);
        let dirty = reclaim.mmu.is_dirty(id, upage);
        reclaim.mmu.clear_mapping(id, upage);

        // SAFETY: The frame is marked as evicting, so it can't be pinned, and
        // its page table entry is locked, so it can't be released.
        let page = unsafe { self.frame_mut(victim.frame) };

        if dirty {
            if let Some(slice) = entry.kind.file_slice() {
                match slice.write_back(page) {
                    Ok(()) => reclaim.stats.write_back(),
                    Err(e) => {
                        warn!(target: "vm::frame", "write-back of {upage} failed: {e}");
                        space.kill();
                    }
                }
            }
        }

        match reclaim.swap.swap_out(page) {
            Ok(slot) => {
                entry.kind.swap_out(slot);
                entry.frame = None;
                reclaim.stats.swap_out();
                Ok(true)
            }
            Err(e) => {
                if let Err(map) = reclaim
                    .mmu
                    .set_mapping(id, upage, victim.frame, entry.writable)
                {
                    warn!(target: "vm::frame", "could not restore mapping of {upage}: {map}");
                }
                reclaim.mmu.set_dirty(id, upage, dirty);
                self.cancel_eviction(victim);
                Err(e)
            }
        }
    }

    /// Whether `victim`'s frame still holds its page and is marked for eviction.
    fn is_evicting(&self, victim: &Victim) -> bool {
        self.inner
            .lock()
            .entries
            .get(&victim.frame)
            .is_some_and(|e| e.evicting && victim.is(e))
    }

    fn cancel_eviction(&self, victim: &Victim) {
        if let Some(entry) = self.inner.lock().entries.get_mut(&victim.frame) {
            if victim.is(entry) {
                entry.evicting = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Block, MemDisk};
    use crate::frame::FramePool;
    use crate::mmu::SoftMmu;
    use crate::page::PageKind;
    use crate::stats::VmStats;
    use crate::swap::SwapTable;
    use alloc::vec::Vec;
    use kidneyos_shared::mem::PAGE_FRAME_SIZE;

    struct Fixture {
        mmu: SoftMmu,
        swap: SwapTable<MemDisk>,
        stats: VmStats,
        frames: FrameTable<FramePool>,
        space: Arc<AddressSpace>,
    }

    impl Fixture {
        fn new(frames: usize, swap_sectors: u32) -> Self {
            Self {
                mmu: SoftMmu::new(),
                swap: SwapTable::new(Block::new("swap", MemDisk::new(swap_sectors))),
                stats: VmStats::default(),
                frames: FrameTable::new(FramePool::new(frames), 2),
                space: AddressSpace::new(1),
            }
        }

        fn reclaim(&self) -> Reclaim<'_, SoftMmu, MemDisk> {
            Reclaim {
                mmu: &self.mmu,
                swap: &self.swap,
                stats: &self.stats,
            }
        }

        /// Registers a stack page at `upage` and makes it resident, filled with `fill`.
        fn resident(&self, upage: VirtAddr, fill: u8) -> PhysFrame {
            self.space.pages().insert_stack(upage).unwrap();
            let frame = self
                .frames
                .allocate(&self.space, upage, true, &self.reclaim())
                .unwrap();
            unsafe { self.frames.frame_mut(frame) }.fill(fill);
            self.mmu.set_mapping(1, upage, frame, true).unwrap();
            self.space.pages().get_mut(upage).unwrap().frame = Some(frame);
            self.frames.unpin(frame);
            frame
        }
    }

    fn page(n: usize) -> VirtAddr {
        VirtAddr::new(0x1000_0000 + n * PAGE_FRAME_SIZE)
    }

    #[test]
    fn unreferenced_page_is_swapped_out() {
        let fixture = Fixture::new(2, 64);
        let first = fixture.resident(page(0), 0x11);
        fixture.resident(page(1), 0x22);
        fixture.mmu.touch(1, page(1), false);

        let frame = fixture
            .frames
            .allocate(&fixture.space, page(2), false, &fixture.reclaim())
            .unwrap();
        assert_eq!(frame, first);
        assert_eq!(fixture.frames.owner(frame), Some((1, page(2))));

        let victim = fixture.space.lookup(page(0)).unwrap();
        assert!(victim.frame.is_none());
        assert_eq!(fixture.mmu.get_mapping(1, page(0)), None);
        let slot = victim.kind.swap_slot().unwrap();

        let mut buf = [0; PAGE_FRAME_SIZE];
        fixture.swap.swap_in(slot, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0x11));
        assert_eq!(fixture.stats.snapshot().evictions, 1);
    }

    #[test]
    fn referenced_pages_get_second_chance() {
        let fixture = Fixture::new(3, 64);
        for n in 0..3 {
            fixture.resident(page(n), 0);
            fixture.mmu.touch(1, page(n), false);
        }
        fixture
            .frames
            .allocate(&fixture.space, page(3), false, &fixture.reclaim())
            .unwrap();

        // The first sweep clears every bit, the second takes the oldest page.
        assert!(fixture.space.lookup(page(0)).unwrap().frame.is_none());
        assert!(!fixture.mmu.is_accessed(1, page(1)));
        assert!(!fixture.mmu.is_accessed(1, page(2)));
        let resident: Vec<_> = (1..3)
            .map(|n| fixture.space.lookup(page(n)).unwrap().frame.is_some())
            .collect();
        assert_eq!(resident, [true, true]);
    }

    #[test]
    fn pinned_frames_are_skipped() {
        let fixture = Fixture::new(2, 64);
        let pinned = fixture.resident(page(0), 0);
        fixture.resident(page(1), 0);
        assert!(fixture.frames.pin(pinned));

        fixture
            .frames
            .allocate(&fixture.space, page(2), false, &fixture.reclaim())
            .unwrap();
        assert_eq!(fixture.space.lookup(page(0)).unwrap().frame, Some(pinned));
        assert!(fixture.space.lookup(page(1)).unwrap().frame.is_none());
    }

    #[test]
    fn full_swap_leaves_victim_resident() {
        let fixture = Fixture::new(1, 0);
        let frame = fixture.resident(page(0), 0x33);
        fixture.mmu.touch(1, page(0), true);
        fixture.mmu.set_accessed(1, page(0), false);

        assert_eq!(
            fixture
                .frames
                .allocate(&fixture.space, page(1), false, &fixture.reclaim()),
            Err(VmError::SwapFull)
        );
        let entry = fixture.space.lookup(page(0)).unwrap();
        assert_eq!(entry.frame, Some(frame));
        assert!(matches!(entry.kind, PageKind::Stack));
        assert_eq!(fixture.mmu.get_mapping(1, page(0)), Some(frame));
        assert!(fixture.mmu.is_dirty(1, page(0)));
        assert!(fixture.frames.pin(frame));
    }

    #[test]
    fn vanished_victim_is_abandoned() {
        let fixture = Fixture::new(1, 64);
        let frame = fixture.resident(page(0), 0);
        let victim = fixture.frames.select_victim(&fixture.mmu).unwrap();
        assert_eq!(victim.frame, frame);
        assert!(!fixture.frames.pin(frame));

        fixture.space.pages().drain();
        assert_eq!(fixture.frames.write_out(&victim, &fixture.reclaim()), Ok(false));
        fixture.frames.cancel_eviction(&victim);
        assert!(fixture.frames.pin(frame));
        assert_eq!(fixture.swap.used_slots(), 0);
    }
}
