//! The frame table: which physical frames hold which user pages.
//!
//! Every frame handed to a process is recorded here together with its owning
//! address space and virtual page, and joins the ring that the clock hand in
//! [`evict`] sweeps. One lock guards the index, the ring and the underlying
//! physical allocator. It is never held across disk I/O.

mod evict;
pub mod pool;

pub use pool::FramePool;

use crate::addr::{PhysFrame, VirtAddr};
use crate::block::BlockOp;
use crate::config::MIN_EVICTION_PASSES;
use crate::error::{Result, VmError};
use crate::mmu::Mmu;
use crate::space::{AddressSpace, SpaceId};
use crate::stats::VmStats;
use crate::swap::SwapTable;
use crate::sync::Mutex;
use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use core::ptr::NonNull;
use kidneyos_shared::mem::PAGE_FRAME_SIZE;
use log::{debug, trace};

/// Source of physical frames.
pub trait FrameAllocator: Send {
    /// Takes a free frame, zero-filled if `zeroed`.
    fn alloc(&mut self, zeroed: bool) -> Option<PhysFrame>;

    /// Returns `frame` to the free pool.
    ///
    /// # Panics
    ///
    /// If `frame` is not allocated.
    fn dealloc(&mut self, frame: PhysFrame);

    /// Kernel address of the first byte of `frame`.
    fn frame_ptr(&self, frame: PhysFrame) -> NonNull<u8>;
}

/// Attempts at allocating a frame before giving up. Only a victim that
/// vanished mid-eviction costs an attempt.
const ALLOCATE_ATTEMPTS: usize = 4;

pub struct FrameEntry {
    pub owner: Arc<AddressSpace>,
    pub upage: VirtAddr,
    /// Frames with a nonzero pin count are never evicted.
    pub pins: u16,
    /// Set while an eviction is writing the frame out.
    pub evicting: bool,
}

struct FrameTableInner<A> {
    allocator: A,
    entries: BTreeMap<PhysFrame, FrameEntry>,
    /// Eviction candidates in insertion order.
    clock: Vec<PhysFrame>,
    hand: usize,
}

impl<A: FrameAllocator> FrameTableInner<A> {
    fn insert(&mut self, frame: PhysFrame, owner: &Arc<AddressSpace>, upage: VirtAddr) {
        let entry = FrameEntry {
            owner: owner.clone(),
            upage,
            pins: 1,
            evicting: false,
        };
        let prev = self.entries.insert(frame, entry);
        assert!(prev.is_none(), "{frame} is already in the frame table");
        self.clock.push(frame);
    }

    fn remove(&mut self, frame: PhysFrame) -> Option<FrameEntry> {
        let entry = self.entries.remove(&frame)?;
        if let Some(pos) = self.clock.iter().position(|&f| f == frame) {
            self.clock.remove(pos);
            if pos < self.hand {
                self.hand -= 1;
            }
        }
        if self.hand >= self.clock.len() {
            self.hand = 0;
        }
        Some(entry)
    }
}

/// What eviction needs besides the frame table itself.
pub(crate) struct Reclaim<'a, M: ?Sized, D> {
    pub mmu: &'a M,
    pub swap: &'a SwapTable<D>,
    pub stats: &'a VmStats,
}

pub struct FrameTable<A> {
    inner: Mutex<FrameTableInner<A>>,
    /// Full clock revolutions before eviction gives up.
    passes: usize,
}

impl<A: FrameAllocator> FrameTable<A> {
    pub fn new(allocator: A, passes: usize) -> Self {
        Self {
            inner: Mutex::new(FrameTableInner {
                allocator,
                entries: BTreeMap::new(),
                clock: Vec::new(),
                hand: 0,
            }),
            passes: passes.max(MIN_EVICTION_PASSES),
        }
    }

    /// Gets a frame for `upage` of `owner`, evicting another page if the
    /// allocator is exhausted.
    ///
    /// The frame comes back pinned; the caller unpins it once the page is
    /// filled and mapped.
    pub(crate) fn allocate<M, D>(
        &self,
        owner: &Arc<AddressSpace>,
        upage: VirtAddr,
        zeroed: bool,
        reclaim: &Reclaim<'_, M, D>,
    ) -> Result<PhysFrame>
    where
        M: Mmu + ?Sized,
        D: BlockOp,
    {
        for _ in 0..ALLOCATE_ATTEMPTS {
            {
                let mut inner = self.inner.lock();
                if let Some(frame) = inner.allocator.alloc(zeroed) {
                    inner.insert(frame, owner, upage);
                    debug!(target: "vm::frame", "{frame} -> {upage} of space {}", owner.id());
                    return Ok(frame);
                }
            }
            if let Some(frame) = self.evict(owner, upage, zeroed, reclaim)? {
                return Ok(frame);
            }
            trace!(target: "vm::frame", "eviction victim vanished, retrying");
        }
        Err(VmError::OutOfFrames)
    }

    /// Drops `frame` from the table, freeing it too if `dealloc`. Returns the
    /// removed entry, or `None` if the frame wasn't in the table.
    pub fn release(&self, frame: PhysFrame, dealloc: bool) -> Option<FrameEntry> {
        let mut inner = self.inner.lock();
        let entry = inner.remove(frame)?;
        if dealloc {
            inner.allocator.dealloc(frame);
        }
        Some(entry)
    }

    /// Pins `frame` against eviction. Fails if the frame is not in the table
    /// or is being evicted.
    pub fn pin(&self, frame: PhysFrame) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(&frame) {
            Some(entry) if !entry.evicting => {
                entry.pins += 1;
                true
            }
            _ => false,
        }
    }

    pub fn unpin(&self, frame: PhysFrame) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(&frame) {
            debug_assert!(entry.pins > 0, "{frame} is not pinned");
            entry.pins = entry.pins.saturating_sub(1);
        }
    }

    pub fn is_pinned(&self, frame: PhysFrame) -> bool {
        self.inner
            .lock()
            .entries
            .get(&frame)
            .is_some_and(|e| e.pins > 0)
    }

    /// Owning address space id and page of `frame`.
    pub fn owner(&self, frame: PhysFrame) -> Option<(SpaceId, VirtAddr)> {
        self.inner
            .lock()
            .entries
            .get(&frame)
            .map(|e| (e.owner.id(), e.upage))
    }

    /// Number of frames in the table.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames currently held by address space `space`.
    pub fn frames_of(&self, space: SpaceId) -> Vec<PhysFrame> {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|(_, e)| e.owner.id() == space)
            .map(|(&frame, _)| frame)
            .collect()
    }

    /// The contents of `frame`.
    ///
    /// # Safety
    ///
    /// `frame` must stay allocated for the lifetime of the slice, and nothing
    /// else may access its contents meanwhile. Holding a pin on it, or the
    /// owning address space's page table lock, is what guarantees this.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn frame_mut(&self, frame: PhysFrame) -> &mut [u8; PAGE_FRAME_SIZE] {
        let ptr = self.inner.lock().allocator.frame_ptr(frame);
        // SAFETY: Frames are page sized and page aligned, and the caller
        // guarantees exclusive access.
        unsafe { &mut *ptr.as_ptr().cast::<[u8; PAGE_FRAME_SIZE]>() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Block, MemDisk};
    use crate::mmu::SoftMmu;

    struct Fixture {
        mmu: SoftMmu,
        swap: SwapTable<MemDisk>,
        stats: VmStats,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                mmu: SoftMmu::new(),
                swap: SwapTable::new(Block::new("swap", MemDisk::new(64))),
                stats: VmStats::default(),
            }
        }

        fn reclaim(&self) -> Reclaim<'_, SoftMmu, MemDisk> {
            Reclaim {
                mmu: &self.mmu,
                swap: &self.swap,
                stats: &self.stats,
            }
        }
    }

    fn page(n: usize) -> VirtAddr {
        VirtAddr::new(0x1000_0000 + n * PAGE_FRAME_SIZE)
    }

    #[test]
    fn allocated_frames_start_pinned() {
        let fixture = Fixture::new();
        let frames = FrameTable::new(FramePool::new(2), 2);
        let space = AddressSpace::new(1);

        let frame = frames
            .allocate(&space, page(0), true, &fixture.reclaim())
            .unwrap();
        assert!(frames.is_pinned(frame));
        assert_eq!(frames.owner(frame), Some((1, page(0))));

        frames.unpin(frame);
        assert!(!frames.is_pinned(frame));
        assert!(frames.pin(frame));
        assert!(frames.is_pinned(frame));
    }

    #[test]
    fn release_is_idempotent() {
        let fixture = Fixture::new();
        let frames = FrameTable::new(FramePool::new(1), 2);
        let space = AddressSpace::new(1);

        let frame = frames
            .allocate(&space, page(0), false, &fixture.reclaim())
            .unwrap();
        assert!(frames.release(frame, true).is_some());
        assert!(frames.release(frame, true).is_none());
        assert!(frames.is_empty());
        assert!(!frames.pin(frame));

        let again = frames
            .allocate(&space, page(1), false, &fixture.reclaim())
            .unwrap();
        assert_eq!(again, frame);
    }

    #[test]
    fn exhausted_with_only_pinned_frames() {
        let fixture = Fixture::new();
        let frames = FrameTable::new(FramePool::new(1), 2);
        let space = AddressSpace::new(1);

        frames
            .allocate(&space, page(0), false, &fixture.reclaim())
            .unwrap();
        assert_eq!(
            frames.allocate(&space, page(1), false, &fixture.reclaim()),
            Err(VmError::NoVictim)
        );
    }

    #[test]
    fn single_pass_still_finds_a_referenced_victim() {
        let fixture = Fixture::new();
        let frames = FrameTable::new(FramePool::new(1), 1);
        let space = AddressSpace::new(1);

        let first = frames
            .allocate(&space, page(0), false, &fixture.reclaim())
            .unwrap();
        space.pages().insert_stack(page(0)).unwrap();
        space.pages().get_mut(page(0)).unwrap().frame = Some(first);
        fixture.mmu.set_mapping(1, page(0), first, true).unwrap();
        fixture.mmu.touch(1, page(0), false);
        frames.unpin(first);

        let second = frames
            .allocate(&space, page(1), false, &fixture.reclaim())
            .unwrap();
        assert_eq!(second, first);
        assert!(space.lookup(page(0)).unwrap().kind.swap_slot().is_some());
    }

    #[test]
    fn releasing_behind_hand_keeps_ring_consistent() {
        let fixture = Fixture::new();
        let frames = FrameTable::new(FramePool::new(4), 2);
        let space = AddressSpace::new(1);

        let all: Vec<_> = (0..4)
            .map(|n| {
                frames
                    .allocate(&space, page(n), false, &fixture.reclaim())
                    .unwrap()
            })
            .collect();
        frames.inner.lock().hand = 3;
        frames.release(all[1], true);
        {
            let inner = frames.inner.lock();
            assert_eq!(inner.hand, 2);
            assert_eq!(inner.clock[inner.hand], all[3]);
        }
        frames.release(all[3], true);
        assert_eq!(frames.inner.lock().hand, 0);
        assert_eq!(frames.frames_of(1).len(), 2);
    }
}
