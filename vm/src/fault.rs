//! Demand paging: the page fault handler and the explicit entry points that
//! register, load, pin and release user pages.

use crate::addr::{PhysFrame, VirtAddr};
use crate::block::{Block, BlockOp};
use crate::config::VmConfig;
use crate::error::{FaultOutcome, Result, Severity, VmError};
use crate::file::VmFile;
use crate::frame::{FrameAllocator, FrameTable, Reclaim};
use crate::mmu::Mmu;
use crate::page::{MapId, PageEntry, PageKind, Segment};
use crate::space::AddressSpace;
use crate::stats::{StatsSnapshot, VmStats};
use crate::swap::SwapTable;
use alloc::{sync::Arc, vec::Vec};
use kidneyos_shared::mem::PAGE_FRAME_SIZE;
use log::{debug, error, info, warn};

/// A page fault taken by a user thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    /// The faulting address.
    pub addr: VirtAddr,
    /// Whether the access was a write.
    pub write: bool,
    /// The user stack pointer at the time of the fault.
    pub esp: VirtAddr,
}

/// The virtual memory manager. One exists per kernel; it is shared by every
/// address space.
pub struct Vm<M, A, D> {
    config: VmConfig,
    mmu: M,
    frames: FrameTable<A>,
    swap: SwapTable<D>,
    stats: VmStats,
}

impl<M: Mmu, A: FrameAllocator, D: BlockOp> Vm<M, A, D> {
    pub fn new(config: VmConfig, mmu: M, allocator: A, swap: Block<D>) -> Self {
        info!(
            target: "vm::fault",
            "stack {}..{}, {} eviction passes",
            config.stack_bottom(),
            config.stack_top,
            config.eviction_passes
        );
        Self {
            config,
            mmu,
            frames: FrameTable::new(allocator, config.eviction_passes),
            swap: SwapTable::new(swap),
            stats: VmStats::default(),
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }
    pub fn mmu(&self) -> &M {
        &self.mmu
    }
    pub fn frames(&self) -> &FrameTable<A> {
        &self.frames
    }
    pub fn swap(&self) -> &SwapTable<D> {
        &self.swap
    }
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn reclaim(&self) -> Reclaim<'_, M, D> {
        Reclaim {
            mmu: &self.mmu,
            swap: &self.swap,
            stats: &self.stats,
        }
    }

    /// Resolves `fault` in `space`, making the page resident if the access is
    /// legitimate.
    ///
    /// # Panics
    ///
    /// If the kernel runs out of frames or swap while resolving the fault.
    pub fn handle_fault(&self, space: &Arc<AddressSpace>, fault: PageFault) -> FaultOutcome {
        self.stats.fault();
        let result = self.resolve(space, fault);
        self.settle(space, result)
    }

    fn resolve(&self, space: &Arc<AddressSpace>, fault: PageFault) -> Result<()> {
        check_alive(space)?;
        if !fault.addr.is_user() {
            return Err(VmError::KernelAddress(fault.addr));
        }

        let upage = fault.addr.page_base();
        match space.lookup(upage) {
            Some(entry) if fault.write && !entry.writable => {
                return Err(VmError::ReadOnly(fault.addr))
            }
            Some(_) => {}
            None if self.config.is_stack_growth(fault.addr, fault.esp) => {
                self.grow_stack(space, fault.addr)?;
            }
            None => return Err(VmError::Unhandled(fault.addr)),
        }
        self.load(space, upage)
    }

    /// Turns the result of a memory operation into what the faulting thread
    /// should do next. Process-level failures poison `space`; kernel-level
    /// failures panic.
    pub fn settle(&self, space: &AddressSpace, result: Result<()>) -> FaultOutcome {
        let Err(e) = result else {
            return FaultOutcome::Resolved;
        };
        match e.severity() {
            Severity::Kernel => {
                error!(target: "vm::fault", "space {}: {e}", space.id());
                panic!("virtual memory exhausted: {e}");
            }
            Severity::Process => {
                warn!(target: "vm::fault", "terminating space {}: {e}", space.id());
                space.kill();
                FaultOutcome::Terminate(e)
            }
        }
    }

    /// Registers the pages of a loadable segment. Nothing is loaded until the
    /// pages are touched.
    pub fn register_segment(&self, space: &AddressSpace, segment: &Segment) -> Result<()> {
        check_alive(space)?;
        space.pages().insert_segment(segment)?;
        debug!(
            target: "vm::page",
            "segment at {} ({} + {} bytes) in space {}",
            segment.upage,
            segment.read_bytes,
            segment.zero_bytes,
            space.id()
        );
        Ok(())
    }

    /// Registers a stack page covering `addr`. Returns `false` if it already
    /// existed.
    pub fn grow_stack(&self, space: &AddressSpace, addr: VirtAddr) -> Result<bool> {
        if !addr.is_user() {
            return Err(VmError::KernelAddress(addr));
        }
        if !self.config.in_stack_region(addr) {
            return Err(VmError::StackOverflow(addr));
        }
        let grown = space.pages().insert_stack(addr.page_base())?;
        if grown {
            self.stats.stack_growth();
            debug!(target: "vm::page", "stack grown to {} in space {}", addr.page_base(), space.id());
        }
        Ok(grown)
    }

    /// Maps the first stack page and returns the initial stack pointer.
    pub fn setup_stack(&self, space: &Arc<AddressSpace>) -> Result<VirtAddr> {
        let top = self.config.stack_top;
        let upage = top
            .as_usize()
            .checked_sub(PAGE_FRAME_SIZE)
            .map(VirtAddr::new)
            .ok_or(VmError::StackOverflow(top))?;
        self.grow_stack(space, upage)?;
        self.load(space, upage)?;
        Ok(top)
    }

    /// Maps `length` bytes of `file` at `start`, through a handle of its own.
    pub fn register_mapping(
        &self,
        space: &AddressSpace,
        file: &dyn VmFile,
        start: VirtAddr,
        length: usize,
    ) -> Result<MapId> {
        check_alive(space)?;
        let file = file.reopen()?;
        let id = space.pages().insert_mapping(file, start, length)?;
        debug!(
            target: "vm::page",
            "mapping {id}: {length} bytes at {start} in space {}",
            space.id()
        );
        Ok(id)
    }

    /// Unmaps mapping `id`, writing its dirty resident pages back to the file.
    pub fn unregister_group(&self, space: &AddressSpace, id: MapId) -> Result<()> {
        let mut pages = space.pages();
        let (_, entries) = pages.take_mapping(id).ok_or(VmError::UnknownMapping(id))?;
        debug!(target: "vm::page", "unmapping {id} in space {}", space.id());
        entries
            .into_iter()
            .fold(Ok(()), |result, entry| result.and(self.discard(space, entry, true)))
    }

    /// Releases every page, frame and swap slot of `space`. Memory mappings
    /// are unmapped first, as if by [`unregister_group`](Self::unregister_group).
    ///
    /// Only the first call does anything.
    pub fn teardown(&self, space: &AddressSpace) -> Result<()> {
        if !space.begin_teardown() {
            return Ok(());
        }
        let mut pages = space.pages();
        let mut result = Ok(());
        for id in pages.map_ids() {
            if let Some((_, entries)) = pages.take_mapping(id) {
                for entry in entries {
                    result = result.and(self.discard(space, entry, true));
                }
            }
        }
        for entry in pages.drain() {
            result = result.and(self.discard(space, entry, false));
        }
        drop(pages);

        self.mmu.destroy(space.id());
        debug!(target: "vm::page", "space {} torn down", space.id());
        result
    }

    /// Drops a removed entry's frame or swap slot. Dirty resident file pages
    /// are written back first if `write_back`.
    fn discard(&self, space: &AddressSpace, entry: PageEntry, write_back: bool) -> Result<()> {
        let id = space.id();
        let Some(frame) = entry.frame else {
            if let Some(slot) = entry.kind.swap_slot() {
                self.swap.free(slot)?;
            }
            return Ok(());
        };

        let dirty = self.mmu.is_dirty(id, entry.upage);
        self.mmu.clear_mapping(id, entry.upage);
        let mut result = Ok(());
        if let Some(slice) = entry.kind.file_slice().filter(|_| write_back && dirty) {
            // SAFETY: The caller holds the page table lock and has removed the
            // entry, so no eviction or copy can reach the frame.
            let page = unsafe { self.frames.frame_mut(frame) };
            result = slice.write_back(page).map_err(VmError::from);
            if result.is_ok() {
                self.stats.write_back();
            }
        }
        self.frames.release(frame, true);
        result
    }

    /// Makes `upage` resident.
    pub fn load(&self, space: &Arc<AddressSpace>, upage: VirtAddr) -> Result<()> {
        let frame = self.load_pinned(space, upage)?;
        self.frames.unpin(frame);
        Ok(())
    }

    /// Makes `upage` resident and pins its frame.
    fn load_pinned(&self, space: &Arc<AddressSpace>, upage: VirtAddr) -> Result<PhysFrame> {
        loop {
            let zeroed = {
                let pages = space.pages();
                if pages.is_closed() {
                    return Err(VmError::TornDown);
                }
                let entry = pages.lookup(upage).ok_or(VmError::NotRegistered(upage))?;
                match entry.frame {
                    Some(frame) if self.frames.pin(frame) => return Ok(frame),
                    // Being evicted; wait for it to leave.
                    Some(_) => None,
                    None => Some(matches!(entry.kind, PageKind::Stack)),
                }
            };
            let Some(zeroed) = zeroed else {
                core::hint::spin_loop();
                continue;
            };

            let frame = self.frames.allocate(space, upage, zeroed, &self.reclaim())?;
            match self.fill(space, upage, frame, zeroed) {
                Ok(true) => {
                    self.stats.load();
                    return Ok(frame);
                }
                // Another thread loaded the page first.
                Ok(false) => {
                    self.frames.release(frame, true);
                }
                Err(e) => {
                    self.frames.release(frame, true);
                    return Err(e);
                }
            }
        }
    }

    /// Fills the pinned, freshly allocated `frame` with the contents of
    /// `upage` and maps it. Returns `Ok(false)` if the page became resident
    /// elsewhere in the meantime.
    fn fill(
        &self,
        space: &AddressSpace,
        upage: VirtAddr,
        frame: PhysFrame,
        zeroed: bool,
    ) -> Result<bool> {
        let mut pages = space.pages();
        if pages.is_closed() {
            return Err(VmError::TornDown);
        }
        let entry = pages
            .get_mut(upage)
            .ok_or(VmError::NotRegistered(upage))?;
        if entry.frame.is_some() {
            return Ok(false);
        }

        let id = space.id();
        let kind = entry.kind.name();
        // SAFETY: The frame is pinned and not yet reachable from any page
        // table entry.
        let page = unsafe { self.frames.frame_mut(frame) };

        if let Some(slot) = entry.kind.swap_slot() {
            let writable = entry.writable;
            self.swap.swap_in_then(slot, page, || {
                Ok(self.mmu.set_mapping(id, upage, frame, writable)?)
            })?;
            entry.kind.swap_in();
            self.stats.swap_in();
        } else {
            match entry.kind.file_slice() {
                Some(slice) => slice.fill(page)?,
                None if !zeroed => page.fill(0),
                None => {}
            }
            self.mmu.set_mapping(id, upage, frame, entry.writable)?;
        }
        entry.frame = Some(frame);

        debug!(target: "vm::page", "loaded {kind} page {upage} of space {id} into {frame}");
        Ok(true)
    }

    /// Faults in and pins every page of `[addr, addr + len)` so that a system
    /// call can use the buffer. Only registered pages qualify; the stack is not
    /// grown.
    pub fn pin_user_range(
        &self,
        space: &Arc<AddressSpace>,
        addr: VirtAddr,
        len: usize,
        write: bool,
    ) -> Result<()> {
        check_alive(space)?;
        let mut pinned = Vec::new();
        for upage in user_pages(addr, len)? {
            match self.pin_page(space, upage, write) {
                Ok(frame) => pinned.push(frame),
                Err(e) => {
                    for frame in pinned {
                        self.frames.unpin(frame);
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Undoes [`pin_user_range`](Self::pin_user_range).
    pub fn unpin_user_range(&self, space: &AddressSpace, addr: VirtAddr, len: usize) {
        let Some(range) = addr.pages(len) else {
            return;
        };
        let pages = space.pages();
        for upage in range {
            if let Some(frame) = pages.lookup(upage).and_then(|e| e.frame) {
                self.frames.unpin(frame);
            }
        }
    }

    fn pin_page(&self, space: &Arc<AddressSpace>, upage: VirtAddr, write: bool) -> Result<PhysFrame> {
        let entry = space.lookup(upage).ok_or(VmError::NotRegistered(upage))?;
        if write && !entry.writable {
            return Err(VmError::ReadOnly(upage));
        }
        self.load_pinned(space, upage)
    }

    /// Copies user memory at `addr` into `buf`.
    pub fn copy_from_user(
        &self,
        space: &Arc<AddressSpace>,
        addr: VirtAddr,
        buf: &mut [u8],
    ) -> Result<()> {
        self.copy_user(space, addr, buf.len(), false, |bytes, at| {
            buf[at..at + bytes.len()].copy_from_slice(bytes);
        })
    }

    /// Copies `buf` into user memory at `addr`.
    pub fn copy_to_user(&self, space: &Arc<AddressSpace>, addr: VirtAddr, buf: &[u8]) -> Result<()> {
        self.copy_user(space, addr, buf.len(), true, |bytes, at| {
            bytes.copy_from_slice(&buf[at..at + bytes.len()]);
        })
    }

    /// Walks `[addr, addr + len)` page by page, handing `copy` the bytes of
    /// each page along with their offset into the range.
    fn copy_user(
        &self,
        space: &Arc<AddressSpace>,
        addr: VirtAddr,
        len: usize,
        write: bool,
        mut copy: impl FnMut(&mut [u8], usize),
    ) -> Result<()> {
        check_alive(space)?;
        user_pages(addr, len)?;

        let id = space.id();
        let mut done = 0;
        while done < len {
            let at = VirtAddr::new(addr.as_usize() + done);
            let (upage, offset) = (at.page_base(), at.page_offset());
            let n = (PAGE_FRAME_SIZE - offset).min(len - done);

            let frame = self.pin_page(space, upage, write)?;
            let copied = {
                let pages = space.pages();
                let resident = pages.lookup(upage).and_then(|e| e.frame) == Some(frame);
                if resident {
                    // SAFETY: The frame is pinned and its entry is locked.
                    let page = unsafe { self.frames.frame_mut(frame) };
                    copy(&mut page[offset..offset + n], done);
                    self.mmu.set_accessed(id, upage, true);
                    if write {
                        self.mmu.set_dirty(id, upage, true);
                    }
                }
                resident
            };
            self.frames.unpin(frame);
            if copied {
                done += n;
            }
        }
        Ok(())
    }
}

fn check_alive(space: &AddressSpace) -> Result<()> {
    if space.is_killed() {
        return Err(VmError::Terminated);
    }
    if space.is_torn_down() {
        return Err(VmError::TornDown);
    }
    Ok(())
}

/// Pages of `[addr, addr + len)`, all of which must be user pages.
fn user_pages(addr: VirtAddr, len: usize) -> Result<Vec<VirtAddr>> {
    let pages: Vec<_> = addr
        .pages(len)
        .ok_or(VmError::KernelAddress(addr))?
        .collect();
    match pages.iter().find(|page| !page.is_user()) {
        Some(&page) => Err(VmError::KernelAddress(page)),
        None => Ok(pages),
    }
}
