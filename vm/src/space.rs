use crate::addr::VirtAddr;
use crate::page::{PageEntry, SupplementalPageTable};
use crate::sync::{Mutex, MutexGuard};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};
use log::warn;

/// Identifies an address space to the MMU.
pub type SpaceId = u16;

/// One process's view of virtual memory.
pub struct AddressSpace {
    id: SpaceId,
    pages: Mutex<SupplementalPageTable>,
    killed: AtomicBool,
    torn_down: AtomicBool,
}

impl AddressSpace {
    pub fn new(id: SpaceId) -> Arc<Self> {
        Arc::new(Self {
            id,
            pages: Mutex::new(SupplementalPageTable::new()),
            killed: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> SpaceId {
        self.id
    }

    /// Snapshot of the entry for the page containing `addr`.
    pub fn lookup(&self, addr: VirtAddr) -> Option<PageEntry> {
        self.pages.lock().lookup(addr.page_base()).cloned()
    }

    pub fn resident_pages(&self) -> usize {
        self.pages
            .lock()
            .entries()
            .filter(|e| e.frame.is_some())
            .count()
    }

    pub(crate) fn pages(&self) -> MutexGuard<'_, SupplementalPageTable> {
        self.pages.lock()
    }

    /// Marks the process for termination. Its next fault terminates it.
    pub fn kill(&self) {
        if !self.killed.swap(true, Ordering::AcqRel) {
            warn!(target: "vm::fault", "address space {} poisoned", self.id);
        }
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    /// Returns `true` exactly once, for the first caller.
    pub(crate) fn begin_teardown(&self) -> bool {
        !self.torn_down.swap(true, Ordering::AcqRel)
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_rounds_down() {
        let space = AddressSpace::new(3);
        space.pages().insert_stack(VirtAddr::new(0x7000)).unwrap();
        let entry = space.lookup(VirtAddr::new(0x7abc)).unwrap();
        assert_eq!(entry.upage, VirtAddr::new(0x7000));
        assert!(space.lookup(VirtAddr::new(0x8000)).is_none());
        assert_eq!(space.resident_pages(), 0);
    }

    #[test]
    fn teardown_begins_once() {
        let space = AddressSpace::new(1);
        assert!(space.begin_teardown());
        assert!(!space.begin_teardown());
        assert!(space.is_torn_down());
    }

    #[test]
    fn kill_is_sticky() {
        let space = AddressSpace::new(1);
        assert!(!space.is_killed());
        space.kill();
        space.kill();
        assert!(space.is_killed());
    }
}
