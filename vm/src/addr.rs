//! Virtual addresses and physical frame numbers.

use core::fmt;
use kidneyos_shared::mem::{
    is_user_vaddr, page_offset, page_round_down, page_round_up, PAGE_FRAME_SIZE,
};

/// A virtual address in some process's address space.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VirtAddr(usize);

impl VirtAddr {
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Base address of the page containing this address.
    pub const fn page_base(self) -> Self {
        Self(page_round_down(self.0))
    }

    pub const fn page_offset(self) -> usize {
        page_offset(self.0)
    }

    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Whether the address is below the kernel split.
    pub const fn is_user(self) -> bool {
        is_user_vaddr(self.0)
    }

    pub fn checked_add(self, bytes: usize) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    /// The page `count` pages after this one.
    pub fn checked_add_pages(self, count: usize) -> Option<Self> {
        self.checked_add(count.checked_mul(PAGE_FRAME_SIZE)?)
    }

    /// Base addresses of every page overlapping `[self, self + len)`.
    ///
    /// Returns `None` if the range wraps around the address space.
    pub fn pages(self, len: usize) -> Option<impl Iterator<Item = VirtAddr>> {
        let start = page_round_down(self.0);
        let end = if len == 0 {
            start
        } else {
            page_round_up(self.0.checked_add(len)?)?
        };
        Some((start..end).step_by(PAGE_FRAME_SIZE).map(VirtAddr))
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#010x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl From<usize> for VirtAddr {
    fn from(addr: usize) -> Self {
        Self(addr)
    }
}

/// A physical page frame, named by its frame number.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct PhysFrame(usize);

impl PhysFrame {
    pub const fn from_number(number: usize) -> Self {
        Self(number)
    }

    pub const fn number(self) -> usize {
        self.0
    }

    pub const fn start_address(self) -> usize {
        self.0 * PAGE_FRAME_SIZE
    }
}

impl fmt::Display for PhysFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame {}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[test]
    fn pages_cover_partial_ends() {
        let pages: Vec<_> = VirtAddr::new(0x1ff0).pages(0x20).unwrap().collect();
        assert_eq!(pages, [VirtAddr::new(0x1000), VirtAddr::new(0x2000)]);
    }

    #[test]
    fn empty_range_has_no_pages() {
        assert_eq!(VirtAddr::new(0x1000).pages(0).unwrap().count(), 0);
    }

    #[test]
    fn wrapping_range_rejected() {
        assert!(VirtAddr::new(usize::MAX - 10).pages(100).is_none());
    }

    #[test]
    fn frame_addresses() {
        let frame = PhysFrame::from_number(3);
        assert_eq!(frame.start_address(), 3 * PAGE_FRAME_SIZE);
        assert_eq!(frame.number(), 3);
    }
}
