//! Demand-paged virtual memory for KidneyOS user processes.
//!
//! [`Vm`] ties together the per-process [`SupplementalPageTable`]s, the
//! [`FrameTable`] with its clock eviction, and the [`SwapTable`]. The page
//! table hardware, the physical frame allocator, backing files and the swap
//! disk come in through the [`Mmu`], [`FrameAllocator`], [`VmFile`] and
//! [`BlockOp`] traits.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub mod addr;
pub mod block;
pub mod config;
pub mod error;
pub mod fault;
pub mod file;
pub mod frame;
pub mod mmu;
pub mod page;
pub mod space;
pub mod stats;
pub mod swap;
pub mod sync;


pub use addr::{PhysFrame, VirtAddr};
pub use block::{Block, BlockError, BlockOp, MemDisk};
pub use config::VmConfig;
pub use error::{FaultOutcome, Severity, VmError};
pub use fault::{PageFault, Vm};
pub use file::{FileError, MemFile, VmFile};
pub use frame::{FrameAllocator, FramePool, FrameTable};
pub use mmu::{MapError, Mmu, SoftMmu};
pub use page::{MapId, PageEntry, PageKind, Segment, SupplementalPageTable};
pub use space::{AddressSpace, SpaceId};
pub use swap::{SwapSlot, SwapTable};
