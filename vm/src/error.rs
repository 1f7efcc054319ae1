use crate::addr::VirtAddr;
use crate::block::BlockError;
use crate::file::FileError;
use crate::mmu::MapError;
use crate::page::MapId;
use crate::swap::SwapSlot;
use core::error::Error;
use core::fmt::{self, Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// The physical allocator had no frame even after an eviction.
    OutOfFrames,
    /// Every eviction candidate stayed referenced or pinned.
    NoVictim,
    /// Every swap slot is occupied.
    SwapFull,
    SlotNotInUse(SwapSlot),
    SlotOutOfRange(SwapSlot),
    Block(BlockError),
    File(FileError),
    Map(MapError),
    /// The page already has a supplemental entry.
    AlreadyRegistered(VirtAddr),
    NotRegistered(VirtAddr),
    /// A mapping request with a null, unaligned, empty or kernel range.
    InvalidMapping,
    UnknownMapping(MapId),
    /// Stack growth below the lowest permitted stack page.
    StackOverflow(VirtAddr),
    KernelAddress(VirtAddr),
    /// Write to a page registered read-only.
    ReadOnly(VirtAddr),
    /// Fault on an address no region covers.
    Unhandled(VirtAddr),
    /// The address space was poisoned by an earlier failure.
    Terminated,
    /// The address space has already been torn down.
    TornDown,
}

/// Who pays for a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The faulting process is terminated.
    Process,
    /// The kernel itself can't continue.
    Kernel,
}

impl VmError {
    pub fn severity(&self) -> Severity {
        match self {
            VmError::OutOfFrames | VmError::NoVictim | VmError::SwapFull => Severity::Kernel,
            _ => Severity::Process,
        }
    }
}

impl Display for VmError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            VmError::OutOfFrames => write!(f, "out of physical frames after eviction"),
            VmError::NoVictim => write!(f, "no evictable frame found"),
            VmError::SwapFull => write!(f, "swap space exhausted"),
            VmError::SlotNotInUse(slot) => write!(f, "{slot} is not in use"),
            VmError::SlotOutOfRange(slot) => write!(f, "{slot} is out of range"),
            VmError::Block(e) => write!(f, "swap device: {e}"),
            VmError::File(e) => write!(f, "backing file: {e}"),
            VmError::Map(e) => write!(f, "page table: {e}"),
            VmError::AlreadyRegistered(addr) => write!(f, "page {addr} is already registered"),
            VmError::NotRegistered(addr) => write!(f, "page {addr} is not registered"),
            VmError::InvalidMapping => write!(f, "invalid memory mapping request"),
            VmError::UnknownMapping(id) => write!(f, "no memory mapping with id {id}"),
            VmError::StackOverflow(addr) => write!(f, "stack growth to {addr} exceeds the limit"),
            VmError::KernelAddress(addr) => write!(f, "user access to kernel address {addr}"),
            VmError::ReadOnly(addr) => write!(f, "write to read-only page {addr}"),
            VmError::Unhandled(addr) => write!(f, "unhandled page fault at {addr}"),
            VmError::Terminated => write!(f, "address space was terminated"),
            VmError::TornDown => write!(f, "address space was torn down"),
        }
    }
}

impl Error for VmError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            VmError::Block(e) => Some(e),
            VmError::File(e) => Some(e),
            VmError::Map(e) => Some(e),
            _ => None,
        }
    }
}

impl From<BlockError> for VmError {
    fn from(e: BlockError) -> Self {
        VmError::Block(e)
    }
}

impl From<FileError> for VmError {
    fn from(e: FileError) -> Self {
        VmError::File(e)
    }
}

impl From<MapError> for VmError {
    fn from(e: MapError) -> Self {
        VmError::Map(e)
    }
}

pub type Result<T> = core::result::Result<T, VmError>;

/// What the fault handler should do once a fault has been dealt with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The page is resident; resume the faulting thread.
    Resolved,
    /// Terminate the faulting process with a failure status.
    Terminate(VmError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn exhaustion_is_kernel_fatal() {
        assert_eq!(VmError::NoVictim.severity(), Severity::Kernel);
        assert_eq!(VmError::SwapFull.severity(), Severity::Kernel);
        assert_eq!(
            VmError::File(FileError::ShortRead).severity(),
            Severity::Process
        );
        assert_eq!(
            VmError::Unhandled(VirtAddr::new(0)).severity(),
            Severity::Process
        );
    }

    #[test]
    fn lifted_errors_keep_source() {
        let err: VmError = BlockError::ReadError.into();
        assert_eq!(err, VmError::Block(BlockError::ReadError));
        assert!(err.source().is_some());
        assert_eq!(
            err.to_string(),
            "swap device: error reading from the block device"
        );
    }
}
