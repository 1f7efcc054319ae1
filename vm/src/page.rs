//! Supplemental page table: how to obtain the contents of every registered
//! user page, resident or not.

use crate::addr::{PhysFrame, VirtAddr};
use crate::error::{Result, VmError};
use crate::file::{self, VmFile};
use crate::swap::SwapSlot;
use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use core::fmt;
use kidneyos_shared::mem::PAGE_FRAME_SIZE;

/// Identifies one memory mapping within an address space.
pub type MapId = u32;

/// The part of a file that fills one page. `read_bytes + zero_bytes` is
/// always one page.
#[derive(Clone)]
pub struct FileSlice {
    pub file: Arc<dyn VmFile>,
    pub offset: u64,
    pub read_bytes: usize,
    pub zero_bytes: usize,
}

impl FileSlice {
    fn new(file: Arc<dyn VmFile>, offset: u64, read_bytes: usize) -> Self {
        debug_assert!(read_bytes <= PAGE_FRAME_SIZE);
        Self {
            file,
            offset,
            read_bytes,
            zero_bytes: PAGE_FRAME_SIZE - read_bytes,
        }
    }

    /// Reads the slice into `page` and zeroes the rest.
    pub fn fill(&self, page: &mut [u8; PAGE_FRAME_SIZE]) -> Result<()> {
        let (read, zero) = page.split_at_mut(self.read_bytes);
        file::read_exact_at(&*self.file, self.offset, read)?;
        zero.fill(0);
        Ok(())
    }

    /// Writes the file-backed part of `page` back to the file.
    pub fn write_back(&self, page: &[u8; PAGE_FRAME_SIZE]) -> Result<()> {
        file::write_all_at(&*self.file, self.offset, &page[..self.read_bytes])?;
        Ok(())
    }
}

impl fmt::Debug for FileSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSlice")
            .field("offset", &self.offset)
            .field("read_bytes", &self.read_bytes)
            .field("zero_bytes", &self.zero_bytes)
            .finish_non_exhaustive()
    }
}

/// Where a page's contents come from when it is not in swap.
#[derive(Debug, Clone)]
pub enum Backing {
    Stack,
    FileBacked(FileSlice),
    MemoryMapped(MapId, FileSlice),
}

impl Backing {
    pub fn file_slice(&self) -> Option<&FileSlice> {
        match self {
            Backing::Stack => None,
            Backing::FileBacked(slice) | Backing::MemoryMapped(_, slice) => Some(slice),
        }
    }

    pub fn map_id(&self) -> Option<MapId> {
        match self {
            Backing::MemoryMapped(id, _) => Some(*id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum PageKind {
    /// Anonymous zero-filled page.
    Stack,
    FileBacked(FileSlice),
    MemoryMapped(MapId, FileSlice),
    /// Contents live in `slot`; `prior` is restored on swap-in.
    Swapped { slot: SwapSlot, prior: Backing },
}

impl PageKind {
    pub fn name(&self) -> &'static str {
        match self {
            PageKind::Stack => "stack",
            PageKind::FileBacked(_) => "file",
            PageKind::MemoryMapped(..) => "mmap",
            PageKind::Swapped { .. } => "swapped",
        }
    }

    /// The file slice of a page that is not in swap.
    pub fn file_slice(&self) -> Option<&FileSlice> {
        match self {
            PageKind::FileBacked(slice) | PageKind::MemoryMapped(_, slice) => Some(slice),
            _ => None,
        }
    }

    /// Mapping the page belongs to, whether or not it is in swap.
    pub fn map_id(&self) -> Option<MapId> {
        match self {
            PageKind::MemoryMapped(id, _) => Some(*id),
            PageKind::Swapped { prior, .. } => prior.map_id(),
            _ => None,
        }
    }

    pub fn swap_slot(&self) -> Option<SwapSlot> {
        match self {
            PageKind::Swapped { slot, .. } => Some(*slot),
            _ => None,
        }
    }

    /// Records that the contents now live in `slot`.
    ///
    /// # Panics
    ///
    /// If the page is already swapped out.
    pub(crate) fn swap_out(&mut self, slot: SwapSlot) {
        let prior = match core::mem::replace(self, PageKind::Stack) {
            PageKind::Stack => Backing::Stack,
            PageKind::FileBacked(slice) => Backing::FileBacked(slice),
            PageKind::MemoryMapped(id, slice) => Backing::MemoryMapped(id, slice),
            PageKind::Swapped { slot: old, .. } => panic!("page already swapped out to {old}"),
        };
        *self = PageKind::Swapped { slot, prior };
    }

    /// Restores the kind the page had before it was swapped out.
    pub(crate) fn swap_in(&mut self) -> Option<SwapSlot> {
        let slot = self.swap_slot()?;
        if let PageKind::Swapped { prior, .. } = core::mem::replace(self, PageKind::Stack) {
            *self = prior.into();
        }
        Some(slot)
    }
}

impl From<Backing> for PageKind {
    fn from(backing: Backing) -> Self {
        match backing {
            Backing::Stack => PageKind::Stack,
            Backing::FileBacked(slice) => PageKind::FileBacked(slice),
            Backing::MemoryMapped(id, slice) => PageKind::MemoryMapped(id, slice),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PageEntry {
    pub upage: VirtAddr,
    pub writable: bool,
    pub kind: PageKind,
    /// Frame holding the page while it is resident.
    pub frame: Option<PhysFrame>,
}

impl PageEntry {
    fn new(upage: VirtAddr, writable: bool, kind: PageKind) -> Self {
        Self {
            upage,
            writable,
            kind,
            frame: None,
        }
    }
}

/// A loadable segment of an executable.
#[derive(Clone)]
pub struct Segment {
    pub file: Arc<dyn VmFile>,
    pub offset: u64,
    pub upage: VirtAddr,
    pub read_bytes: usize,
    pub zero_bytes: usize,
    pub writable: bool,
}

pub struct Mapping {
    pub file: Arc<dyn VmFile>,
    pub start: VirtAddr,
    pub pages: usize,
}

impl Mapping {
    pub fn pages(&self) -> impl Iterator<Item = VirtAddr> + '_ {
        (0..self.pages).filter_map(|i| self.start.checked_add_pages(i))
    }
}

#[derive(Default)]
pub struct SupplementalPageTable {
    entries: BTreeMap<VirtAddr, PageEntry>,
    mappings: BTreeMap<MapId, Mapping>,
    next_map_id: MapId,
    closed: bool,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry for the page at `upage`, which must be page aligned.
    pub fn lookup(&self, upage: VirtAddr) -> Option<&PageEntry> {
        debug_assert!(upage.is_page_aligned());
        self.entries.get(&upage)
    }

    pub fn get_mut(&mut self, upage: VirtAddr) -> Option<&mut PageEntry> {
        debug_assert!(upage.is_page_aligned());
        self.entries.get_mut(&upage)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &PageEntry> {
        self.entries.values()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(VmError::TornDown);
        }
        Ok(())
    }

    /// Page bases of `[start, start + len)`, provided all are free user pages.
    fn free_user_pages(&self, start: VirtAddr, len: usize) -> Result<Vec<VirtAddr>> {
        let pages: Vec<_> = start.pages(len).ok_or(VmError::KernelAddress(start))?.collect();
        for &page in &pages {
            if !page.is_user() {
                return Err(VmError::KernelAddress(page));
            }
            if self.entries.contains_key(&page) {
                return Err(VmError::AlreadyRegistered(page));
            }
        }
        Ok(pages)
    }

    /// Registers one `FileBacked` entry per page of `segment`. Nothing is
    /// registered if any page is already taken.
    pub fn insert_segment(&mut self, segment: &Segment) -> Result<()> {
        self.check_open()?;
        let len = segment
            .read_bytes
            .checked_add(segment.zero_bytes)
            .filter(|len| len % PAGE_FRAME_SIZE == 0)
            .ok_or(VmError::InvalidMapping)?;
        if !segment.upage.is_page_aligned() {
            return Err(VmError::InvalidMapping);
        }

        let pages = self.free_user_pages(segment.upage, len)?;
        let offsets = (0..pages.len())
            .map(|i| segment.offset.checked_add((i * PAGE_FRAME_SIZE) as u64))
            .collect::<Option<Vec<_>>>()
            .ok_or(VmError::InvalidMapping)?;

        let mut remaining = segment.read_bytes;
        for (upage, offset) in pages.into_iter().zip(offsets) {
            let read_bytes = remaining.min(PAGE_FRAME_SIZE);
            remaining -= read_bytes;
            let slice = FileSlice::new(segment.file.clone(), offset, read_bytes);
            self.entries.insert(
                upage,
                PageEntry::new(upage, segment.writable, PageKind::FileBacked(slice)),
            );
        }
        Ok(())
    }

    /// Registers a writable `Stack` entry at `upage`. Returns `false` if the
    /// page was already registered.
    pub fn insert_stack(&mut self, upage: VirtAddr) -> Result<bool> {
        self.check_open()?;
        debug_assert!(upage.is_page_aligned());
        if self.entries.contains_key(&upage) {
            return Ok(false);
        }
        self.entries
            .insert(upage, PageEntry::new(upage, true, PageKind::Stack));
        Ok(true)
    }

    /// Registers `length` bytes of `file` at `start` as one mapping.
    ///
    /// Pages past the end of the file read as zeroes.
    pub fn insert_mapping(
        &mut self,
        file: Arc<dyn VmFile>,
        start: VirtAddr,
        length: usize,
    ) -> Result<MapId> {
        self.check_open()?;
        if length == 0 || start.is_null() || !start.is_page_aligned() || !start.is_user() {
            return Err(VmError::InvalidMapping);
        }
        let pages: Vec<_> = start
            .pages(length)
            .ok_or(VmError::InvalidMapping)?
            .collect();
        if pages.iter().any(|page| !page.is_user()) {
            return Err(VmError::InvalidMapping);
        }
        if let Some(&page) = pages.iter().find(|page| self.entries.contains_key(page)) {
            return Err(VmError::AlreadyRegistered(page));
        }

        let id = self.next_map_id;
        self.next_map_id += 1;

        let readable = usize::try_from(file.length()).unwrap_or(usize::MAX).min(length);
        for (i, &upage) in pages.iter().enumerate() {
            let offset = i * PAGE_FRAME_SIZE;
            let read_bytes = readable.saturating_sub(offset).min(PAGE_FRAME_SIZE);
            let slice = FileSlice::new(file.clone(), offset as u64, read_bytes);
            self.entries.insert(
                upage,
                PageEntry::new(upage, true, PageKind::MemoryMapped(id, slice)),
            );
        }
        self.mappings.insert(
            id,
            Mapping {
                file,
                start,
                pages: pages.len(),
            },
        );
        Ok(id)
    }

    pub fn mapping(&self, id: MapId) -> Option<&Mapping> {
        self.mappings.get(&id)
    }

    pub fn map_ids(&self) -> Vec<MapId> {
        self.mappings.keys().copied().collect()
    }

    /// Removes mapping `id` along with all of its entries.
    pub fn take_mapping(&mut self, id: MapId) -> Option<(Mapping, Vec<PageEntry>)> {
        let mapping = self.mappings.remove(&id)?;
        let entries = mapping
            .pages()
            .filter_map(|page| self.entries.remove(&page))
            .collect();
        Some((mapping, entries))
    }

    /// Removes every entry and refuses further registrations.
    pub fn drain(&mut self) -> Vec<PageEntry> {
        self.closed = true;
        self.mappings.clear();
        core::mem::take(&mut self.entries).into_values().collect()
    }
}
