//! A physical frame allocator over a fixed array of page frames.

use super::FrameAllocator;
use crate::addr::PhysFrame;
use alloc::boxed::Box;
use bitbybit::bitfield;
use core::ptr::{self, NonNull};
use kidneyos_shared::mem::PAGE_FRAME_SIZE;
use log::info;
use zerocopy::FromZeroes;

#[bitfield(u8, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
    // Known to hold only zeroes.
    #[bit(1, rw)]
    scrubbed: bool,
}

#[derive(FromZeroes)]
#[repr(C, align(4096))]
struct FrameBuf([u8; PAGE_FRAME_SIZE]);

/// Hands out frames next-fit from an owned region, tracking them in a core map.
pub struct FramePool {
    start: NonNull<FrameBuf>,
    core_map: Box<[CoreMapEntry]>,
    frames_allocated: usize,
    /// The next frame number to start searching for a free frame.
    position: usize,
}

// SAFETY: The pool exclusively owns the region behind `start`.
unsafe impl Send for FramePool {}

impl FramePool {
    pub fn new(frames: usize) -> Self {
        let region = FrameBuf::new_box_slice_zeroed(frames);
        let start = NonNull::from(Box::leak(region)).cast::<FrameBuf>();
        info!(target: "vm::frame", "frame pool of {frames} frames");

        Self {
            start,
            core_map: (0..frames)
                .map(|_| CoreMapEntry::default().with_scrubbed(true))
                .collect(),
            frames_allocated: 0,
            position: 0,
        }
    }

    pub fn frames_allocated(&self) -> usize {
        self.frames_allocated
    }

    pub fn total_frames(&self) -> usize {
        self.core_map.len()
    }

    fn next_fit(&self) -> Option<usize> {
        let total = self.core_map.len();
        (0..total)
            .map(|i| (self.position + i) % total)
            .find(|&i| !self.core_map[i].allocated())
    }
}

impl FrameAllocator for FramePool {
    fn alloc(&mut self, zeroed: bool) -> Option<PhysFrame> {
        if self.frames_allocated == self.core_map.len() {
            return None;
        }
        let index = self.next_fit()?;
        let entry = self.core_map[index];
        assert!(!entry.allocated());

        if zeroed && !entry.scrubbed() {
            // SAFETY: `index` is in bounds of the region and the frame is free.
            unsafe { (*self.start.as_ptr().add(index)).0.fill(0) };
        }
        self.core_map[index] = entry.with_allocated(true).with_scrubbed(false);
        self.position = index + 1;
        self.frames_allocated += 1;

        Some(PhysFrame::from_number(index))
    }

    fn dealloc(&mut self, frame: PhysFrame) {
        let index = frame.number();
        assert!(
            self.core_map[index].allocated(),
            "double free of {frame}"
        );
        self.core_map[index] = self.core_map[index].with_allocated(false);
        self.frames_allocated -= 1;
    }

    fn frame_ptr(&self, frame: PhysFrame) -> NonNull<u8> {
        assert!(frame.number() < self.core_map.len(), "{frame} is not in the pool");
        // SAFETY: The frame number is in bounds of the region.
        unsafe { self.start.add(frame.number()).cast() }
    }
}

impl Drop for FramePool {
    fn drop(&mut self) {
        let region = ptr::slice_from_raw_parts_mut(self.start.as_ptr(), self.core_map.len());
        // SAFETY: `region` is the slice leaked in `new`, and nothing borrows it any more.
        drop(unsafe { Box::from_raw(region) });
    }
}
