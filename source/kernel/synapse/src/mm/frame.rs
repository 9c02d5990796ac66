// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Physical frame allocator over a single contiguous RAM window.

use alloc::vec::Vec;

use super::bitmap::PageBitmap;
use super::PAGE_SIZE;
use crate::types::PhysAddr;

/// A run of physically contiguous frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Shard {
    pub base: PhysAddr,
    pub pages: usize,
}

/// Bitmap-backed frame allocator; same first-fit structure as the virtual side.
pub struct FrameAllocator {
    base: PhysAddr,
    bitmap: PageBitmap,
}

impl FrameAllocator {
    /// Manages `frames` page frames starting at the page-aligned `base`.
    pub fn new(base: PhysAddr, frames: usize) -> Self {
        debug_assert!(base.is_page_aligned());
        Self { base, bitmap: PageBitmap::new(frames) }
    }

    pub fn base(&self) -> PhysAddr {
        self.base
    }

    pub fn total_frames(&self) -> usize {
        self.bitmap.len()
    }

    pub fn free_frames(&self) -> usize {
        self.bitmap.free()
    }

    pub fn contains(&self, pa: PhysAddr) -> bool {
        pa >= self.base && pa.raw() < self.base.raw() + self.bitmap.len() * PAGE_SIZE
    }

    /// Allocates `count` physically contiguous frames.
    pub fn allocate_contiguous(&mut self, count: usize) -> Option<PhysAddr> {
        let index = self.bitmap.find_free_run(count)?;
        self.bitmap.set_run(index, count);
        Some(self.frame_addr(index))
    }

    /// Allocates `count` frames, gathering shards when no single run fits.
    ///
    /// Either every frame is handed out or nothing is.
    pub fn allocate_shards(&mut self, count: usize) -> Option<Vec<Shard>> {
        if count == 0 || self.bitmap.free() < count {
            return None;
        }
        if let Some(base) = self.allocate_contiguous(count) {
            return Some(alloc::vec![Shard { base, pages: count }]);
        }
        let mut shards = Vec::new();
        let mut remaining = count;
        let mut index = 0;
        while remaining > 0 && index < self.bitmap.len() {
            if self.bitmap.is_set(index) {
                index += 1;
                continue;
            }
            let start = index;
            while index < self.bitmap.len() && index - start < remaining && !self.bitmap.is_set(index) {
                index += 1;
            }
            let pages = index - start;
            self.bitmap.set_run(start, pages);
            shards.push(Shard { base: self.frame_addr(start), pages });
            remaining -= pages;
        }
        Some(shards)
    }

    /// Returns `count` frames starting at `base` to the pool.
    pub fn release(&mut self, base: PhysAddr, count: usize) {
        if let Some(index) = self.frame_index(base) {
            self.bitmap.clear_run(index, count);
        } else {
            panic!("frame: release of foreign frame {:#x}", base);
        }
    }

    fn frame_addr(&self, index: usize) -> PhysAddr {
        self.base.add(index * PAGE_SIZE)
    }

    fn frame_index(&self, pa: PhysAddr) -> Option<usize> {
        if !self.contains(pa) || !pa.is_page_aligned() {
            return None;
        }
        Some((pa.raw() - self.base.raw()) / PAGE_SIZE)
    }
}
