// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-task memory map: image, heap break, stack window and extra regions
//! OWNERS: @kernel-mm-team
//! PUBLIC API: TaskMemory (grow_heap/grow_stack/map_anonymous/record/forget), Region, RegionKind
//! DEPENDS_ON: mm::AddressSpaceManager, config::Config
//! INVARIANTS: The break never drops below the heap base; the stack grows only inside its growth window
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use alloc::vec::Vec;

use crate::config::Config;
use crate::mm::{
    align_down, align_up, Access, AddressSpaceError, AddressSpaceManager, AllocRequest, AsHandle, RangeKind,
    PAGE_SIZE,
};
use crate::types::VirtAddr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionKind {
    Image,
    Heap,
    Stack,
    Mapped,
    Trampoline,
    Driver,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub kind: RegionKind,
    pub start: VirtAddr,
    pub pages: usize,
}

/// Why a user page fault was not handled as stack growth.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StackFault {
    /// Address is outside the growth window.
    OutsideWindow,
    /// The window pages could not be mapped.
    Map(AddressSpaceError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskMemory {
    regions: Vec<Region>,
    heap_base: usize,
    brk: usize,
    stack_floor: usize,
}

impl TaskMemory {
    /// Memory map of a freshly loaded image whose last byte ends at `image_end`.
    pub fn new(image_end: VirtAddr, stack_floor: usize) -> Self {
        let heap_base = align_up(image_end.raw());
        Self { regions: Vec::new(), heap_base, brk: heap_base, stack_floor }
    }

    /// Map of the bootstrap task, which owns no user memory.
    pub fn empty() -> Self {
        Self { regions: Vec::new(), heap_base: 0, brk: 0, stack_floor: 0 }
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn record(&mut self, kind: RegionKind, start: VirtAddr, pages: usize) {
        self.regions.push(Region { kind, start, pages });
    }

    pub fn forget(&mut self, start: VirtAddr) -> Option<Region> {
        let index = self.regions.iter().position(|region| region.start == start)?;
        Some(self.regions.remove(index))
    }

    pub fn retain(&mut self, keep: impl FnMut(&Region) -> bool) {
        self.regions.retain(keep);
    }

    pub fn brk(&self) -> usize {
        self.brk
    }

    pub fn stack_floor(&self) -> usize {
        self.stack_floor
    }

    pub fn pages_of(&self, kind: RegionKind) -> usize {
        self.regions.iter().filter(|region| region.kind == kind).map(|region| region.pages).sum()
    }

    /// Moves the break by `delta` bytes, mapping fresh zeroed pages as it grows.
    /// Returns the previous break. Shrinking keeps the pages mapped.
    pub fn grow_heap(
        &mut self,
        delta: isize,
        spaces: &mut AddressSpaceManager,
        space: AsHandle,
    ) -> Result<usize, AddressSpaceError> {
        let old = self.brk;
        let new = old.checked_add_signed(delta).ok_or(AddressSpaceError::InvalidArgs)?;
        if new < self.heap_base {
            return Err(AddressSpaceError::InvalidArgs);
        }
        let mapped_end = align_up(old);
        let wanted_end = align_up(new);
        if wanted_end > mapped_end {
            let pages = (wanted_end - mapped_end) / PAGE_SIZE;
            let at = VirtAddr::page_aligned(mapped_end).ok_or(AddressSpaceError::OutOfRange)?;
            let request = AllocRequest::new(Access::USER_RW, RangeKind::CopyOnFork).at(at).zeroed();
            spaces.allocate(space, pages, request)?;
            self.record(RegionKind::Heap, at, pages);
        }
        self.brk = new;
        Ok(old)
    }

    /// Backs `pages` zeroed pages at the lowest free address and records them as `Mapped`.
    pub fn map_anonymous(
        &mut self,
        pages: usize,
        spaces: &mut AddressSpaceManager,
        space: AsHandle,
    ) -> Result<VirtAddr, AddressSpaceError> {
        let request = AllocRequest::new(Access::USER_RW, RangeKind::CopyOnFork).zeroed();
        let start = spaces.allocate(space, pages, request)?;
        self.record(RegionKind::Mapped, start, pages);
        Ok(start)
    }

    /// Grows the stack downwards to cover `addr` if it lies in the growth window.
    pub fn grow_stack(
        &mut self,
        addr: usize,
        config: &Config,
        spaces: &mut AddressSpaceManager,
        space: AsHandle,
    ) -> Result<usize, StackFault> {
        let limit = config.stack_limit_floor();
        if addr < limit || addr >= self.stack_floor {
            return Err(StackFault::OutsideWindow);
        }
        let cover = (self.stack_floor - align_down(addr)) / PAGE_SIZE;
        let room = (self.stack_floor - limit) / PAGE_SIZE;
        let pages = config.stack_growth_min_pages.max(cover + config.stack_growth_headroom_pages).min(room);
        let start = self.stack_floor - pages * PAGE_SIZE;
        let at = VirtAddr::page_aligned(start).ok_or(StackFault::Map(AddressSpaceError::OutOfRange))?;
        let request = AllocRequest::new(Access::USER_RW, RangeKind::CopyOnFork).at(at).zeroed();
        spaces.allocate(space, pages, request).map_err(StackFault::Map)?;
        self.record(RegionKind::Stack, at, pages);
        self.stack_floor = start;
        log::debug!(target: "task", "stack grown by {} pages to {:#x}", pages, start);
        Ok(pages)
    }
}
