// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Allocated virtual ranges and their ownership policy.

use alloc::vec::Vec;

use bitflags::bitflags;

use super::frame::Shard;
use super::page_table::PageFlags;
use super::PAGE_SIZE;
use crate::types::{PhysAddr, VirtAddr};

bitflags! {
    /// Access granted to a range. Read access is implied.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Access: u8 {
        const WRITE = 1 << 0;
        const EXECUTE = 1 << 1;
        const USER = 1 << 2;
    }
}

impl Access {
    pub const USER_RW: Self = Self::USER.union(Self::WRITE);
    pub const USER_RX: Self = Self::USER.union(Self::EXECUTE);
    pub const KERNEL_RW: Self = Self::WRITE;

    pub(crate) fn page_flags(self) -> PageFlags {
        let mut flags = PageFlags::VALID | PageFlags::READ | PageFlags::ACCESSED;
        if self.contains(Self::WRITE) {
            flags |= PageFlags::WRITE | PageFlags::DIRTY;
        }
        if self.contains(Self::EXECUTE) {
            flags |= PageFlags::EXECUTE;
        }
        if self.contains(Self::USER) {
            flags |= PageFlags::USER;
        } else {
            flags |= PageFlags::GLOBAL;
        }
        flags
    }
}

/// Who owns the frames behind a range and what fork does with it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangeKind {
    /// Private to the context and never inherited by a fork.
    Owned { free_on_unmap: bool },
    /// Frames belong to someone else; fork maps the same frames.
    Shared,
    /// Private; fork copies the contents into fresh frames.
    CopyOnFork,
    /// Private; fork maps the same frames into the child without copying.
    SkipOnFork,
}

impl RangeKind {
    /// Whether freeing the range returns its frames to the frame allocator.
    pub const fn releases_frames(self) -> bool {
        match self {
            RangeKind::Owned { free_on_unmap } => free_on_unmap,
            RangeKind::Shared => false,
            RangeKind::CopyOnFork | RangeKind::SkipOnFork => true,
        }
    }
}

/// Physical memory behind a range.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Backing {
    Contiguous(PhysAddr),
    Shards(Vec<Shard>),
}

impl Backing {
    fn frame_at(&self, page: usize) -> Option<PhysAddr> {
        match self {
            Backing::Contiguous(base) => Some(base.add(page * PAGE_SIZE)),
            Backing::Shards(shards) => {
                let mut skipped = 0;
                for shard in shards {
                    if page < skipped + shard.pages {
                        return Some(shard.base.add((page - skipped) * PAGE_SIZE));
                    }
                    skipped += shard.pages;
                }
                None
            }
        }
    }
}

/// One allocated region of a context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Range {
    start: VirtAddr,
    pages: usize,
    access: Access,
    kind: RangeKind,
    backing: Backing,
}

impl Range {
    pub(crate) fn new(start: VirtAddr, pages: usize, access: Access, kind: RangeKind, backing: Backing) -> Self {
        Self { start, pages, access, kind, backing }
    }

    pub fn start(&self) -> VirtAddr {
        self.start
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    /// One past the last byte of the range.
    pub fn end(&self) -> usize {
        self.start.raw() + self.pages * PAGE_SIZE
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn kind(&self) -> RangeKind {
        self.kind
    }

    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    pub fn contains(&self, va: VirtAddr) -> bool {
        va >= self.start && va.raw() < self.end()
    }

    /// Frame backing the `page`-th page of the range.
    pub fn frame_at(&self, page: usize) -> Option<PhysAddr> {
        if page >= self.pages {
            return None;
        }
        self.backing.frame_at(page)
    }
}
