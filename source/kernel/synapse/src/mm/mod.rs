// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Virtual memory allocator (per-context page bitmap + range list over Sv39)
//! OWNERS: @kernel-mm-team
//! PUBLIC API: AddressSpaceManager (create/allocate/free/translate/clone_into/destroy), FrameAllocator
//! DEPENDS_ON: hal::PhysMemory, hal::Cpu, bitflags
//! INVARIANTS: Allocation is all-or-nothing; bitmap bits == union of ranges; kernel context never freed
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

pub mod address_space;
pub mod bitmap;
pub mod frame;
pub mod page_table;
pub mod range;

pub use address_space::{AddressSpace, AddressSpaceError, AddressSpaceManager, AllocRequest, AsHandle, NoCopyPolicy};
pub use frame::{FrameAllocator, Shard};
pub use page_table::{MapError, PageFlags, PageTable, PAGE_SIZE};
pub use range::{Access, Backing, Range, RangeKind};

/// Pages needed to hold `bytes`.
#[inline]
pub const fn pages_for(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE)
}

#[inline]
pub const fn align_up(value: usize) -> usize {
    pages_for(value) * PAGE_SIZE
}

#[inline]
pub const fn align_down(value: usize) -> usize {
    value & !(PAGE_SIZE - 1)
}

#[cfg(test)]
mod tests_prop;
