// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Address and identity newtypes shared by every subsystem
//! OWNERS: @kernel-team
//! PUBLIC API: VirtAddr, PhysAddr, Pid
//! DEPENDS_ON: mm::page_table::is_canonical_sv39, mm::PAGE_SIZE
//! INVARIANTS: VirtAddr is always canonical Sv39; Pid 0 is the bootstrap/idle task
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use crate::mm::{page_table::is_canonical_sv39, PAGE_SIZE};
use core::fmt;

/// Canonical Sv39 virtual address.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtAddr(usize);

impl VirtAddr {
    #[inline]
    pub fn new(addr: usize) -> Option<Self> {
        if is_canonical_sv39(addr) {
            Some(Self(addr))
        } else {
            None
        }
    }

    #[inline]
    pub fn page_aligned(addr: usize) -> Option<Self> {
        Self::new(addr).filter(|va| va.0 % PAGE_SIZE == 0)
    }

    /// Builds an address the caller already validated (window arithmetic).
    #[inline]
    pub(crate) const fn new_unchecked(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub fn checked_add(self, v: usize) -> Option<usize> {
        self.0.checked_add(v)
    }

    /// Returns `self + bytes` if the result is still canonical.
    #[inline]
    pub fn offset(self, bytes: usize) -> Option<Self> {
        self.checked_add(bytes).and_then(Self::new)
    }

    #[inline]
    pub const fn align_down(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }
}

impl fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Physical address as seen by the frame allocator.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysAddr(usize);

impl PhysAddr {
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn add(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }
}

impl fmt::LowerHex for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Task identifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(u32);

impl Pid {
    /// Bootstrap task; doubles as the idle task.
    pub const KERNEL: Self = Self(0);
    /// Adopts orphaned children.
    pub const INIT: Self = Self(1);

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }
}

impl From<Pid> for u32 {
    fn from(value: Pid) -> Self {
        value.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_canonical_addresses() {
        assert!(VirtAddr::new(0x4000_0000).is_some());
        assert!(VirtAddr::new(0x0000_0040_0000_0000).is_none());
        assert!(VirtAddr::new(0xffff_ffc0_0000_0000).is_some());
    }

    #[test]
    fn page_helpers() {
        let va = VirtAddr::new(0x1234_5678).unwrap();
        assert_eq!(va.align_down().raw(), 0x1234_5000);
        assert_eq!(va.page_offset(), 0x678);
        assert!(VirtAddr::page_aligned(0x1234_5678).is_none());
        assert!(VirtAddr::page_aligned(0x1234_5000).is_some());
    }
}
