// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Sv39 tables for one context. Intermediate levels are heap pages created on
//! first use; a user root borrows the kernel window's subtrees by slot.

use alloc::{boxed::Box, vec, vec::Vec};
use core::ops::Range;
use core::ptr::{self, NonNull};

use bitflags::bitflags;

use crate::types::PhysAddr;

/// Size of a single page in bytes.
pub const PAGE_SIZE: usize = 4096;
const PT_ENTRIES: usize = 512;
const PPN_SHIFT: usize = 10;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Flags stored in Sv39 page-table entries.
    pub struct PageFlags: usize {
        const VALID = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXECUTE = 1 << 3;
        const USER = 1 << 4;
        const GLOBAL = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY = 1 << 7;
    }
}

const LEAF_PERMS: PageFlags = PageFlags::READ.union(PageFlags::WRITE).union(PageFlags::EXECUTE);

/// Error returned when manipulating page tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    /// Virtual or physical address was not page aligned.
    Unaligned,
    /// Mapping extends beyond the canonical Sv39 range.
    OutOfRange,
    /// Mapping violates the W^X policy.
    PermissionDenied,
    /// Mapping collides with an existing entry.
    Overlap,
    /// Flags do not describe a valid leaf entry.
    InvalidFlags,
    /// No leaf entry exists at the address.
    NotMapped,
}

/// One raw Sv39 entry.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
struct Pte(usize);

impl Pte {
    const EMPTY: Self = Self(0);

    fn leaf(pa: usize, flags: PageFlags) -> Self {
        Self(((pa / PAGE_SIZE) << PPN_SHIFT) | flags.bits())
    }

    fn branch(next: NonNull<TablePage>) -> Self {
        Self(((next.as_ptr() as usize / PAGE_SIZE) << PPN_SHIFT) | PageFlags::VALID.bits())
    }

    fn is_valid(self) -> bool {
        self.0 & PageFlags::VALID.bits() != 0
    }

    fn is_leaf(self) -> bool {
        self.0 & LEAF_PERMS.bits() != 0
    }

    fn target(self) -> usize {
        (self.0 >> PPN_SHIFT) * PAGE_SIZE
    }

    /// Next-level page of a valid branch entry.
    fn next(self) -> Option<NonNull<TablePage>> {
        NonNull::new(self.target() as *mut TablePage)
    }
}

#[repr(align(4096))]
struct TablePage([Pte; PT_ENTRIES]);

/// Three-level Sv39 page table.
pub struct PageTable {
    root: NonNull<TablePage>,
    owned: Vec<NonNull<TablePage>>,
}

impl PageTable {
    pub fn new() -> Self {
        let root = fresh_page();
        Self { root, owned: vec![root] }
    }

    /// Physical page number of the root, as SATP wants it.
    pub fn root_ppn(&self) -> usize {
        self.root.as_ptr() as usize / PAGE_SIZE
    }

    pub fn root_addr(&self) -> PhysAddr {
        PhysAddr::new(self.root.as_ptr() as usize)
    }

    /// Raw leaf entry mapped at the page-aligned `va`.
    pub fn lookup(&self, va: usize) -> Option<usize> {
        if va % PAGE_SIZE != 0 {
            return None;
        }
        let slot = self.existing_slot(va).ok()?;
        // SAFETY: `existing_slot` points into a live page of this table.
        let pte = unsafe { *slot };
        (pte.is_valid() && pte.is_leaf()).then_some(pte.0)
    }

    /// Installs a 4 KiB mapping from `va` to `pa`.
    pub fn map(&mut self, va: usize, pa: usize, flags: PageFlags) -> Result<(), MapError> {
        if va % PAGE_SIZE != 0 || pa % PAGE_SIZE != 0 {
            return Err(MapError::Unaligned);
        }
        check_canonical(va)?;
        if flags.intersection(LEAF_PERMS).is_empty() || !flags.contains(PageFlags::VALID) {
            return Err(MapError::InvalidFlags);
        }
        if flags.contains(PageFlags::WRITE | PageFlags::EXECUTE) {
            return Err(MapError::PermissionDenied);
        }
        let slot = self.slot_creating(va)?;
        if slot.is_valid() {
            return Err(MapError::Overlap);
        }
        *slot = Pte::leaf(pa, flags);
        Ok(())
    }

    /// Clears the leaf at `va` and returns the frame it pointed at.
    pub fn unmap(&mut self, va: usize) -> Result<PhysAddr, MapError> {
        if va % PAGE_SIZE != 0 {
            return Err(MapError::Unaligned);
        }
        let slot = self.existing_slot(va)?;
        // SAFETY: `existing_slot` points into a live page of this table and
        // `&mut self` excludes other access to it.
        let pte = unsafe { &mut *slot };
        if !pte.is_valid() || !pte.is_leaf() {
            return Err(MapError::NotMapped);
        }
        let frame = pte.target();
        *pte = Pte::EMPTY;
        Ok(PhysAddr::new(frame))
    }

    /// Builds the intermediate levels covering `va` without mapping it.
    pub fn prepare(&mut self, va: usize) -> Result<(), MapError> {
        self.slot_creating(va & !(PAGE_SIZE - 1)).map(|_| ())
    }

    /// Copies every populated root slot of `kernel` outside `user_slots`.
    ///
    /// The linked subtrees stay owned by `kernel`; this table never frees them.
    pub fn link_kernel(&mut self, kernel: &PageTable, user_slots: Range<usize>) {
        // SAFETY: both roots are live pages owned by their tables.
        let (dst, src) = unsafe { (&mut (*self.root.as_ptr()).0, &(*kernel.root.as_ptr()).0) };
        for (slot, (to, from)) in dst.iter_mut().zip(src.iter()).enumerate() {
            if !user_slots.contains(&slot) && from.is_valid() {
                *to = *from;
            }
        }
    }

    /// Leaf slot for `va` when both upper levels already exist.
    fn existing_slot(&self, va: usize) -> Result<*mut Pte, MapError> {
        check_canonical(va)?;
        let [top, mid, leaf] = vpn_indices(va);
        let mut table = self.root;
        for index in [top, mid] {
            // SAFETY: `table` is the root or a page reached through a branch
            // entry installed by `slot_creating` (here or in a linked kernel table).
            let pte = unsafe { (*table.as_ptr()).0[index] };
            if !pte.is_valid() || pte.is_leaf() {
                return Err(MapError::NotMapped);
            }
            table = pte.next().ok_or(MapError::NotMapped)?;
        }
        // SAFETY: `table` is a live last-level page.
        Ok(unsafe { ptr::addr_of_mut!((*table.as_ptr()).0[leaf]) })
    }

    fn slot_creating(&mut self, va: usize) -> Result<&mut Pte, MapError> {
        check_canonical(va)?;
        let [top, mid, leaf] = vpn_indices(va);
        let mut table = self.root;
        for index in [top, mid] {
            // SAFETY: see `existing_slot`.
            let pte = unsafe { &mut (*table.as_ptr()).0[index] };
            if pte.is_valid() {
                if pte.is_leaf() {
                    return Err(MapError::Overlap);
                }
                table = pte.next().ok_or(MapError::OutOfRange)?;
                continue;
            }
            let next = fresh_page();
            self.owned.push(next);
            *pte = Pte::branch(next);
            table = next;
        }
        // SAFETY: `table` is a live last-level page.
        Ok(unsafe { &mut (*table.as_ptr()).0[leaf] })
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PageTable {
    fn drop(&mut self) {
        for page in self.owned.drain(..) {
            // SAFETY: every pointer came from `fresh_page` and is freed once.
            unsafe { drop(Box::from_raw(page.as_ptr())) };
        }
    }
}

fn fresh_page() -> NonNull<TablePage> {
    NonNull::from(Box::leak(Box::new(TablePage([Pte::EMPTY; PT_ENTRIES]))))
}

fn check_canonical(va: usize) -> Result<(), MapError> {
    if is_canonical_sv39(va) {
        Ok(())
    } else {
        Err(MapError::OutOfRange)
    }
}

/// Root slot covering `va`.
pub fn root_slot(va: usize) -> usize {
    (va >> 30) & 0x1ff
}

/// Root-first VPN indices for `va`.
fn vpn_indices(va: usize) -> [usize; 3] {
    [(va >> 30) & 0x1ff, (va >> 21) & 0x1ff, (va >> 12) & 0x1ff]
}

/// Bits 63..39 must all copy bit 38.
pub fn is_canonical_sv39(va: usize) -> bool {
    let upper = va >> 38;
    upper == 0 || upper == usize::MAX >> 38
}
