// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Address-space contexts: page bitmap, range list and Sv39 root per context
//! OWNERS: @kernel-mm-team
//! PUBLIC API: AddressSpaceManager, AddressSpace, AsHandle, AllocRequest, NoCopyPolicy, AddressSpaceError
//! DEPENDS_ON: mm::FrameAllocator, hal::PhysMemory, hal::Cpu
//! INVARIANTS: Allocation is all-or-nothing; a context has at most one owner;
//!             a frame returns to the pool only when no range maps it
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use alloc::{boxed::Box, collections::BTreeMap, vec::Vec};
use core::num::NonZeroU32;

use super::bitmap::PageBitmap;
use super::frame::FrameAllocator;
use super::page_table::{root_slot, MapError, PageTable, PAGE_SIZE};
use super::range::{Access, Backing, Range, RangeKind};
use crate::config::Config;
use crate::hal::{Cpu, PhysMemory};
use crate::types::{PhysAddr, Pid, VirtAddr};

/// Maximum ASIDs made available by the allocator.
const MAX_ASIDS: usize = 256;
const WORD_BITS: usize = core::mem::size_of::<u64>() * 8;
const BITMAP_WORDS: usize = MAX_ASIDS.div_ceil(WORD_BITS);
/// Span covered by one last-level table.
const LEAF_TABLE_SPAN: usize = 512 * PAGE_SIZE;

/// Handle referencing a tracked address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AsHandle(NonZeroU32);

impl AsHandle {
    /// Creates a handle from the backing table index.
    fn from_index(index: usize) -> Self {
        // SAFETY: index is offset by one, ensuring the raw value is never zero.
        unsafe { Self(NonZeroU32::new_unchecked(index as u32 + 1)) }
    }

    /// Returns the table index backing this handle.
    fn index(self) -> usize {
        self.0.get() as usize - 1
    }

    /// Constructs a handle from a raw value.
    pub fn from_raw(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    /// Returns the raw representation of the handle.
    pub fn to_raw(self) -> u32 {
        self.0.get()
    }
}

/// Errors reported while managing address spaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use]
pub enum AddressSpaceError {
    /// Provided handle was not recognised.
    InvalidHandle,
    /// No more ASIDs are available.
    AsidExhausted,
    /// Address space is attached to another task.
    InUse,
    /// The kernel context cannot be destroyed or cloned into.
    KernelSpace,
    /// The frame allocator cannot back the request.
    OutOfMemory,
    /// No free run of virtual pages is large enough.
    NoVirtualSpace,
    /// Requested pages collide with an existing range.
    Overlap,
    /// Address lies outside the context's window.
    OutOfRange,
    /// No range covers the address.
    NotMapped,
    /// The range does not grant the requested access.
    PermissionDenied,
    /// Arguments supplied by the caller were invalid.
    InvalidArgs,
    /// Underlying map operation failed.
    Mapping(MapError),
}

impl From<MapError> for AddressSpaceError {
    fn from(value: MapError) -> Self {
        match value {
            MapError::Overlap => Self::Overlap,
            MapError::PermissionDenied => Self::PermissionDenied,
            other => Self::Mapping(other),
        }
    }
}

/// How fork maps `SkipOnFork` ranges into the child.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoCopyPolicy {
    /// Same frames, same access.
    Share,
    /// Same frames, write access dropped.
    ShareReadOnly,
}

/// Parameters of one allocation; builder style.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocRequest {
    pub at: Option<VirtAddr>,
    pub phys: Option<PhysAddr>,
    pub access: Access,
    pub kind: RangeKind,
    pub zero: bool,
}

impl AllocRequest {
    pub const fn new(access: Access, kind: RangeKind) -> Self {
        Self { at: None, phys: None, access, kind, zero: false }
    }

    pub const fn at(mut self, va: VirtAddr) -> Self {
        self.at = Some(va);
        self
    }

    pub const fn backed_by(mut self, pa: PhysAddr) -> Self {
        self.phys = Some(pa);
        self
    }

    pub const fn zeroed(mut self) -> Self {
        self.zero = true;
        self
    }
}

/// Tracks the state of a single Sv39 address space.
pub struct AddressSpace {
    page_table: PageTable,
    asid: u16,
    base: VirtAddr,
    used: PageBitmap,
    ranges: BTreeMap<usize, Range>,
    kernel: bool,
    owner: Option<Pid>,
}

impl AddressSpace {
    fn new(page_table: PageTable, asid: u16, base: VirtAddr, pages: usize, kernel: bool) -> Self {
        Self { page_table, asid, base, used: PageBitmap::new(pages), ranges: BTreeMap::new(), kernel, owner: None }
    }

    /// Returns the hardware ASID backing this address space.
    pub fn asid(&self) -> u16 {
        self.asid
    }

    /// Borrows the page table for read-only inspection.
    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    /// Returns the SATP value describing this address space.
    pub fn satp_value(&self) -> usize {
        const MODE_SV39: usize = 8;
        let mode = MODE_SV39 << 60;
        let asid = (self.asid as usize) << 44;
        let ppn = self.page_table.root_ppn();
        mode | asid | ppn
    }

    pub fn base(&self) -> VirtAddr {
        self.base
    }

    pub fn bitmap(&self) -> &PageBitmap {
        &self.used
    }

    pub fn ranges(&self) -> impl Iterator<Item = &Range> {
        self.ranges.values()
    }

    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_kernel(&self) -> bool {
        self.kernel
    }

    pub fn owner(&self) -> Option<Pid> {
        self.owner
    }

    /// Range covering `va`, if any.
    pub fn range_at(&self, va: VirtAddr) -> Option<&Range> {
        self.ranges.range(..=va.raw()).next_back().map(|(_, range)| range).filter(|range| range.contains(va))
    }

    /// Window end (exclusive).
    pub fn end(&self) -> usize {
        self.base.raw() + self.used.len() * PAGE_SIZE
    }

    fn page_index(&self, va: VirtAddr) -> Option<usize> {
        if va < self.base || va.raw() >= self.end() {
            return None;
        }
        Some((va.raw() - self.base.raw()) / PAGE_SIZE)
    }

    fn page_addr(&self, index: usize) -> VirtAddr {
        VirtAddr::new_unchecked(self.base.raw() + index * PAGE_SIZE)
    }
}

/// Manages every context, the kernel singleton and the frame pool behind them.
pub struct AddressSpaceManager {
    spaces: Vec<Option<AddressSpace>>,
    asids: AsidAllocator,
    frames: FrameAllocator,
    memory: Box<dyn PhysMemory>,
    kernel: AsHandle,
    user_base: VirtAddr,
    user_pages: usize,
    trampoline: Option<PhysAddr>,
    holders: ShareCounts,
}

impl AddressSpaceManager {
    /// Builds the manager and its kernel context.
    pub fn new(
        config: &Config,
        frames: FrameAllocator,
        memory: Box<dyn PhysMemory>,
    ) -> Result<Self, AddressSpaceError> {
        let user_base = VirtAddr::page_aligned(config.user_base).ok_or(AddressSpaceError::InvalidArgs)?;
        let kernel_base = VirtAddr::page_aligned(config.kernel_base).ok_or(AddressSpaceError::InvalidArgs)?;
        if config.user_top <= config.user_base || VirtAddr::page_aligned(config.user_top).is_none() {
            return Err(AddressSpaceError::InvalidArgs);
        }
        VirtAddr::new(kernel_base.raw() + config.kernel_pages * PAGE_SIZE - 1).ok_or(AddressSpaceError::InvalidArgs)?;

        let mut table = PageTable::new();
        // Pre-build the kernel window's tables so user roots that link them
        // observe kernel stacks allocated later.
        let mut va = kernel_base.raw();
        while va < kernel_base.raw() + config.kernel_pages * PAGE_SIZE {
            table.prepare(va)?;
            va += LEAF_TABLE_SPAN;
        }
        #[cfg(all(target_arch = "riscv64", target_os = "none"))]
        map_kernel_image(&mut table, &frames)?;

        let kernel = AddressSpace::new(table, 0, kernel_base, config.kernel_pages, true);
        log::info!(
            target: "vm",
            "kernel context {:#x}+{} pages, user window {:#x}..{:#x}, {} frames",
            kernel_base,
            config.kernel_pages,
            config.user_base,
            config.user_top,
            frames.total_frames()
        );
        Ok(Self {
            spaces: alloc::vec![Some(kernel)],
            asids: AsidAllocator::new(),
            frames,
            memory,
            kernel: AsHandle::from_index(0),
            user_base,
            user_pages: config.user_pages(),
            trampoline: None,
            holders: ShareCounts::default(),
        })
    }

    /// The shared kernel context.
    pub fn kernel(&self) -> AsHandle {
        self.kernel
    }

    pub fn free_frames(&self) -> usize {
        self.frames.free_frames()
    }

    /// Creates an empty user context.
    pub fn create(&mut self) -> Result<AsHandle, AddressSpaceError> {
        let asid = self.asids.allocate().ok_or(AddressSpaceError::AsidExhausted)?;
        let mut table = PageTable::new();
        let first_slot = root_slot(self.user_base.raw());
        let last_slot = root_slot(self.user_base.raw() + self.user_pages * PAGE_SIZE - 1);
        table.link_kernel(self.get(self.kernel)?.page_table(), first_slot..last_slot + 1);
        let space = AddressSpace::new(table, asid, self.user_base, self.user_pages, false);

        let handle = match self.spaces.iter().position(Option::is_none) {
            Some(index) => {
                self.spaces[index] = Some(space);
                AsHandle::from_index(index)
            }
            None => {
                self.spaces.push(Some(space));
                AsHandle::from_index(self.spaces.len() - 1)
            }
        };
        log::debug!(target: "vm", "create context {} asid {}", handle.to_raw(), asid);
        Ok(handle)
    }

    /// Returns a shared reference to the address space identified by `handle`.
    pub fn get(&self, handle: AsHandle) -> Result<&AddressSpace, AddressSpaceError> {
        self.spaces.get(handle.index()).and_then(|slot| slot.as_ref()).ok_or(AddressSpaceError::InvalidHandle)
    }

    /// Returns a mutable reference to the address space identified by `handle`.
    pub fn get_mut(&mut self, handle: AsHandle) -> Result<&mut AddressSpace, AddressSpaceError> {
        self.spaces.get_mut(handle.index()).and_then(|slot| slot.as_mut()).ok_or(AddressSpaceError::InvalidHandle)
    }

    /// Binds `handle` to `pid`; a user context has at most one owner.
    pub fn attach(&mut self, handle: AsHandle, pid: Pid) -> Result<(), AddressSpaceError> {
        let space = self.get_mut(handle)?;
        if space.kernel {
            return Ok(());
        }
        match space.owner {
            None => {
                space.owner = Some(pid);
                Ok(())
            }
            Some(owner) if owner == pid => Ok(()),
            Some(_) => Err(AddressSpaceError::InUse),
        }
    }

    pub fn detach(&mut self, handle: AsHandle, pid: Pid) -> Result<(), AddressSpaceError> {
        let space = self.get_mut(handle)?;
        if space.owner == Some(pid) {
            space.owner = None;
        }
        Ok(())
    }

    /// Frees every range of an unowned user context and retires its ASID.
    pub fn destroy(&mut self, handle: AsHandle) -> Result<(), AddressSpaceError> {
        if handle == self.kernel {
            return Err(AddressSpaceError::KernelSpace);
        }
        if self.get(handle)?.owner.is_some() {
            return Err(AddressSpaceError::InUse);
        }
        let Some(mut space) = self.spaces[handle.index()].take() else {
            return Err(AddressSpaceError::InvalidHandle);
        };
        let starts: Vec<usize> = space.ranges.keys().copied().collect();
        for start in starts {
            free_in(&mut space, &mut self.frames, &mut self.holders, VirtAddr::new_unchecked(start))?;
        }
        self.asids.free(space.asid);
        log::debug!(target: "vm", "destroy context {} asid {}", handle.to_raw(), space.asid);
        Ok(())
    }

    /// Switches the currently running hardware context to `handle`.
    pub fn activate(&self, handle: AsHandle, cpu: &dyn Cpu) -> Result<(), AddressSpaceError> {
        let space = self.get(handle)?;
        cpu.activate(space.page_table.root_addr(), space.asid);
        Ok(())
    }

    /// Allocates `pages` pages in `handle`; all-or-nothing.
    pub fn allocate(
        &mut self,
        handle: AsHandle,
        pages: usize,
        request: AllocRequest,
    ) -> Result<VirtAddr, AddressSpaceError> {
        let Self { spaces, frames, memory, .. } = self;
        let space = spaces.get_mut(handle.index()).and_then(Option::as_mut).ok_or(AddressSpaceError::InvalidHandle)?;
        let start = allocate_in(space, frames, &mut **memory, pages, &request, None)?;
        log::trace!(target: "vm", "alloc ctx {} {:#x}+{} {:?}", handle.to_raw(), start, pages, request.kind);
        Ok(start)
    }

    /// Frees the range starting exactly at `start`.
    pub fn free(&mut self, handle: AsHandle, start: VirtAddr) -> Result<(), AddressSpaceError> {
        let Self { spaces, frames, holders, .. } = self;
        let space = spaces.get_mut(handle.index()).and_then(Option::as_mut).ok_or(AddressSpaceError::InvalidHandle)?;
        free_in(space, frames, holders, start).map(|_| ())
    }

    /// Resolves `va` to a physical address if the covering range grants `want`.
    pub fn translate(&self, handle: AsHandle, va: VirtAddr, want: Access) -> Result<PhysAddr, AddressSpaceError> {
        let space = self.get(handle)?;
        let range = space.range_at(va).ok_or(AddressSpaceError::NotMapped)?;
        if !range.access().contains(want) {
            return Err(AddressSpaceError::PermissionDenied);
        }
        let page = (va.raw() - range.start().raw()) / PAGE_SIZE;
        let frame = range.frame_at(page).ok_or(AddressSpaceError::NotMapped)?;
        Ok(frame.add(va.page_offset()))
    }

    /// Copies out of the context into `buf`. Fails without copying if any page is unreachable.
    pub fn copy_in(&self, handle: AsHandle, va: VirtAddr, buf: &mut [u8]) -> Result<(), AddressSpaceError> {
        let want = self.user_access(handle, Access::empty())?;
        let chunks = self.resolve_span(handle, va, buf.len(), want)?;
        let mut done = 0;
        for (pa, len) in chunks {
            self.memory.read(pa, &mut buf[done..done + len]);
            done += len;
        }
        Ok(())
    }

    /// Copies `data` into the context. Fails without writing if any page is unreachable or read-only.
    pub fn copy_out(&mut self, handle: AsHandle, va: VirtAddr, data: &[u8]) -> Result<(), AddressSpaceError> {
        let want = self.user_access(handle, Access::WRITE)?;
        let chunks = self.resolve_span(handle, va, data.len(), want)?;
        let mut done = 0;
        for (pa, len) in chunks {
            self.memory.write(pa, &data[done..done + len]);
            done += len;
        }
        Ok(())
    }

    /// Checks that `len` bytes at `va` are reachable with `want` (plus USER for user contexts).
    pub fn check_access(&self, handle: AsHandle, va: VirtAddr, len: usize, want: Access) -> Result<(), AddressSpaceError> {
        let want = self.user_access(handle, want)?;
        self.resolve_span(handle, va, len, want).map(|_| ())
    }

    /// Reads a NUL-terminated string of at most `max` bytes (terminator excluded).
    pub fn copy_in_cstr(&self, handle: AsHandle, va: VirtAddr, max: usize) -> Result<Vec<u8>, AddressSpaceError> {
        let mut out = Vec::new();
        let mut cursor = va;
        loop {
            let chunk = PAGE_SIZE - cursor.page_offset();
            let mut page = alloc::vec![0u8; chunk];
            self.copy_in(handle, cursor, &mut page)?;
            if let Some(nul) = page.iter().position(|byte| *byte == 0) {
                out.extend_from_slice(&page[..nul]);
                return if out.len() > max { Err(AddressSpaceError::InvalidArgs) } else { Ok(out) };
            }
            out.extend_from_slice(&page);
            if out.len() > max {
                return Err(AddressSpaceError::InvalidArgs);
            }
            cursor = cursor.offset(chunk).ok_or(AddressSpaceError::OutOfRange)?;
        }
    }

    pub fn read_word(&self, handle: AsHandle, va: VirtAddr) -> Result<usize, AddressSpaceError> {
        let mut raw = [0u8; core::mem::size_of::<usize>()];
        self.copy_in(handle, va, &mut raw)?;
        Ok(usize::from_le_bytes(raw))
    }

    /// Duplicates the inheritable ranges of `src` into the empty user context `dest`.
    ///
    /// `CopyOnFork` ranges get fresh frames holding a byte copy. `SkipOnFork`
    /// and `Shared` ranges map the source frames as `Shared`; frames inherited
    /// from a `SkipOnFork` range return to the pool when their last mapping is
    /// freed. `Owned` ranges are not inherited. On failure every range cloned
    /// so far is freed.
    pub fn clone_into(&mut self, dest: AsHandle, src: AsHandle, policy: NoCopyPolicy) -> Result<(), AddressSpaceError> {
        if dest == src {
            return Err(AddressSpaceError::InvalidArgs);
        }
        if dest == self.kernel {
            return Err(AddressSpaceError::KernelSpace);
        }
        let mut dest_space = self
            .spaces
            .get_mut(dest.index())
            .and_then(Option::take)
            .ok_or(AddressSpaceError::InvalidHandle)?;
        let result = self.clone_ranges(&mut dest_space, src, policy);
        self.spaces[dest.index()] = Some(dest_space);
        result
    }

    fn clone_ranges(
        &mut self,
        dest: &mut AddressSpace,
        src: AsHandle,
        policy: NoCopyPolicy,
    ) -> Result<(), AddressSpaceError> {
        let Self { spaces, frames, memory, holders, .. } = self;
        let source = spaces.get(src.index()).and_then(Option::as_ref).ok_or(AddressSpaceError::InvalidHandle)?;
        let mut cloned = Vec::new();
        for range in source.ranges.values() {
            let outcome = match range.kind() {
                RangeKind::Owned { .. } => continue,
                RangeKind::CopyOnFork => {
                    let request = AllocRequest::new(range.access(), RangeKind::CopyOnFork).at(range.start());
                    allocate_in(dest, frames, &mut **memory, range.pages(), &request, None).map(|start| {
                        if let Some(copy) = dest.ranges.get(&start.raw()) {
                            for page in 0..range.pages() {
                                if let (Some(to), Some(from)) = (copy.frame_at(page), range.frame_at(page)) {
                                    memory.copy(to, from, PAGE_SIZE);
                                }
                            }
                        }
                        start
                    })
                }
                RangeKind::SkipOnFork | RangeKind::Shared => {
                    let mut access = range.access();
                    if range.kind() == RangeKind::SkipOnFork && policy == NoCopyPolicy::ShareReadOnly {
                        access.remove(Access::WRITE);
                    }
                    let request = AllocRequest::new(access, RangeKind::Shared).at(range.start());
                    let start =
                        allocate_in(dest, frames, &mut **memory, range.pages(), &request, Some(range.backing().clone()));
                    if start.is_ok() {
                        holders.share(range);
                    }
                    start
                }
            };
            match outcome {
                Ok(start) => cloned.push(start),
                Err(err) => {
                    for start in cloned {
                        free_in(dest, frames, holders, start)?;
                    }
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Allocates the shared trampoline frame and fills it with `code`.
    pub fn install_trampoline(&mut self, code: &[u8]) -> Result<PhysAddr, AddressSpaceError> {
        if code.len() > PAGE_SIZE || self.trampoline.is_some() {
            return Err(AddressSpaceError::InvalidArgs);
        }
        let frame = self.frames.allocate_contiguous(1).ok_or(AddressSpaceError::OutOfMemory)?;
        self.memory.fill(frame, PAGE_SIZE, 0);
        self.memory.write(frame, code);
        self.trampoline = Some(frame);
        Ok(frame)
    }

    /// Maps the trampoline frame read/execute into a user context at `va`.
    pub fn map_trampoline(&mut self, handle: AsHandle, va: VirtAddr) -> Result<VirtAddr, AddressSpaceError> {
        let frame = self.trampoline.ok_or(AddressSpaceError::NotMapped)?;
        self.allocate(handle, 1, AllocRequest::new(Access::USER_RX, RangeKind::Shared).at(va).backed_by(frame))
    }

    fn user_access(&self, handle: AsHandle, extra: Access) -> Result<Access, AddressSpaceError> {
        let space = self.get(handle)?;
        Ok(if space.kernel { extra } else { extra | Access::USER })
    }

    fn resolve_span(
        &self,
        handle: AsHandle,
        va: VirtAddr,
        len: usize,
        want: Access,
    ) -> Result<Vec<(PhysAddr, usize)>, AddressSpaceError> {
        let mut chunks = Vec::new();
        let mut done = 0;
        while done < len {
            let cursor = va.offset(done).ok_or(AddressSpaceError::OutOfRange)?;
            let chunk = (PAGE_SIZE - cursor.page_offset()).min(len - done);
            chunks.push((self.translate(handle, cursor, want)?, chunk));
            done += chunk;
        }
        Ok(chunks)
    }
}

fn allocate_in(
    space: &mut AddressSpace,
    frames: &mut FrameAllocator,
    memory: &mut dyn PhysMemory,
    pages: usize,
    request: &AllocRequest,
    inherited: Option<Backing>,
) -> Result<VirtAddr, AddressSpaceError> {
    if pages == 0 {
        return Err(AddressSpaceError::InvalidArgs);
    }
    if request.access.contains(Access::WRITE | Access::EXECUTE) {
        return Err(AddressSpaceError::PermissionDenied);
    }
    let first = match request.at {
        Some(va) => {
            if !va.is_page_aligned() {
                return Err(AddressSpaceError::InvalidArgs);
            }
            let index = space.page_index(va).ok_or(AddressSpaceError::OutOfRange)?;
            if index + pages > space.used.len() {
                return Err(AddressSpaceError::OutOfRange);
            }
            if !space.used.is_run_free(index, pages) {
                return Err(AddressSpaceError::Overlap);
            }
            index
        }
        None => space.used.find_free_run(pages).ok_or(AddressSpaceError::NoVirtualSpace)?,
    };

    let (backing, fresh) = match (inherited, request.phys) {
        (Some(backing), _) => (backing, false),
        (None, Some(pa)) => {
            if request.kind.releases_frames() || !pa.is_page_aligned() {
                return Err(AddressSpaceError::InvalidArgs);
            }
            (Backing::Contiguous(pa), false)
        }
        (None, None) => {
            let mut shards = frames.allocate_shards(pages).ok_or(AddressSpaceError::OutOfMemory)?;
            let backing = if shards.len() == 1 {
                Backing::Contiguous(shards.remove(0).base)
            } else {
                Backing::Shards(shards)
            };
            (backing, true)
        }
    };

    let start = space.page_addr(first);
    let range = Range::new(start, pages, request.access, request.kind, backing);
    let flags = request.access.page_flags();
    for page in 0..pages {
        let mapped = range
            .frame_at(page)
            .ok_or(AddressSpaceError::InvalidArgs)
            .and_then(|pa| Ok(space.page_table.map(start.raw() + page * PAGE_SIZE, pa.raw(), flags)?));
        if let Err(err) = mapped {
            for undo in 0..page {
                let _ = space.page_table.unmap(start.raw() + undo * PAGE_SIZE);
            }
            if fresh {
                release_frames(frames, &range);
            }
            return Err(err);
        }
    }
    if request.zero {
        for page in 0..pages {
            if let Some(pa) = range.frame_at(page) {
                memory.fill(pa, PAGE_SIZE, 0);
            }
        }
    }
    space.used.set_run(first, pages);
    space.ranges.insert(start.raw(), range);
    Ok(start)
}

fn free_in(
    space: &mut AddressSpace,
    frames: &mut FrameAllocator,
    holders: &mut ShareCounts,
    start: VirtAddr,
) -> Result<Range, AddressSpaceError> {
    let range = space.ranges.remove(&start.raw()).ok_or(AddressSpaceError::NotMapped)?;
    for page in 0..range.pages() {
        let va = range.start().raw() + page * PAGE_SIZE;
        if let Err(err) = space.page_table.unmap(va) {
            panic!("vm: range {:#x} lost its mapping at {:#x}: {:?}", range.start(), va, err);
        }
    }
    match space.page_index(range.start()) {
        Some(first) => space.used.clear_run(first, range.pages()),
        None => panic!("vm: range {:#x} outside its context window", range.start()),
    }
    if holders.drop_holder(&range).unwrap_or(range.kind().releases_frames()) {
        release_frames(frames, &range);
    }
    Ok(range)
}

/// Live mappings of frames inherited from `SkipOnFork` ranges, keyed by first frame.
#[derive(Default)]
struct ShareCounts(BTreeMap<usize, usize>);

impl ShareCounts {
    /// Records one more mapping of `range`'s frames. Untracked `Shared`
    /// backings (devices, the trampoline) stay untracked.
    fn share(&mut self, range: &Range) {
        let Some(key) = range.frame_at(0).map(PhysAddr::raw) else {
            return;
        };
        match self.0.get_mut(&key) {
            Some(count) => *count += 1,
            None if range.kind() == RangeKind::SkipOnFork => {
                self.0.insert(key, 2);
            }
            None => {}
        }
    }

    /// `Some(true)` when the freed range held the last mapping of tracked
    /// frames, `Some(false)` while others remain, `None` if untracked.
    fn drop_holder(&mut self, range: &Range) -> Option<bool> {
        let key = range.frame_at(0)?.raw();
        let count = self.0.get_mut(&key)?;
        *count -= 1;
        if *count > 0 {
            return Some(false);
        }
        self.0.remove(&key);
        Some(true)
    }
}

fn release_frames(frames: &mut FrameAllocator, range: &Range) {
    match range.backing() {
        Backing::Contiguous(base) => frames.release(*base, range.pages()),
        Backing::Shards(shards) => {
            for shard in shards {
                frames.release(shard.base, shard.pages);
            }
        }
    }
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
fn map_kernel_image(table: &mut PageTable, frames: &FrameAllocator) -> Result<(), MapError> {
    use super::page_table::PageFlags;

    extern "C" {
        static __text_start: u8;
        static __text_end: u8;
        static __kernel_end: u8;
    }

    // SAFETY: linker-provided symbols; only their addresses are used.
    let (text_start, text_end, kernel_end) = unsafe {
        (
            align_down(&__text_start as *const u8 as usize),
            align_up(&__text_end as *const u8 as usize),
            align_up(&__kernel_end as *const u8 as usize),
        )
    };
    let text = PageFlags::VALID | PageFlags::READ | PageFlags::EXECUTE | PageFlags::GLOBAL;
    let data = PageFlags::VALID | PageFlags::READ | PageFlags::WRITE | PageFlags::GLOBAL;
    map_identity(table, text_start, text_end, text)?;
    map_identity(table, text_end, kernel_end, data)?;
    let pool_start = frames.base().raw().max(kernel_end);
    let pool_end = frames.base().raw() + frames.total_frames() * PAGE_SIZE;
    map_identity(table, pool_start, pool_end, data)
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
fn map_identity(
    table: &mut PageTable,
    start: usize,
    end: usize,
    flags: super::page_table::PageFlags,
) -> Result<(), MapError> {
    let mut pa = start;
    while pa < end {
        match table.map(pa, pa, flags) {
            Ok(()) | Err(MapError::Overlap) => {}
            Err(err) => return Err(err),
        }
        pa += PAGE_SIZE;
    }
    Ok(())
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
const fn align_down(value: usize) -> usize {
    value & !(PAGE_SIZE - 1)
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
const fn align_up(value: usize) -> usize {
    (value + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

struct AsidAllocator {
    bitmap: [u64; BITMAP_WORDS],
    next: usize,
}

impl AsidAllocator {
    const fn new() -> Self {
        let mut bitmap = [0u64; BITMAP_WORDS];
        // Reserve ASID 0 for the kernel/global mappings.
        bitmap[0] |= 1;
        Self { bitmap, next: 1 }
    }

    fn allocate(&mut self) -> Option<u16> {
        for _ in 0..MAX_ASIDS {
            let index = self.next % MAX_ASIDS;
            let word = index / WORD_BITS;
            let bit = index % WORD_BITS;
            self.next = (index + 1) % MAX_ASIDS;
            if self.bitmap[word] & (1 << bit) == 0 {
                self.bitmap[word] |= 1 << bit;
                return Some(index as u16);
            }
        }
        None
    }

    fn free(&mut self, asid: u16) {
        let index = asid as usize;
        if index != 0 && index < MAX_ASIDS {
            self.bitmap[index / WORD_BITS] &= !(1 << (index % WORD_BITS));
        }
    }
}
