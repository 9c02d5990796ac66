// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel global allocator for bare-metal images
//! OWNERS: @kernel-mm-team
//! PUBLIC API: init()
//! DEPENDS_ON: linked_list_allocator::Heap, spin::Mutex
//! INVARIANTS: init() runs once before the first allocation; the region is never handed to the frame allocator
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};

use linked_list_allocator::Heap;
use spin::Mutex;

struct KernelHeap(Mutex<Heap>);

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.0.lock().allocate_first_fit(layout).map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            // SAFETY: `ptr` came from `alloc` with the same layout.
            unsafe { self.0.lock().deallocate(ptr, layout) };
        }
    }
}

#[global_allocator]
static HEAP: KernelHeap = KernelHeap(Mutex::new(Heap::empty()));

/// Hands `[start, start + size)` to the kernel heap.
///
/// # Safety
/// The region must be unused RAM, valid for the kernel's lifetime, and this
/// must be called once.
pub unsafe fn init(start: *mut u8, size: usize) {
    // SAFETY: forwarded from the caller.
    unsafe { HEAP.0.lock().init(start, size) };
    log::info!(target: "vm", "kernel heap {:#x}+{:#x}", start as usize, size);
}
