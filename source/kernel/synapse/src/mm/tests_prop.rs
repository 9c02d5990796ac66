// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Property-based tests for the virtual memory allocator
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCOPE:
//!   - allocate/free symmetry on the context bitmap and range list
//!   - all-or-nothing failure on exhausted windows
//!   - fork cloning of copy-on-fork vs skip-on-fork ranges
//!
//! TEST_SCENARIOS:
//!   - allocate_then_free_restores_bitmap(): bitmap and range list return to their prior content
//!   - oversized_request_leaves_bitmap_untouched(): requests beyond remaining capacity fail without side effect
//!   - clone_copies_contents_and_skips_no_copy_ranges(): byte-identical copies, shared frames for skip-on-fork

use alloc::vec::Vec;

use proptest::prelude::*;

use super::*;
use crate::testing::manager;
use crate::types::VirtAddr;

fn user_rw() -> AllocRequest {
    AllocRequest::new(Access::USER_RW, RangeKind::CopyOnFork)
}

proptest! {
    #[test]
    fn allocate_then_free_restores_bitmap(
        prior in proptest::collection::vec(1usize..8, 0..4),
        pages in 1usize..32,
        fixed in proptest::option::of(0usize..64),
    ) {
        let mut m = manager();
        let ctx = m.create().unwrap();
        for size in prior {
            m.allocate(ctx, size, user_rw()).unwrap();
        }
        let before = m.get(ctx).unwrap().bitmap().clone();
        let ranges_before = m.get(ctx).unwrap().range_count();
        let frames_before = m.free_frames();

        let mut request = user_rw();
        if let Some(page) = fixed {
            request = request.at(VirtAddr::new(PAGE_SIZE + page * PAGE_SIZE).unwrap());
        }
        match m.allocate(ctx, pages, request) {
            Ok(start) => {
                prop_assert_eq!(m.get(ctx).unwrap().range_count(), ranges_before + 1);
                m.free(ctx, start).unwrap();
                prop_assert!(m.get(ctx).unwrap().range_at(start).is_none());
            }
            Err(err) => {
                prop_assert_eq!(err, AddressSpaceError::Overlap);
            }
        }
        prop_assert_eq!(m.get(ctx).unwrap().bitmap(), &before);
        prop_assert_eq!(m.get(ctx).unwrap().range_count(), ranges_before);
        prop_assert_eq!(m.free_frames(), frames_before);
    }

    #[test]
    fn oversized_request_leaves_bitmap_untouched(used in 0usize..64, extra in 1usize..16) {
        let mut m = manager();
        let ctx = m.create().unwrap();
        if used > 0 {
            m.allocate(ctx, used, user_rw()).unwrap();
        }
        let before = m.get(ctx).unwrap().bitmap().words().to_vec();
        let remaining = m.get(ctx).unwrap().bitmap().free();
        prop_assert_eq!(
            m.allocate(ctx, remaining + extra, user_rw()),
            Err(AddressSpaceError::NoVirtualSpace)
        );
        prop_assert_eq!(m.get(ctx).unwrap().bitmap().words(), &before[..]);
    }

    #[test]
    fn clone_copies_contents_and_skips_no_copy_ranges(
        contents in proptest::collection::vec(any::<u8>(), 1..(3 * PAGE_SIZE)),
        shared_pages in 1usize..4,
    ) {
        let mut m = manager();
        let parent = m.create().unwrap();
        let pages = pages_for(contents.len());
        let copied = m.allocate(parent, pages, user_rw().zeroed()).unwrap();
        let skipped = m.allocate(parent, shared_pages, AllocRequest::new(Access::USER_RW, RangeKind::SkipOnFork)).unwrap();
        m.copy_out(parent, copied, &contents).unwrap();

        let child = m.create().unwrap();
        let frames_before = m.free_frames();
        m.clone_into(child, parent, NoCopyPolicy::Share).unwrap();
        prop_assert_eq!(m.free_frames(), frames_before - pages);

        let mut seen = Vec::new();
        seen.resize(contents.len(), 0u8);
        m.copy_in(child, copied, &mut seen).unwrap();
        prop_assert_eq!(&seen, &contents);

        for page in 0..shared_pages {
            let at = skipped.offset(page * PAGE_SIZE).unwrap();
            prop_assert_eq!(
                m.translate(child, at, Access::USER).unwrap(),
                m.translate(parent, at, Access::USER).unwrap()
            );
        }
    }
}
