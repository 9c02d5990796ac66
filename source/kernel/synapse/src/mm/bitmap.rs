// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Page bitmap shared by the virtual window allocator and the frame allocator.

use alloc::vec;
use alloc::vec::Vec;

const WORD_BITS: usize = u64::BITS as usize;

/// One bit per page; a set bit marks the page as used.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageBitmap {
    words: Vec<u64>,
    len: usize,
    used: usize,
}

impl PageBitmap {
    /// Creates a bitmap tracking `len` pages, all free.
    pub fn new(len: usize) -> Self {
        Self { words: vec![0; len.div_ceil(WORD_BITS)], len, used: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn free(&self) -> usize {
        self.len - self.used
    }

    /// Raw backing words; exposed so callers can snapshot and compare state.
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    pub fn is_set(&self, index: usize) -> bool {
        index < self.len && self.words[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    /// Lowest index of `count` consecutive free pages (first fit).
    pub fn find_free_run(&self, count: usize) -> Option<usize> {
        if count == 0 || count > self.free() {
            return None;
        }
        let mut run_start = 0;
        let mut run_len = 0;
        let mut index = 0;
        while index < self.len {
            if run_len == 0 && index % WORD_BITS == 0 && self.words[index / WORD_BITS] == u64::MAX {
                index += WORD_BITS;
                continue;
            }
            if self.is_set(index) {
                run_len = 0;
            } else {
                if run_len == 0 {
                    run_start = index;
                }
                run_len += 1;
                if run_len == count {
                    return Some(run_start);
                }
            }
            index += 1;
        }
        None
    }

    /// True when `[start, start + count)` lies inside the bitmap and is entirely free.
    pub fn is_run_free(&self, start: usize, count: usize) -> bool {
        match start.checked_add(count) {
            Some(end) if end <= self.len => (start..end).all(|index| !self.is_set(index)),
            _ => false,
        }
    }

    /// Marks `[start, start + count)` as used.
    ///
    /// Panics if any page in the run is already used: callers reserve only
    /// runs they found free, so a collision means the allocator is corrupt.
    pub fn set_run(&mut self, start: usize, count: usize) {
        for index in start..start + count {
            assert!(!self.is_set(index), "bitmap: page {index} already used");
            self.words[index / WORD_BITS] |= 1 << (index % WORD_BITS);
        }
        self.used += count;
    }

    /// Marks `[start, start + count)` as free.
    pub fn clear_run(&mut self, start: usize, count: usize) {
        for index in start..start + count {
            assert!(self.is_set(index), "bitmap: page {index} freed twice");
            self.words[index / WORD_BITS] &= !(1 << (index % WORD_BITS));
        }
        self.used -= count;
    }
}
