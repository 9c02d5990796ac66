// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Open-file slots of a task.

use alloc::sync::Arc;

use crate::dev::FileOps;

/// Slots per task.
pub const MAX_FILES: usize = 16;

/// No free slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use]
pub struct TableFull;

/// Fixed-size descriptor table; fork clones the `Arc`s.
#[derive(Clone, Default)]
pub struct FileTable {
    slots: [Option<Arc<dyn FileOps>>; MAX_FILES],
}

impl FileTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `file` in the lowest free slot.
    pub fn install(&mut self, file: Arc<dyn FileOps>) -> Result<usize, TableFull> {
        let fd = self.slots.iter().position(Option::is_none).ok_or(TableFull)?;
        self.slots[fd] = Some(file);
        Ok(fd)
    }

    pub fn get(&self, fd: usize) -> Option<&Arc<dyn FileOps>> {
        self.slots.get(fd).and_then(Option::as_ref)
    }

    /// Empties slot `fd`; false if it was not open.
    pub fn close(&mut self, fd: usize) -> bool {
        match self.slots.get_mut(fd).and_then(Option::take) {
            Some(file) => {
                file.release();
                true
            }
            None => false,
        }
    }

    pub fn close_all(&mut self) {
        for fd in 0..MAX_FILES {
            self.close(fd);
        }
    }

    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    #[derive(Default)]
    struct Counted {
        released: Cell<usize>,
    }

    impl FileOps for Counted {
        fn release(&self) {
            self.released.set(self.released.get() + 1);
        }
    }

    #[test]
    fn lowest_slot_first_and_bounded() {
        let mut table = FileTable::new();
        let file: Arc<dyn FileOps> = Arc::new(Counted::default());
        for expected in 0..MAX_FILES {
            assert_eq!(table.install(Arc::clone(&file)), Ok(expected));
        }
        assert_eq!(table.install(Arc::clone(&file)), Err(TableFull));
        assert!(table.close(3));
        assert!(!table.close(3));
        assert!(!table.close(MAX_FILES + 1));
        assert_eq!(table.install(file), Ok(3));
    }

    #[test]
    fn close_all_releases_each_slot() {
        let file = Arc::new(Counted::default());
        let mut table = FileTable::new();
        table.install(file.clone()).unwrap();
        table.install(file.clone()).unwrap();
        let mut forked = table.clone();
        table.close_all();
        assert_eq!(file.released.get(), 2);
        assert_eq!(table.open_count(), 0);
        assert_eq!(forked.open_count(), 2);
        forked.close_all();
        assert_eq!(file.released.get(), 4);
    }
}
