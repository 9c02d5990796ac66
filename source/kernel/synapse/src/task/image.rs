// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Program image loading seam and the initial argv/envp stack layout.

use alloc::vec::Vec;

use crate::mm::{AddressSpaceError, AddressSpaceManager, AsHandle};
use crate::types::VirtAddr;

const WORD: usize = core::mem::size_of::<usize>();
const STACK_ALIGN: usize = 16;

/// Result of mapping a program image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoadedImage {
    pub entry: VirtAddr,
    /// First byte past the highest loaded segment; the heap starts at the next page.
    pub end: VirtAddr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use]
pub enum LoadError {
    NotFound,
    Malformed,
    AddressSpace(AddressSpaceError),
}

impl From<AddressSpaceError> for LoadError {
    fn from(value: AddressSpaceError) -> Self {
        Self::AddressSpace(value)
    }
}

/// Maps an executable into a fresh context (ELF parsing lives behind this).
pub trait ImageLoader {
    fn load(&self, path: &[u8], spaces: &mut AddressSpaceManager, space: AsHandle)
        -> Result<LoadedImage, LoadError>;
}

/// Register values for a process entry after the arguments were pushed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StackLayout {
    pub sp: usize,
    pub argc: usize,
    pub argv: usize,
    pub envp: usize,
}

/// Copies the strings below `top`, then the NULL-terminated pointer arrays, 16-byte aligned.
pub fn push_args(
    spaces: &mut AddressSpaceManager,
    space: AsHandle,
    top: usize,
    argv: &[Vec<u8>],
    envp: &[Vec<u8>],
) -> Result<StackLayout, AddressSpaceError> {
    let mut cursor = top;
    let mut push_string = |spaces: &mut AddressSpaceManager, bytes: &[u8]| {
        cursor = cursor.checked_sub(bytes.len() + 1).ok_or(AddressSpaceError::OutOfRange)?;
        let at = VirtAddr::new(cursor).ok_or(AddressSpaceError::OutOfRange)?;
        spaces.copy_out(space, at, bytes)?;
        let nul = at.offset(bytes.len()).ok_or(AddressSpaceError::OutOfRange)?;
        spaces.copy_out(space, nul, &[0])?;
        Ok::<usize, AddressSpaceError>(cursor)
    };
    let mut words = Vec::with_capacity(argv.len() + envp.len() + 2);
    for arg in argv {
        words.push(push_string(spaces, arg)?);
    }
    words.push(0);
    for var in envp {
        words.push(push_string(spaces, var)?);
    }
    words.push(0);

    let table_bytes = words.len() * WORD;
    let base = cursor.checked_sub(table_bytes).ok_or(AddressSpaceError::OutOfRange)? & !(STACK_ALIGN - 1);
    let mut table = Vec::with_capacity(table_bytes);
    for word in &words {
        table.extend_from_slice(&word.to_le_bytes());
    }
    spaces.copy_out(space, VirtAddr::new(base).ok_or(AddressSpaceError::OutOfRange)?, &table)?;
    Ok(StackLayout { sp: base, argc: argv.len(), argv: base, envp: base + (argv.len() + 1) * WORD })
}
