// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Capability seams for drivers and the VFS layer
//! OWNERS: @kernel-team
//! PUBLIC API: FileOps, IoError, EventId
//! DEPENDS_ON: none
//! INVARIANTS: Operations never block; a stalled operation reports the event that will wake it
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

/// Wakeup channel identifier shared by a driver and the tasks blocked on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EventId(pub u32);

/// Device or file-level I/O failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoError {
    /// No data yet; `Kernel::wake_event` with this id retries the caller.
    WouldBlock(EventId),
    Unsupported,
    Invalid,
    Io,
}

/// Operations behind one open-file slot.
pub trait FileOps {
    fn read(&self, _buf: &mut [u8]) -> Result<usize, IoError> {
        Err(IoError::Unsupported)
    }

    fn write(&self, _data: &[u8]) -> Result<usize, IoError> {
        Err(IoError::Unsupported)
    }

    /// Called each time a slot referring to this file is closed.
    fn release(&self) {}
}
