// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Bounded spin primitives
//! OWNERS: @kernel-sync-team
//! PUBLIC API: TimedLock, LockTimeout, poll_bounded(), PollTimeout
//! DEPENDS_ON: spin::Mutex
//! INVARIANTS: Every wait is bounded; callers receive an error instead of spinning forever
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

mod timed;

pub use timed::{poll_bounded, LockTimeout, PollTimeout, TimedLock, TimedLockGuard};
