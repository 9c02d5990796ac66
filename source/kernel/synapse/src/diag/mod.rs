// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel diagnostics sinks
//! OWNERS: @kernel-team
//! PUBLIC API: log::KernelLogger, log::init()
//! DEPENDS_ON: hal::Console, sync::TimedLock, log facade
//! INVARIANTS: Emission never blocks unboundedly; one line per record
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

pub mod log;
