// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Synapse kernel core: tasks, address spaces, signals and trap dispatch for one RISC-V hart
//! OWNERS: @kernel-team
//! STATUS: Functional
//! PUBLIC API: kernel::Kernel, mm::AddressSpaceManager, task::TaskTable, sched::Scheduler, syscall::SyscallTable
//! DEPENDS_ON: hal (Cpu/PhysMemory/Console seams), log facade
//! INVARIANTS: No hidden global kernel state; every subsystem is reached through Kernel
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), forbid(clippy::unwrap_used))]

extern crate alloc;

pub mod config;
pub mod dev;
pub mod diag;
pub mod hal;
pub mod kernel;
pub mod mm;
pub mod sched;
pub mod signal;
pub mod sync;
pub mod syscall;
pub mod task;
pub mod trap;
pub mod types;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub mod heap;
#[cfg(all(target_arch = "riscv64", target_os = "none", feature = "panic_handler"))]
mod panic;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use kernel::{Kernel, KernelError};
pub use types::{Pid, PhysAddr, VirtAddr};
