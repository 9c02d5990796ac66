// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Tunables for scheduling, address-space layout and stack growth
//! OWNERS: @kernel-team
//! PUBLIC API: Config::new(), Config::with_*()
//! DEPENDS_ON: mm::PAGE_SIZE, trap::Vector
//! INVARIANTS: Defaults stable across boots; windows page aligned and canonical
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md
//!
//! The kernel runs both on the host (unit tests) and inside QEMU. Every
//! knob the core consumes lives here so fixtures can shrink windows and
//! periods without touching subsystem code.

use crate::mm::{NoCopyPolicy, PAGE_SIZE};
use crate::trap::Vector;

const DEFAULT_TICK_NS: u64 = 1_000_000; // 1 ms slice

/// Kernel-wide configuration, copied into each subsystem at construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// Timer quantum in nanoseconds.
    pub tick_ns: u64,
    /// Ticks between forced scheduler passes (round-robin preemption).
    pub preempt_period: u64,
    /// Vector raised by the timer.
    pub timer_vector: Vector,
    /// Bound on run-queue entries.
    pub run_queue_capacity: usize,
    /// Bound on live plus zombie descriptors, bootstrap task included.
    pub max_tasks: usize,
    /// First byte of every user window; page 0 stays unmapped.
    pub user_base: usize,
    /// One past the last byte of every user window; the stack grows down from here.
    pub user_top: usize,
    /// Base of the kernel window that hosts kernel stacks.
    pub kernel_base: usize,
    pub kernel_pages: usize,
    /// Fixed address of the signal trampoline page in user windows.
    pub trampoline_va: usize,
    pub kernel_stack_pages: usize,
    pub stack_initial_pages: usize,
    /// Hard limit on user stack size.
    pub stack_limit_pages: usize,
    pub stack_growth_min_pages: usize,
    pub stack_growth_headroom_pages: usize,
    /// Spin bound for `TimedLock` acquisitions.
    pub lock_timeout_spins: u32,
    pub max_args: usize,
    pub max_arg_len: usize,
    /// How fork maps `SkipOnFork` ranges into the child.
    pub fork_policy: NoCopyPolicy,
}

impl Config {
    pub const fn new() -> Self {
        Self {
            tick_ns: DEFAULT_TICK_NS,
            preempt_period: 10,
            timer_vector: Vector::SUPERVISOR_TIMER,
            run_queue_capacity: 64,
            max_tasks: 256,
            user_base: PAGE_SIZE,
            user_top: 0x4000_0000,
            kernel_base: 0xffff_ffd0_0000_0000,
            kernel_pages: 4096,
            trampoline_va: PAGE_SIZE,
            kernel_stack_pages: 4,
            stack_initial_pages: 4,
            stack_limit_pages: 512,
            stack_growth_min_pages: 2,
            stack_growth_headroom_pages: 1,
            lock_timeout_spins: 1 << 16,
            max_args: 64,
            max_arg_len: 4096,
            fork_policy: NoCopyPolicy::Share,
        }
    }

    pub const fn with_preempt_period(mut self, ticks: u64) -> Self {
        self.preempt_period = ticks;
        self
    }

    pub const fn with_user_window(mut self, base: usize, top: usize) -> Self {
        self.user_base = base;
        self.user_top = top;
        self
    }

    pub const fn with_run_queue_capacity(mut self, capacity: usize) -> Self {
        self.run_queue_capacity = capacity;
        self
    }

    pub const fn with_max_tasks(mut self, tasks: usize) -> Self {
        self.max_tasks = tasks;
        self
    }

    pub const fn with_stack_limit(mut self, pages: usize) -> Self {
        self.stack_limit_pages = pages;
        self
    }

    pub const fn user_pages(&self) -> usize {
        (self.user_top - self.user_base) / PAGE_SIZE
    }

    /// Lowest address the user stack may ever grow down to.
    pub const fn stack_limit_floor(&self) -> usize {
        self.user_top - self.stack_limit_pages * PAGE_SIZE
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_describe_sane_layout() {
        let config = Config::new();
        assert_eq!(config.user_top % PAGE_SIZE, 0);
        assert!(config.trampoline_va >= config.user_base);
        assert!(config.stack_limit_floor() > config.trampoline_va);
        assert_eq!(config.stack_limit_pages, 512);
        assert_eq!(config.stack_growth_min_pages, 2);
    }

    #[test]
    fn builders_override_fields() {
        let config = Config::new().with_preempt_period(3).with_user_window(0x1000, 0x10_0000);
        assert_eq!(config.preempt_period, 3);
        assert_eq!(config.user_pages(), 255);
    }
}
