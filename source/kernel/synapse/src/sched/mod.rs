// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Round-robin scheduler over the task table
//! OWNERS: @kernel-sched-team
//! PUBLIC API: Scheduler (new/enqueue/select/current), EnqueueOutcome, EnqueueRejectReason
//! DEPENDS_ON: task::TaskTable (states, end-of-life, retired resources), mm::AddressSpaceManager
//! INVARIANTS: Bounded queue capacity + deterministic reject on saturation; pid 0 only when nothing
//!             else is runnable; each of N runnable tasks is picked within N selections
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

#[cfg(test)]
mod tests_prop;

use alloc::collections::VecDeque;
use core::marker::PhantomData;

use crate::config::Config;
use crate::mm::AddressSpaceManager;
use crate::task::{BlockReason, TaskState, TaskTable};
use crate::types::Pid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueRejectReason {
    QueueFull { capacity: usize },
    Duplicate,
    /// Pid 0 runs only as the fallback and is never queued.
    IdleTask,
}

#[must_use = "enqueue outcomes must be handled"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    Rejected(EnqueueRejectReason),
}

impl EnqueueOutcome {
    pub const fn is_enqueued(self) -> bool {
        matches!(self, Self::Enqueued)
    }
}

/// Single-hart round-robin scheduler.
///
/// The queue is a ring: the pick moves to the back, so the next walk starts
/// at the slot after it. Blocked and stopped entries keep their place and
/// are skipped until they become runnable again.
pub struct Scheduler {
    queue: VecDeque<Pid>,
    capacity: usize,
    current: Pid,
    // Single-hart contract: the scheduler never crosses thread boundaries.
    _not_send_sync: PhantomData<*mut ()>,
}
static_assertions::assert_not_impl_any!(Scheduler: Send, Sync);

impl Scheduler {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity),
            capacity,
            current: Pid::KERNEL,
            _not_send_sync: PhantomData,
        }
    }

    /// Task whose frame was last resumed.
    pub fn current(&self) -> Pid {
        self.current
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.queue.contains(&pid)
    }

    pub fn enqueue(&mut self, pid: Pid) -> EnqueueOutcome {
        if pid == Pid::KERNEL {
            return EnqueueOutcome::Rejected(EnqueueRejectReason::IdleTask);
        }
        if self.queue.contains(&pid) {
            return EnqueueOutcome::Rejected(EnqueueRejectReason::Duplicate);
        }
        if self.queue.len() >= self.capacity {
            return EnqueueOutcome::Rejected(EnqueueRejectReason::QueueFull { capacity: self.capacity });
        }
        self.queue.push_back(pid);
        EnqueueOutcome::Enqueued
    }

    /// One scheduling pass at trap `trap_seq`; returns the task to resume.
    pub fn select(
        &mut self,
        tasks: &mut TaskTable,
        spaces: &mut AddressSpaceManager,
        config: &Config,
        now: u64,
        trap_seq: u64,
    ) -> Pid {
        tasks.release_retired(spaces, trap_seq);

        let pids = tasks.pids();
        for pid in &pids {
            if tasks.state(*pid) == Some(TaskState::Terminated) {
                tasks.end_of_life(*pid, spaces, config, self.current, trap_seq);
            }
        }
        for pid in pids {
            let Some(task) = tasks.get_mut(pid) else {
                continue;
            };
            if let Some(BlockReason::Sleep { deadline }) = task.block_reason() {
                if deadline <= now {
                    task.complete_syscall(Ok(0));
                    task.unblock();
                }
            }
        }

        self.queue.retain(|pid| {
            tasks
                .state(*pid)
                .is_some_and(|state| !matches!(state, TaskState::Zombie | TaskState::Reaped | TaskState::Replaced))
        });

        let next = self
            .queue
            .iter()
            .position(|pid| tasks.state(*pid).is_some_and(TaskState::is_runnable))
            .and_then(|index| self.queue.remove(index));
        self.current = match next {
            Some(pid) => {
                self.queue.push_back(pid);
                pid
            }
            None => Pid::KERNEL,
        };
        log::trace!(target: "sched", "select pid {} (queue {})", self.current, self.queue.len());
        self.current
    }
}
