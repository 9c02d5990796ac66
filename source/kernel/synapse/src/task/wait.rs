// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Parent/child synchronization: wait and the finish step
//! OWNERS: @kernel-sched-team
//! PUBLIC API: TaskTable::{wait, finish_child}, WaitOutcome
//! DEPENDS_ON: mm::AddressSpaceManager (status copy-out)
//! INVARIANTS: A zombie keeps its pid and status until its parent reaps it
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use super::{BlockReason, ExitStatus, Task, TaskState, TaskTable, WaitError, WaitRequest, WaitTarget};
use crate::mm::AddressSpaceManager;
use crate::syscall::errno::Errno;
use crate::types::{Pid, VirtAddr};

/// Result of a wait that passed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A zombie child was reaped on the spot.
    Reaped { pid: Pid, status: ExitStatus },
    /// WNOHANG and no matching child has exited.
    NotReady,
    /// Caller is now `Waiting`; the finish step or SIGCHLD completes the call.
    Blocked,
}

impl TaskTable {
    /// Waits for a child of `caller`. Validation failures leave every task untouched.
    pub fn wait(
        &mut self,
        caller: Pid,
        target: WaitTarget,
        status: Option<VirtAddr>,
        nohang: bool,
        spaces: &mut AddressSpaceManager,
    ) -> Result<WaitOutcome, WaitError> {
        if target == WaitTarget::Pid(caller) {
            return Err(WaitError::InvalidTarget);
        }
        let waiter = self.get(caller).ok_or(WaitError::NoChildren)?;
        match target {
            WaitTarget::Pid(pid) if !waiter.children.contains(&pid) => return Err(WaitError::NoSuchChild),
            WaitTarget::Any if waiter.children.is_empty() => return Err(WaitError::NoChildren),
            _ => {}
        }
        let space = waiter.space;
        let zombie = waiter
            .children
            .iter()
            .copied()
            .find(|child| target.matches(*child) && self.state(*child) == Some(TaskState::Zombie));

        if let Some(child) = zombie {
            let exit = self.get(child).and_then(Task::exit_status).ok_or(WaitError::NoSuchChild)?;
            if let Some(ptr) = status {
                spaces.copy_out(space, ptr, &exit.raw().to_le_bytes()).map_err(WaitError::Fault)?;
            }
            if let Some(waiter) = self.get_mut(caller) {
                waiter.children.retain(|pid| *pid != child);
            }
            if let Some(task) = self.get_mut(child) {
                task.state = TaskState::Reaped;
            }
            self.remove(child);
            log::debug!(target: "task", "pid {} reaped {} status {:#x}", caller, child, exit.raw());
            return Ok(WaitOutcome::Reaped { pid: child, status: exit });
        }
        if nohang {
            return Ok(WaitOutcome::NotReady);
        }
        if let Some(waiter) = self.get_mut(caller) {
            waiter.block_on(BlockReason::WaitChild(WaitRequest { target, status }));
        }
        Ok(WaitOutcome::Blocked)
    }

    /// Completes a parent's pending wait on `child`. Returns true if the child
    /// was reaped; calling it again for the same child does nothing.
    pub fn finish_child(&mut self, child: Pid, spaces: &mut AddressSpaceManager) -> bool {
        let Some(task) = self.get(child) else {
            return false;
        };
        let (Some(exit), Some(parent)) = (task.exit, task.parent) else {
            return false;
        };
        let released = match task.state {
            TaskState::Terminated => false,
            TaskState::Zombie => true,
            _ => return false,
        };
        let Some(waiter) = self.get(parent) else {
            return false;
        };
        let Some(BlockReason::WaitChild(request)) = waiter.block else {
            return false;
        };
        if !request.target.matches(child) {
            return false;
        }
        let result = match request.status {
            Some(ptr) => spaces
                .copy_out(waiter.space, ptr, &exit.raw().to_le_bytes())
                .map(|()| child.as_raw() as usize)
                .map_err(|_| Errno::EFAULT),
            None => Ok(child.as_raw() as usize),
        };

        if let Some(task) = self.get_mut(child) {
            task.state = TaskState::Reaped;
            task.parent = None;
        }
        if let Some(waiter) = self.get_mut(parent) {
            waiter.children.retain(|pid| *pid != child);
            waiter.complete_syscall(result);
            waiter.unblock();
        }
        if released {
            self.remove(child);
        }
        log::debug!(target: "task", "pid {} woke on child {} status {:#x}", parent, child, exit.raw());
        true
    }
}
