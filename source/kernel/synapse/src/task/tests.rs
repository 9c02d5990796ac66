// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Unit tests for task creation, fork, exec, end-of-life and wait
//! OWNERS: @kernel-sched-team
//! NOTE: Tests only; verify parent links, deferred release, re-parenting, status delivery

use super::*;
use crate::mm::Access;
use crate::signal::{Disposition, SigSet, Signal};
use crate::testing::{args, config, manager, spawn, table, StubLoader, IMAGE_BASE};

fn status_slot(tasks: &TaskTable, pid: Pid) -> VirtAddr {
    // Just below the argument block, inside the initial stack.
    VirtAddr::new(tasks.get(pid).unwrap().frame().sp() - 64).unwrap()
}

fn read_status(spaces: &AddressSpaceManager, tasks: &TaskTable, pid: Pid, at: VirtAddr) -> u32 {
    let mut raw = [0u8; 4];
    spaces.copy_in(tasks.get(pid).unwrap().space(), at, &mut raw).unwrap();
    u32::from_le_bytes(raw)
}

#[test]
fn bootstrap_task_is_pid_zero_in_kernel_context() {
    let spaces = manager();
    let tasks = table(&spaces);
    let boot = tasks.get(Pid::KERNEL).unwrap();
    assert_eq!(boot.space(), spaces.kernel());
    assert!(boot.kernel_stack().is_none());
    assert_eq!(tasks.len(), 1);
}

#[test]
fn create_lays_out_entry_and_arguments() {
    let mut spaces = manager();
    let mut tasks = table(&spaces);
    let argv = args(&["sh", "-c"]);
    let envp = args(&["HOME=/"]);
    let pid = tasks
        .create(None, Credentials::ROOT, b"/bin/sh", &argv, &envp, &config(), &StubLoader, &mut spaces)
        .unwrap();
    assert_eq!(pid, Pid::INIT);

    let task = tasks.get(pid).unwrap();
    let frame = task.frame();
    assert_eq!(frame.sepc, IMAGE_BASE);
    assert!(frame.from_user());
    assert_eq!(frame.x[reg::A0], 2);
    assert_eq!(frame.sp() % 16, 0);
    let first = spaces.read_word(task.space(), VirtAddr::new(frame.x[reg::A1]).unwrap()).unwrap();
    assert_eq!(spaces.copy_in_cstr(task.space(), VirtAddr::new(first).unwrap(), 64).unwrap(), b"sh");
    let env = spaces.read_word(task.space(), VirtAddr::new(frame.x[reg::A2]).unwrap()).unwrap();
    assert_eq!(spaces.copy_in_cstr(task.space(), VirtAddr::new(env).unwrap(), 64).unwrap(), b"HOME=/");

    assert_eq!(task.memory().pages_of(RegionKind::Stack), config().stack_initial_pages);
    assert_eq!(task.memory().pages_of(RegionKind::Trampoline), 1);
    assert!(spaces.translate(task.space(), VirtAddr::new(config().trampoline_va).unwrap(), Access::USER_RX).is_ok());
    assert_eq!(task.argv(), argv.as_slice());
}

#[test]
fn failed_load_leaves_no_task_or_frames_behind() {
    let mut spaces = manager();
    let mut tasks = table(&spaces);
    let free = spaces.free_frames();
    let err = tasks
        .create(None, Credentials::ROOT, b"missing", &[], &[], &config(), &StubLoader, &mut spaces)
        .unwrap_err();
    assert_eq!(err, SpawnError::Load(LoadError::NotFound));
    assert_eq!(tasks.len(), 1);
    assert_eq!(spaces.free_frames(), free);
}

#[test]
fn create_under_dead_parent_is_rejected() {
    let mut spaces = manager();
    let mut tasks = table(&spaces);
    let parent = spawn(&mut tasks, &mut spaces, None);
    tasks.exit(parent, 0);
    let err = tasks
        .create(Some(parent), Credentials::ROOT, b"/bin/x", &[], &[], &config(), &StubLoader, &mut spaces)
        .unwrap_err();
    assert_eq!(err, SpawnError::InvalidParent);
}

#[test]
fn table_full_is_reported() {
    let mut spaces = manager();
    let mut tasks = TaskTable::new(spaces.kernel(), 3);
    spawn(&mut tasks, &mut spaces, None);
    spawn(&mut tasks, &mut spaces, None);
    let err = tasks
        .create(None, Credentials::ROOT, b"/bin/x", &[], &[], &config(), &StubLoader, &mut spaces)
        .unwrap_err();
    assert_eq!(err, SpawnError::TableFull);
}

#[test]
fn fork_copies_memory_and_returns_zero_in_child() {
    let mut spaces = manager();
    let mut tasks = table(&spaces);
    let parent = spawn(&mut tasks, &mut spaces, None);
    let slot = status_slot(&tasks, parent);
    let parent_space = tasks.get(parent).unwrap().space();
    spaces.copy_out(parent_space, slot, b"marker").unwrap();
    tasks.get_mut(parent).unwrap().frame_mut().x[reg::A0] = 99;
    let sepc = tasks.get(parent).unwrap().frame().sepc;

    let child = tasks.fork(parent, &config(), &mut spaces).unwrap();
    let task = tasks.get(child).unwrap();
    assert_eq!(task.parent(), Some(parent));
    assert_eq!(task.frame().x[reg::A0], 0);
    assert_eq!(task.frame().sepc, sepc + 4);
    assert_ne!(task.space(), parent_space);
    assert_eq!(task.memory().regions(), tasks.get(parent).unwrap().memory().regions());

    let mut copied = [0u8; 6];
    spaces.copy_in(task.space(), slot, &mut copied).unwrap();
    assert_eq!(&copied, b"marker");
    spaces.copy_out(task.space(), slot, b"child!").unwrap();
    spaces.copy_in(parent_space, slot, &mut copied).unwrap();
    assert_eq!(&copied, b"marker");
    assert_eq!(tasks.get(parent).unwrap().children(), &[child]);
}

#[test]
fn fork_inherits_handlers_and_mask() {
    let mut spaces = manager();
    let mut tasks = table(&spaces);
    let parent = spawn(&mut tasks, &mut spaces, None);
    let handler = Disposition::Handler { entry: VirtAddr::new(IMAGE_BASE).unwrap(), mask: SigSet::EMPTY };
    let signals = tasks.get_mut(parent).unwrap().signals_mut();
    signals.install(Signal::USR1, handler).unwrap();
    signals.set_mask(crate::signal::MaskHow::Block, SigSet::of(Signal::USR2));

    let child = tasks.fork(parent, &config(), &mut spaces).unwrap();
    assert_eq!(tasks.get(child).unwrap().signals(), tasks.get(parent).unwrap().signals());
}

#[test]
fn bootstrap_task_cannot_fork() {
    let mut spaces = manager();
    let mut tasks = table(&spaces);
    assert_eq!(tasks.fork(Pid::KERNEL, &config(), &mut spaces), Err(SpawnError::Bootstrap));
}

#[test]
fn exec_keeps_identity_and_retires_old_context() {
    let mut spaces = manager();
    let mut tasks = table(&spaces);
    let parent = spawn(&mut tasks, &mut spaces, None);
    let pid = spawn(&mut tasks, &mut spaces, Some(parent));
    let old_space = tasks.get(pid).unwrap().space();
    let handler = Disposition::Handler { entry: VirtAddr::new(IMAGE_BASE).unwrap(), mask: SigSet::EMPTY };
    tasks.get_mut(pid).unwrap().signals_mut().install(Signal::USR1, handler).unwrap();
    tasks.get_mut(pid).unwrap().signals_mut().install(Signal::USR2, Disposition::Ignore).unwrap();

    let argv = args(&["ls", "-l"]);
    tasks.exec(pid, b"/bin/ls", &argv, &[], &config(), &StubLoader, &mut spaces, 7).unwrap();
    let task = tasks.get(pid).unwrap();
    assert_eq!(task.parent(), Some(parent));
    assert_ne!(task.space(), old_space);
    assert_eq!(task.frame().x[reg::A0], 2);
    assert_eq!(task.signals().disposition(Signal::USR1), Disposition::Default);
    assert_eq!(task.signals().disposition(Signal::USR2), Disposition::Ignore);
    assert_eq!(tasks.retired_count(), 1);
    assert!(spaces.get(old_space).is_ok());

    tasks.release_retired(&mut spaces, 7);
    assert_eq!(tasks.retired_count(), 1);
    tasks.release_retired(&mut spaces, 8);
    assert_eq!(tasks.retired_count(), 0);
    assert!(spaces.get(old_space).is_err());
}

#[test]
fn failed_exec_leaves_caller_untouched() {
    let mut spaces = manager();
    let mut tasks = table(&spaces);
    let pid = spawn(&mut tasks, &mut spaces, None);
    let before = *tasks.get(pid).unwrap().frame();
    let space = tasks.get(pid).unwrap().space();
    let err = tasks.exec(pid, b"missing/ls", &[], &[], &config(), &StubLoader, &mut spaces, 1).unwrap_err();
    assert_eq!(err, SpawnError::Load(LoadError::NotFound));
    assert_eq!(*tasks.get(pid).unwrap().frame(), before);
    assert_eq!(tasks.get(pid).unwrap().space(), space);
    assert_eq!(tasks.retired_count(), 0);
}

#[test]
fn terminate_ignores_dead_and_bootstrap_tasks() {
    let mut spaces = manager();
    let mut tasks = table(&spaces);
    let pid = spawn(&mut tasks, &mut spaces, None);
    assert!(!tasks.terminate(Pid::KERNEL, ExitStatus::exited(1)));
    assert!(tasks.exit(pid, 3));
    assert!(!tasks.exit(pid, 4));
    assert_eq!(tasks.get(pid).unwrap().exit_status().and_then(|s| s.code()), Some(3));
}

#[test]
fn orphan_end_of_life_releases_everything() {
    let mut spaces = manager();
    let mut tasks = table(&spaces);
    let free = spaces.free_frames();
    let pid = spawn(&mut tasks, &mut spaces, None);
    tasks.exit(pid, 0);
    tasks.end_of_life(pid, &mut spaces, &config(), Pid::KERNEL, 1);
    assert!(!tasks.contains(pid));
    assert_eq!(tasks.retired_count(), 0);
    assert_eq!(spaces.free_frames(), free);
}

#[test]
fn current_task_release_is_deferred() {
    let mut spaces = manager();
    let mut tasks = table(&spaces);
    let free = spaces.free_frames();
    let pid = spawn(&mut tasks, &mut spaces, None);
    tasks.exit(pid, 0);
    tasks.end_of_life(pid, &mut spaces, &config(), pid, 5);
    assert_eq!(tasks.retired_count(), 1);
    assert!(spaces.free_frames() < free);
    tasks.release_retired(&mut spaces, 6);
    assert_eq!(spaces.free_frames(), free);
}

#[test]
fn exited_child_becomes_zombie_until_waited() {
    let mut spaces = manager();
    let mut tasks = table(&spaces);
    let parent = spawn(&mut tasks, &mut spaces, None);
    let child = spawn(&mut tasks, &mut spaces, Some(parent));
    tasks.exit(child, 42);
    tasks.end_of_life(child, &mut spaces, &config(), Pid::KERNEL, 1);
    assert_eq!(tasks.state(child), Some(TaskState::Zombie));

    let slot = status_slot(&tasks, parent);
    let outcome = tasks.wait(parent, WaitTarget::Any, Some(slot), false, &mut spaces).unwrap();
    assert_eq!(outcome, WaitOutcome::Reaped { pid: child, status: ExitStatus::exited(42) });
    assert_eq!(read_status(&spaces, &tasks, parent, slot), ExitStatus::exited(42).raw());
    assert!(!tasks.contains(child));
    assert!(tasks.get(parent).unwrap().children().is_empty());
}

#[test]
fn blocked_parent_is_completed_by_child_exit() {
    let mut spaces = manager();
    let mut tasks = table(&spaces);
    let parent = spawn(&mut tasks, &mut spaces, None);
    let child = spawn(&mut tasks, &mut spaces, Some(parent));
    let slot = status_slot(&tasks, parent);

    let outcome = tasks.wait(parent, WaitTarget::Pid(child), Some(slot), false, &mut spaces).unwrap();
    assert_eq!(outcome, WaitOutcome::Blocked);
    assert_eq!(tasks.state(parent), Some(TaskState::Waiting));

    tasks.terminate(child, ExitStatus::signaled(Signal::TERM));
    tasks.end_of_life(child, &mut spaces, &config(), Pid::KERNEL, 1);
    let waiter = tasks.get(parent).unwrap();
    assert_eq!(waiter.state(), TaskState::Running);
    assert_eq!(waiter.frame().x[reg::A0], child.as_raw() as usize);
    assert_eq!(waiter.errno(), None);
    assert!(!tasks.contains(child));
    assert_eq!(read_status(&spaces, &tasks, parent, slot), ExitStatus::signaled(Signal::TERM).raw());
}

#[test]
fn finish_step_is_idempotent() {
    let mut spaces = manager();
    let mut tasks = table(&spaces);
    let parent = spawn(&mut tasks, &mut spaces, None);
    let child = spawn(&mut tasks, &mut spaces, Some(parent));
    tasks.wait(parent, WaitTarget::Any, None, false, &mut spaces).unwrap();
    tasks.exit(child, 1);
    assert!(tasks.finish_child(child, &mut spaces));
    assert!(!tasks.finish_child(child, &mut spaces));
    assert_eq!(tasks.get(parent).unwrap().frame().x[reg::A0], child.as_raw() as usize);
}

#[test]
fn wait_validation_leaves_tasks_untouched() {
    let mut spaces = manager();
    let mut tasks = table(&spaces);
    let parent = spawn(&mut tasks, &mut spaces, None);
    let stranger = spawn(&mut tasks, &mut spaces, None);
    assert_eq!(tasks.wait(parent, WaitTarget::Any, None, false, &mut spaces), Err(WaitError::NoChildren));
    assert_eq!(tasks.wait(parent, WaitTarget::Pid(parent), None, false, &mut spaces), Err(WaitError::InvalidTarget));
    assert_eq!(tasks.wait(parent, WaitTarget::Pid(stranger), None, false, &mut spaces), Err(WaitError::NoSuchChild));
    assert_eq!(tasks.state(parent), Some(TaskState::Running));

    spawn(&mut tasks, &mut spaces, Some(parent));
    assert_eq!(tasks.wait(parent, WaitTarget::Any, None, true, &mut spaces), Ok(WaitOutcome::NotReady));
    assert_eq!(tasks.state(parent), Some(TaskState::Running));
}

#[test]
fn unwritable_status_keeps_zombie() {
    let mut spaces = manager();
    let mut tasks = table(&spaces);
    let parent = spawn(&mut tasks, &mut spaces, None);
    let child = spawn(&mut tasks, &mut spaces, Some(parent));
    tasks.exit(child, 0);
    tasks.end_of_life(child, &mut spaces, &config(), Pid::KERNEL, 1);
    let unmapped = VirtAddr::new(0x4000_0000).unwrap();
    let result = tasks.wait(parent, WaitTarget::Any, Some(unmapped), false, &mut spaces);
    assert!(matches!(result, Err(WaitError::Fault(_))));
    assert_eq!(tasks.state(child), Some(TaskState::Zombie));
}

#[test]
fn children_of_dead_task_move_to_init() {
    let mut spaces = manager();
    let mut tasks = table(&spaces);
    let init = spawn(&mut tasks, &mut spaces, None);
    let middle = spawn(&mut tasks, &mut spaces, Some(init));
    let running = spawn(&mut tasks, &mut spaces, Some(middle));
    let zombie = spawn(&mut tasks, &mut spaces, Some(middle));
    tasks.exit(zombie, 5);
    tasks.end_of_life(zombie, &mut spaces, &config(), Pid::KERNEL, 1);
    assert_eq!(tasks.state(zombie), Some(TaskState::Zombie));

    tasks.wait(init, WaitTarget::Any, None, false, &mut spaces).unwrap();
    tasks.exit(middle, 0);
    tasks.end_of_life(middle, &mut spaces, &config(), Pid::KERNEL, 2);

    assert_eq!(tasks.get(running).unwrap().parent(), Some(init));
    assert!(tasks.get(init).unwrap().children().contains(&running));
    assert!(!tasks.contains(middle));
    // init's pending wait consumed `middle`; the adopted zombie waits for the next one.
    assert_eq!(tasks.state(zombie), Some(TaskState::Zombie));
    assert_eq!(tasks.get(zombie).unwrap().parent(), Some(init));
    assert_eq!(
        tasks.wait(init, WaitTarget::Pid(zombie), None, true, &mut spaces),
        Ok(WaitOutcome::Reaped { pid: zombie, status: ExitStatus::exited(5) })
    );
}

#[test]
fn waiting_on_other_child_is_interrupted_by_sigchld() {
    let mut spaces = manager();
    let mut tasks = table(&spaces);
    let parent = spawn(&mut tasks, &mut spaces, None);
    let first = spawn(&mut tasks, &mut spaces, Some(parent));
    let second = spawn(&mut tasks, &mut spaces, Some(parent));
    tasks.wait(parent, WaitTarget::Pid(first), None, false, &mut spaces).unwrap();
    tasks.exit(second, 0);
    tasks.end_of_life(second, &mut spaces, &config(), Pid::KERNEL, 1);

    let waiter = tasks.get(parent).unwrap();
    assert_eq!(waiter.state(), TaskState::Running);
    assert_eq!(waiter.errno(), Some(Errno::EINTR));
    assert_eq!(tasks.state(second), Some(TaskState::Zombie));
}

#[test]
fn discard_unlinks_from_parent() {
    let mut spaces = manager();
    let mut tasks = table(&spaces);
    let parent = spawn(&mut tasks, &mut spaces, None);
    let free = spaces.free_frames();
    let child = tasks.fork(parent, &config(), &mut spaces).unwrap();
    tasks.discard(child, &mut spaces);
    assert!(!tasks.contains(child));
    assert!(tasks.get(parent).unwrap().children().is_empty());
    assert_eq!(spaces.free_frames(), free);
}

#[test]
fn pids_are_reused_lowest_first() {
    let mut spaces = manager();
    let mut tasks = table(&spaces);
    let a = spawn(&mut tasks, &mut spaces, None);
    let b = spawn(&mut tasks, &mut spaces, None);
    tasks.exit(a, 0);
    tasks.end_of_life(a, &mut spaces, &config(), Pid::KERNEL, 1);
    assert_eq!(spawn(&mut tasks, &mut spaces, None), a);
    assert_ne!(a, b);
}
