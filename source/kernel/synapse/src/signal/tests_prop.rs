// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Property-based tests for signal delivery
//! OWNERS: @kernel-sched-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCOPE:
//!   - Masked catchable signals never change the target, SIGCONT included
//!   - Caught signals block themselves and the handler mask; sigreturn restores the context
//!   - Fault signals the task refuses terminate it
//!
//! TEST_SCENARIOS:
//!   - masked_signal_is_dropped(): any mask containing the signal drops it with no state change
//!   - masked_cont_leaves_stopped_task_stopped(): CONT resumes only once unmasked
//!   - caught_signal_round_trips_through_sigreturn(): frame and mask equal their pre-signal values
//!   - refused_fault_signal_terminates(): masked or ignored SEGV/BUS/ILL/TRAP end the task

use super::{deliver, deliver_fault, sigreturn, Delivery, Disposition, ExitStatus, SigSet, Signal};
use crate::task::TaskState;
use crate::testing::{config, manager, spawn, table};
use crate::trap::reg;
use crate::types::VirtAddr;
use proptest::prelude::*;

fn arb_catchable() -> impl Strategy<Value = Signal> {
    (1usize..32)
        .prop_filter("unblockable", |raw| ![9, 19].contains(raw))
        .prop_map(|raw| Signal::new(raw).unwrap())
}

fn arb_fault() -> impl Strategy<Value = Signal> {
    prop_oneof![Just(Signal::SEGV), Just(Signal::BUS), Just(Signal::ILL), Just(Signal::TRAP)]
}

proptest! {
    #[test]
    fn masked_signal_is_dropped(sig in arb_catchable(), extra in any::<u32>()) {
        let mut spaces = manager();
        let mut tasks = table(&spaces);
        let pid = spawn(&mut tasks, &mut spaces, None);
        let task = tasks.get_mut(pid).unwrap();
        task.signals_mut().replace_mask(SigSet::from_bits(extra).union(SigSet::of(sig)));
        let before = *task.frame();
        let mask = task.signals().mask();

        prop_assert_eq!(deliver(&mut tasks, &mut spaces, pid, sig, config().trampoline_va), Delivery::Dropped);
        let task = tasks.get(pid).unwrap();
        prop_assert_eq!(task.state(), TaskState::Running);
        prop_assert_eq!(*task.frame(), before);
        prop_assert_eq!(task.signals().mask(), mask);
    }

    #[test]
    fn masked_cont_leaves_stopped_task_stopped(extra in any::<u32>()) {
        let mut spaces = manager();
        let mut tasks = table(&spaces);
        let pid = spawn(&mut tasks, &mut spaces, None);
        let trampoline = config().trampoline_va;
        prop_assert_eq!(deliver(&mut tasks, &mut spaces, pid, Signal::STOP, trampoline), Delivery::Stopped);
        tasks.get_mut(pid).unwrap().signals_mut().replace_mask(SigSet::from_bits(extra).union(SigSet::of(Signal::CONT)));

        prop_assert_eq!(deliver(&mut tasks, &mut spaces, pid, Signal::CONT, trampoline), Delivery::Dropped);
        prop_assert_eq!(tasks.state(pid), Some(TaskState::Stopped));

        tasks.get_mut(pid).unwrap().signals_mut().replace_mask(SigSet::EMPTY);
        prop_assert_eq!(deliver(&mut tasks, &mut spaces, pid, Signal::CONT, trampoline), Delivery::Continued);
        prop_assert_eq!(tasks.state(pid), Some(TaskState::Running));
    }

    #[test]
    fn refused_fault_signal_terminates(sig in arb_fault(), ignore in any::<bool>()) {
        let mut spaces = manager();
        let mut tasks = table(&spaces);
        let pid = spawn(&mut tasks, &mut spaces, None);
        let task = tasks.get_mut(pid).unwrap();
        if ignore {
            task.signals_mut().install(sig, Disposition::Ignore).unwrap();
        } else {
            task.signals_mut().replace_mask(SigSet::of(sig));
        }

        prop_assert_eq!(deliver_fault(&mut tasks, &mut spaces, pid, sig, config().trampoline_va), Delivery::Terminated);
        prop_assert_eq!(tasks.state(pid), Some(TaskState::Terminated));
        prop_assert_eq!(tasks.get(pid).unwrap().exit_status(), Some(ExitStatus::signaled(sig)));
    }

    #[test]
    fn caught_signal_round_trips_through_sigreturn(sig in arb_catchable(), handler_mask in any::<u32>(), a0 in any::<usize>()) {
        let mut spaces = manager();
        let mut tasks = table(&spaces);
        let pid = spawn(&mut tasks, &mut spaces, None);
        let entry = VirtAddr::new(0x1_0100).unwrap();
        let task = tasks.get_mut(pid).unwrap();
        task.signals_mut().install(sig, Disposition::Handler { entry, mask: SigSet::from_bits(handler_mask) }).unwrap();
        task.frame_mut().x[reg::A0] = a0;
        let before = *task.frame();
        let mask = task.signals().mask();

        prop_assert_eq!(deliver(&mut tasks, &mut spaces, pid, sig, config().trampoline_va), Delivery::Caught);
        let task = tasks.get_mut(pid).unwrap();
        prop_assert_eq!(task.frame().sepc, config().trampoline_va);
        prop_assert_eq!(task.frame().x[reg::A0], sig.index());
        prop_assert_eq!(task.frame().x[reg::A1], entry.raw());
        prop_assert_eq!(task.frame().sp() % 16, 0);
        prop_assert!(task.signals().mask().contains(sig));
        prop_assert_eq!(task.signals().mask(), mask.union(SigSet::from_bits(handler_mask)).union(SigSet::of(sig)).sanitized());

        sigreturn(task, &spaces).unwrap();
        prop_assert_eq!(*task.frame(), before);
        prop_assert_eq!(task.signals().mask(), mask);
    }
}
