// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Property-based tests for round-robin selection
//! OWNERS: @kernel-sched-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCOPE:
//!   - fairness among runnable tasks with blocked tasks interleaved
//!   - idle fallback when every queued task is blocked
//!
//! TEST_SCENARIOS:
//!   - every_runnable_task_is_picked_within_n_selections(): N consecutive picks cover all N runnable tasks
//!   - idle_only_when_all_blocked(): pid 0 is chosen iff no queued task can run

use alloc::collections::BTreeSet;
use alloc::vec::Vec;

use proptest::prelude::*;

use super::Scheduler;
use crate::task::BlockReason;
use crate::testing::{config, manager, spawn, table};
use crate::types::Pid;

proptest! {
    #[test]
    fn every_runnable_task_is_picked_within_n_selections(blocked in proptest::collection::vec(any::<bool>(), 1..12), rounds in 1usize..4) {
        let mut spaces = manager();
        let mut tasks = table(&spaces);
        let mut sched = Scheduler::new(32);
        let mut runnable = BTreeSet::new();
        for is_blocked in &blocked {
            let pid = spawn(&mut tasks, &mut spaces, None);
            prop_assert!(sched.enqueue(pid).is_enqueued());
            if *is_blocked {
                tasks.get_mut(pid).unwrap().block_on(BlockReason::Sleep { deadline: u64::MAX });
            } else {
                runnable.insert(pid);
            }
        }
        prop_assume!(!runnable.is_empty());

        let mut seq = 1;
        for _ in 0..rounds {
            let picks: Vec<Pid> = (0..runnable.len())
                .map(|_| {
                    seq += 1;
                    sched.select(&mut tasks, &mut spaces, &config(), 0, seq)
                })
                .collect();
            let seen: BTreeSet<Pid> = picks.iter().copied().collect();
            prop_assert_eq!(&seen, &runnable);
        }
    }

    #[test]
    fn idle_only_when_all_blocked(blocked in proptest::collection::vec(any::<bool>(), 1..8)) {
        let mut spaces = manager();
        let mut tasks = table(&spaces);
        let mut sched = Scheduler::new(32);
        for is_blocked in &blocked {
            let pid = spawn(&mut tasks, &mut spaces, None);
            prop_assert!(sched.enqueue(pid).is_enqueued());
            if *is_blocked {
                tasks.get_mut(pid).unwrap().block_on(BlockReason::Sleep { deadline: u64::MAX });
            }
        }
        let pick = sched.select(&mut tasks, &mut spaces, &config(), 0, 1);
        prop_assert_eq!(pick == Pid::KERNEL, blocked.iter().all(|b| *b));
    }
}
