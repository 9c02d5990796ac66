// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Trap dispatch: interrupts, syscalls, user faults and the resume decision
//! OWNERS: @kernel-trap-team
//! PUBLIC API: Kernel::handle_trap()
//! DEPENDS_ON: trap::IrqTable, syscall::SyscallTable, sched::Scheduler, signal::deliver_fault()
//! INVARIANTS: Selection runs only on preempt, yield or stall; kernel-mode faults panic
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use super::{reg, TrapCause, TrapDump, TrapFrame, Vector};
use crate::kernel::Kernel;
use crate::signal::{self, ExitStatus, Signal};
use crate::syscall::{api, Args, Error};
use crate::task::{Task, TaskState};
use crate::types::Pid;

impl Kernel {
    /// Serves one trap taken while `frame` was live and rewrites `frame` with
    /// the context to resume.
    pub fn handle_trap(&mut self, frame: &mut TrapFrame) {
        self.traps += 1;
        let seq = self.traps;
        let current = self.scheduler.current();
        if let Some(task) = self.tasks.get_mut(current) {
            *task.frame_mut() = *frame;
        }

        let cause = TrapCause::decode(frame);
        let mut preempt = false;
        match cause {
            TrapCause::Interrupt(vector) => {
                if self.dispatch_interrupt(vector, frame) {
                    preempt = self.ticks % self.config.preempt_period.max(1) == 0;
                }
            }
            TrapCause::Syscall => self.dispatch_syscall(current, seq),
            fault => self.dispatch_fault(current, fault, frame),
        }

        let yielded = self.tasks.get_mut(current).is_some_and(Task::take_yield);
        let stalled = current == Pid::KERNEL || !self.tasks.state(current).is_some_and(TaskState::is_runnable);
        let mut next = if preempt || yielded || stalled { self.select(seq) } else { current };

        // A user task without a resume address cannot run; kill it and pick again.
        while next != Pid::KERNEL && self.tasks.get(next).is_some_and(|task| task.frame().sepc == 0) {
            log::error!(target: "trap", "pid {} has no resume address", next);
            self.tasks.terminate(next, ExitStatus::signaled(Signal::SEGV));
            next = self.select(seq);
        }
        self.resume(next, frame);
    }

    fn select(&mut self, seq: u64) -> Pid {
        self.scheduler.select(&mut self.tasks, &mut self.spaces, &self.config, self.ticks, seq)
    }

    /// Runs every registration of `vector`; returns true for a timer tick.
    fn dispatch_interrupt(&mut self, vector: Vector, frame: &TrapFrame) -> bool {
        let timer = vector == self.config.timer_vector;
        // Registrations may change the table, so iterate a snapshot.
        let handlers = self.irqs.handlers(vector);
        if handlers.is_empty() && !timer {
            panic!("unclaimed interrupt vector {}\n{}", vector, TrapDump(frame));
        }
        for registration in handlers {
            if registration.reentrant {
                self.cpu.enable_interrupts();
            }
            registration.sink.handle(vector, self);
            if registration.reentrant {
                self.cpu.disable_interrupts();
            }
        }
        if timer {
            self.ticks += 1;
            for sink in self.irqs.due(self.ticks) {
                sink.handle(vector, self);
            }
        }
        timer
    }

    fn dispatch_syscall(&mut self, caller: Pid, seq: u64) {
        let Some(task) = self.tasks.get_mut(caller) else {
            return;
        };
        let saved = task.frame();
        let number = saved.x[reg::A7];
        let args = Args::new([saved.x[reg::A0], saved.x[reg::A1], saved.x[reg::A2]]);
        task.set_state(TaskState::Syscall);

        let mut ctx = api::Context {
            tasks: &mut self.tasks,
            spaces: &mut self.spaces,
            scheduler: &mut self.scheduler,
            config: &self.config,
            loader: &*self.loader,
            now: self.ticks,
            trap_seq: seq,
            caller,
        };
        let result = self.syscalls.dispatch(number, &mut ctx, &args);
        #[cfg(feature = "trace_syscalls")]
        log::trace!(target: "syscall", "pid {} syscall {} {:?} -> {:?}", caller, number, args, result);

        let Some(task) = self.tasks.get_mut(caller) else {
            return;
        };
        match result {
            Ok(value) => {
                task.complete_syscall(Ok(value));
                task.frame_mut().sepc += 4;
            }
            Err(Error::Reschedule) => task.request_yield(),
            Err(Error::Suspended) => task.frame_mut().sepc += 4,
            Err(Error::FrameReplaced | Error::TaskExit) => {}
            Err(err) => {
                log::debug!(target: "syscall", "pid {} syscall {} failed: {}", caller, number, err);
                task.complete_syscall(Err(err.errno()));
                task.frame_mut().sepc += 4;
            }
        }
        if task.state() == TaskState::Syscall {
            task.set_state(TaskState::Running);
        }
    }

    fn dispatch_fault(&mut self, current: Pid, cause: TrapCause, frame: &TrapFrame) {
        if !frame.from_user() || current == Pid::KERNEL {
            panic!("kernel fault {:?} in pid {}\n{}", cause, current, TrapDump(frame));
        }
        let sig = match cause {
            TrapCause::PageFault { addr, access } => {
                if self.grow_stack(current, addr) {
                    return;
                }
                log::info!(target: "trap", "pid {} {:?} page fault at {:#x}", current, access, addr);
                Signal::SEGV
            }
            TrapCause::AccessFault { .. } => Signal::SEGV,
            TrapCause::Misaligned { .. } => Signal::BUS,
            TrapCause::IllegalInstruction | TrapCause::Unknown(_) => Signal::ILL,
            TrapCause::Breakpoint => Signal::TRAP,
            TrapCause::Interrupt(_) | TrapCause::Syscall => return,
        };
        let delivery = signal::deliver_fault(&mut self.tasks, &mut self.spaces, current, sig, self.config.trampoline_va);
        log::debug!(target: "trap", "pid {} fault {:?}: {} {:?}", current, cause, sig, delivery);
    }

    fn grow_stack(&mut self, pid: Pid, addr: usize) -> bool {
        let Some(task) = self.tasks.get_mut(pid) else {
            return false;
        };
        let space = task.space();
        task.memory_mut().grow_stack(addr, &self.config, &mut self.spaces, space).is_ok()
    }

    /// Installs `next` on the hart and copies its frame out for `sret`.
    fn resume(&mut self, next: Pid, frame: &mut TrapFrame) {
        let Some(task) = self.tasks.get(next) else {
            return;
        };
        let space = task.space();
        if self.active != Some((next, space)) {
            self.cpu.set_kernel_stack(task.kernel_stack().map_or(0, |stack| stack.top()));
            if let Err(err) = self.spaces.activate(space, &*self.cpu) {
                panic!("activate context {} for pid {} failed: {:?}", space.to_raw(), next, err);
            }
            self.active = Some((next, space));
            log::trace!(target: "trap", "switch to pid {}", next);
        }
        *frame = *task.frame();
    }
}
