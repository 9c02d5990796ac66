// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Signal delivery, the user trampoline and sigreturn
//! OWNERS: @kernel-sched-team
//! PUBLIC API: deliver(), deliver_fault(), kill(), sigreturn(), may_signal(), trampoline_code(), SignalFrame
//! DEPENDS_ON: task::TaskTable, mm::AddressSpaceManager, trap::TrapFrame
//! INVARIANTS: Faults, kill and drivers share one delivery path; a masked signal leaves the target untouched;
//!             a refused fault signal terminates the task
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use alloc::vec::Vec;

use super::{Disposition, ExitStatus, SigSet, Signal, SignalError};
use crate::mm::{AddressSpaceError, AddressSpaceManager};
use crate::syscall::SYSCALL_SIGRETURN;
use crate::task::{BlockReason, Credentials, Task, TaskState, TaskTable};
use crate::trap::{reg, TrapFrame};
use crate::types::{Pid, VirtAddr};

const WORD: usize = core::mem::size_of::<usize>();
/// Bytes of a serialized [`SignalFrame`]: signo, 32 GPRs, sepc, mask.
pub const SIGNAL_FRAME_SIZE: usize = (1 + 32 + 1 + 1) * WORD;
const FRAME_ALIGN: usize = 16;

/// What a delivery did to its target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Target dead or signal masked.
    Dropped,
    Ignored,
    Terminated,
    Stopped,
    Continued,
    /// Handler frame pushed; the task resumes in the trampoline.
    Caught,
    /// A blocked wait was failed with EINTR.
    Interrupted,
    /// Default action is to do nothing.
    NoEffect,
    /// Signal 0: target exists and may be signaled.
    Probed,
}

/// Context saved on the user stack while a handler runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SignalFrame {
    pub signo: usize,
    pub regs: [usize; 32],
    pub sepc: usize,
    pub mask: SigSet,
}

impl SignalFrame {
    fn capture(sig: Signal, frame: &TrapFrame, mask: SigSet) -> Self {
        Self { signo: sig.index(), regs: frame.x, sepc: frame.sepc, mask }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SIGNAL_FRAME_SIZE);
        out.extend_from_slice(&self.signo.to_le_bytes());
        for word in &self.regs {
            out.extend_from_slice(&word.to_le_bytes());
        }
        out.extend_from_slice(&self.sepc.to_le_bytes());
        out.extend_from_slice(&(self.mask.bits() as usize).to_le_bytes());
        out
    }

    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        if raw.len() < SIGNAL_FRAME_SIZE {
            return None;
        }
        let word = |index: usize| {
            let mut bytes = [0u8; WORD];
            bytes.copy_from_slice(&raw[index * WORD..(index + 1) * WORD]);
            usize::from_le_bytes(bytes)
        };
        let mut regs = [0usize; 32];
        for (slot, value) in regs.iter_mut().enumerate() {
            *value = word(1 + slot);
        }
        Some(Self { signo: word(0), regs, sepc: word(33), mask: SigSet::from_bits(word(34) as u32) })
    }
}

/// `jalr ra, 0(a1); li a7, SYSCALL_SIGRETURN; ecall`, little-endian.
pub fn trampoline_code() -> [u8; 12] {
    const JALR_RA_A1: u32 = 0x0005_80e7;
    const ECALL: u32 = 0x0000_0073;
    let li_a7 = ((SYSCALL_SIGRETURN as u32) << 20) | 0x893;
    let mut code = [0u8; 12];
    code[0..4].copy_from_slice(&JALR_RA_A1.to_le_bytes());
    code[4..8].copy_from_slice(&li_a7.to_le_bytes());
    code[8..12].copy_from_slice(&ECALL.to_le_bytes());
    code
}

/// Kill permission: privileged sender, or sender real/effective uid owns the target.
pub fn may_signal(sender: &Credentials, target: &Credentials) -> bool {
    sender.euid == 0 || sender.uid == target.uid || sender.euid == target.uid
}

/// Permission-checked delivery for `kill`. `sender` is `None` for kernel and driver senders.
pub fn kill(
    tasks: &mut TaskTable,
    spaces: &mut AddressSpaceManager,
    sender: Option<Pid>,
    target: Pid,
    raw: usize,
    trampoline_va: usize,
) -> Result<Delivery, SignalError> {
    let sig = match raw {
        0 => None,
        raw => Some(Signal::new(raw).ok_or(SignalError::InvalidSignal)?),
    };
    if target == Pid::KERNEL {
        return Err(SignalError::NoSuchProcess);
    }
    let victim = tasks.get(target).map(Task::credentials).ok_or(SignalError::NoSuchProcess)?;
    if let Some(sender) = sender {
        let creds = tasks.get(sender).map(Task::credentials).ok_or(SignalError::NoSuchProcess)?;
        if !may_signal(&creds, &victim) {
            return Err(SignalError::PermissionDenied);
        }
    }
    Ok(match sig {
        None => Delivery::Probed,
        Some(sig) => deliver(tasks, spaces, target, sig, trampoline_va),
    })
}

/// Asynchronous delivery from kill and drivers.
pub fn deliver(
    tasks: &mut TaskTable,
    spaces: &mut AddressSpaceManager,
    target: Pid,
    sig: Signal,
    trampoline_va: usize,
) -> Delivery {
    dispatch(tasks, spaces, target, sig, trampoline_va, false)
}

/// Delivery of a synchronous fault; a masked or ignored fault signal terminates the task.
pub fn deliver_fault(
    tasks: &mut TaskTable,
    spaces: &mut AddressSpaceManager,
    target: Pid,
    sig: Signal,
    trampoline_va: usize,
) -> Delivery {
    dispatch(tasks, spaces, target, sig, trampoline_va, true)
}

/// The one delivery path behind [`deliver`] and [`deliver_fault`].
fn dispatch(
    tasks: &mut TaskTable,
    spaces: &mut AddressSpaceManager,
    target: Pid,
    sig: Signal,
    trampoline_va: usize,
    synchronous: bool,
) -> Delivery {
    if target == Pid::KERNEL || !tasks.state(target).is_some_and(TaskState::is_live) {
        return Delivery::Dropped;
    }
    if sig == Signal::KILL {
        tasks.terminate(target, ExitStatus::signaled(sig));
        return Delivery::Terminated;
    }
    let Some(task) = tasks.get_mut(target) else {
        return Delivery::Dropped;
    };
    if sig == Signal::STOP {
        task.set_state(TaskState::Stopped);
        task.request_yield();
        log::debug!(target: "signal", "pid {} stopped", target);
        return Delivery::Stopped;
    }
    let refused =
        task.signals().mask().contains(sig) || task.signals().disposition(sig) == Disposition::Ignore;
    if synchronous && refused {
        // The faulting instruction would trap again on return.
        tasks.terminate(target, ExitStatus::signaled(sig));
        return Delivery::Terminated;
    }
    if task.signals().mask().contains(sig) {
        return Delivery::Dropped;
    }
    let continued = sig == Signal::CONT && task.state() == TaskState::Stopped;
    if continued {
        resume_stopped(task);
    }
    match task.signals().disposition(sig) {
        Disposition::Ignore => {
            if continued {
                Delivery::Continued
            } else {
                Delivery::Ignored
            }
        }
        Disposition::Handler { entry, mask } => match catch(task, spaces, sig, entry, mask, trampoline_va) {
            Ok(()) => Delivery::Caught,
            Err(err) => {
                log::warn!(target: "signal", "pid {}: {} frame write failed ({:?})", target, sig, err);
                tasks.terminate(target, ExitStatus::signaled(Signal::SEGV));
                Delivery::Terminated
            }
        },
        Disposition::Default => match sig {
            Signal::CONT => {
                if continued {
                    Delivery::Continued
                } else {
                    Delivery::NoEffect
                }
            }
            Signal::CHLD => {
                if task.state() == TaskState::Waiting && task.interrupt() {
                    Delivery::Interrupted
                } else {
                    Delivery::NoEffect
                }
            }
            Signal::URG | Signal::WINCH => Delivery::NoEffect,
            _ => {
                tasks.terminate(target, ExitStatus::signaled(sig));
                Delivery::Terminated
            }
        },
    }
}

/// SIGCONT: back to the blocked state the task was stopped in, else running.
fn resume_stopped(task: &mut Task) {
    let state = match task.block_reason() {
        Some(BlockReason::WaitChild(_)) => TaskState::Waiting,
        Some(_) => TaskState::Sleeping,
        None => TaskState::Running,
    };
    task.set_state(state);
}

fn catch(
    task: &mut Task,
    spaces: &mut AddressSpaceManager,
    sig: Signal,
    entry: VirtAddr,
    handler_mask: SigSet,
    trampoline_va: usize,
) -> Result<(), AddressSpaceError> {
    if task.state() == TaskState::Syscall {
        // Signal raised by the target's own syscall: complete it before the frame is saved.
        task.complete_syscall(Ok(0));
        task.frame_mut().sepc += 4;
        task.set_state(TaskState::Running);
    } else {
        task.interrupt();
    }
    let saved = SignalFrame::capture(sig, task.frame(), task.signals().mask());
    let sp = task.frame().sp().checked_sub(SIGNAL_FRAME_SIZE).ok_or(AddressSpaceError::OutOfRange)? & !(FRAME_ALIGN - 1);
    let at = VirtAddr::new(sp).ok_or(AddressSpaceError::OutOfRange)?;
    spaces.copy_out(task.space(), at, &saved.to_bytes())?;

    let frame = task.frame_mut();
    frame.sepc = trampoline_va;
    frame.x[reg::A0] = sig.index();
    frame.x[reg::A1] = entry.raw();
    frame.x[reg::A2] = sp;
    frame.x[reg::SP] = sp;
    let mask = task.signals().mask().union(handler_mask).union(SigSet::of(sig));
    task.signals_mut().replace_mask(mask);
    log::debug!(target: "signal", "pid {} caught {} handler {:#x}", task.pid(), sig, entry);
    Ok(())
}

/// Restores the context saved by [`catch`] from the frame at the task's `sp`.
pub fn sigreturn(task: &mut Task, spaces: &AddressSpaceManager) -> Result<(), AddressSpaceError> {
    let sp = VirtAddr::new(task.frame().sp()).ok_or(AddressSpaceError::OutOfRange)?;
    let mut raw = [0u8; SIGNAL_FRAME_SIZE];
    spaces.copy_in(task.space(), sp, &mut raw)?;
    let saved = SignalFrame::from_bytes(&raw).ok_or(AddressSpaceError::InvalidArgs)?;
    if Signal::new(saved.signo).is_none() {
        return Err(AddressSpaceError::InvalidArgs);
    }
    let frame = task.frame_mut();
    frame.x = saved.regs;
    frame.x[0] = 0;
    frame.sepc = saved.sepc;
    task.signals_mut().replace_mask(saved.mask);
    Ok(())
}
