// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Aggregated kernel state and the driver-facing API
//! OWNERS: @kernel-team
//! STATUS: Functional
//! PUBLIC API: Kernel (new/spawn/handle_trap/send_signal/register_irq/wake_event/install_file), KernelError
//! DEPENDS_ON: mm::AddressSpaceManager, task::TaskTable, sched::Scheduler, trap::IrqTable, syscall::SyscallTable
//! INVARIANTS: Every subsystem is owned here and reached through &mut; no global state
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md


use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::Range;

use crate::config::Config;
use crate::dev::{EventId, FileOps};
use crate::hal::{Cpu, PhysMemory};
use crate::mm::{AddressSpaceError, AddressSpaceManager, AllocRequest, AsHandle, FrameAllocator};
use crate::sched::{EnqueueOutcome, EnqueueRejectReason, Scheduler};
use crate::signal::{self, trampoline_code, Delivery, SignalError};
use crate::syscall::SyscallTable;
use crate::task::{BlockReason, Credentials, ImageLoader, RegionKind, SpawnError, TaskTable};
use crate::trap::{IrqError, IrqSink, IrqTable, Vector};
use crate::types::{Pid, VirtAddr};

/// Failures of the driver-facing API.
#[must_use = "kernel errors must be handled explicitly"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    AddressSpace(AddressSpaceError),
    Spawn(SpawnError),
    Queue(EnqueueRejectReason),
    NoSuchTask,
    /// The task's file table has no free slot.
    TableFull,
}

impl From<AddressSpaceError> for KernelError {
    fn from(value: AddressSpaceError) -> Self {
        Self::AddressSpace(value)
    }
}

impl From<SpawnError> for KernelError {
    fn from(value: SpawnError) -> Self {
        Self::Spawn(value)
    }
}

/// Aggregated kernel state.
pub struct Kernel {
    pub(crate) config: Config,
    pub(crate) cpu: Box<dyn Cpu>,
    pub(crate) loader: Box<dyn ImageLoader>,
    pub(crate) spaces: AddressSpaceManager,
    pub(crate) tasks: TaskTable,
    pub(crate) scheduler: Scheduler,
    pub(crate) irqs: IrqTable,
    pub(crate) syscalls: SyscallTable,
    /// Timer ticks since boot.
    pub(crate) ticks: u64,
    /// Traps taken since boot; tags deferred releases.
    pub(crate) traps: u64,
    /// Task and context currently installed on the hart.
    pub(crate) active: Option<(Pid, AsHandle)>,
}

impl Kernel {
    /// Builds every subsystem and installs the signal trampoline page.
    pub fn new(
        config: Config,
        cpu: Box<dyn Cpu>,
        memory: Box<dyn PhysMemory>,
        frames: FrameAllocator,
        loader: Box<dyn ImageLoader>,
    ) -> Result<Self, KernelError> {
        let mut spaces = AddressSpaceManager::new(&config, frames, memory)?;
        spaces.install_trampoline(&trampoline_code())?;
        let tasks = TaskTable::new(spaces.kernel(), config.max_tasks);
        log::info!(
            target: "sched",
            "kernel up: {} free frames, preempt every {} ticks",
            spaces.free_frames(),
            config.preempt_period
        );
        Ok(Self {
            config,
            cpu,
            loader,
            spaces,
            tasks,
            scheduler: Scheduler::new(config.run_queue_capacity),
            irqs: IrqTable::new(),
            syscalls: SyscallTable::standard(),
            ticks: 0,
            traps: 0,
            active: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tasks(&self) -> &TaskTable {
        &self.tasks
    }

    pub fn tasks_mut(&mut self) -> &mut TaskTable {
        &mut self.tasks
    }

    pub fn spaces(&self) -> &AddressSpaceManager {
        &self.spaces
    }

    pub fn spaces_mut(&mut self) -> &mut AddressSpaceManager {
        &mut self.spaces
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn trap_seq(&self) -> u64 {
        self.traps
    }

    /// Task whose frame the last trap resumed.
    pub fn current(&self) -> Pid {
        self.scheduler.current()
    }

    /// Creates a root-owned task running `path` and queues it.
    pub fn spawn(
        &mut self,
        parent: Option<Pid>,
        path: &[u8],
        argv: &[Vec<u8>],
        envp: &[Vec<u8>],
    ) -> Result<Pid, KernelError> {
        let pid = self.tasks.create(
            parent,
            Credentials::ROOT,
            path,
            argv,
            envp,
            &self.config,
            &*self.loader,
            &mut self.spaces,
        )?;
        if let EnqueueOutcome::Rejected(reason) = self.scheduler.enqueue(pid) {
            self.tasks.discard(pid, &mut self.spaces);
            return Err(KernelError::Queue(reason));
        }
        Ok(pid)
    }

    pub fn register_irq(&mut self, vector: Vector, sink: Arc<dyn IrqSink>, reentrant: bool) -> Result<(), IrqError> {
        self.irqs.register(vector, sink, reentrant)
    }

    pub fn register_irq_range(
        &mut self,
        vectors: Range<u16>,
        sink: Arc<dyn IrqSink>,
        reentrant: bool,
    ) -> Result<(), IrqError> {
        self.irqs.register_range(vectors, sink, reentrant)
    }

    /// Runs `sink` on every `period`-th timer tick.
    pub fn attach_periodic(&mut self, period: u64, sink: Arc<dyn IrqSink>) -> Result<(), IrqError> {
        self.irqs.attach_periodic(period, sink)
    }

    /// Sends `sig` (0 probes) to `target`; `sender` is `None` for drivers.
    pub fn send_signal(&mut self, sender: Option<Pid>, target: Pid, sig: usize) -> Result<Delivery, SignalError> {
        signal::kill(&mut self.tasks, &mut self.spaces, sender, target, sig, self.config.trampoline_va)
    }

    /// Maps `pages` into the context of `pid` for a driver and records the region.
    pub fn add_memory_region(&mut self, pid: Pid, pages: usize, request: AllocRequest) -> Result<VirtAddr, KernelError> {
        let task = self.tasks.get_mut(pid).ok_or(KernelError::NoSuchTask)?;
        let start = self.spaces.allocate(task.space(), pages, request)?;
        task.memory_mut().record(RegionKind::Driver, start, pages);
        Ok(start)
    }

    /// Moves the heap break of `pid`; returns the previous break.
    pub fn grow_heap(&mut self, pid: Pid, delta: isize) -> Result<usize, KernelError> {
        let task = self.tasks.get_mut(pid).ok_or(KernelError::NoSuchTask)?;
        let space = task.space();
        Ok(task.memory_mut().grow_heap(delta, &mut self.spaces, space)?)
    }

    /// Asks for a scheduler pass at the end of the current trap.
    pub fn yield_now(&mut self, pid: Pid) -> bool {
        match self.tasks.get_mut(pid) {
            Some(task) => {
                task.request_yield();
                true
            }
            None => false,
        }
    }

    /// Puts an existing task back on the run queue; already queued tasks are left as-is.
    pub fn enqueue(&mut self, pid: Pid) -> Result<(), KernelError> {
        if !self.tasks.contains(pid) {
            return Err(KernelError::NoSuchTask);
        }
        match self.scheduler.enqueue(pid) {
            EnqueueOutcome::Enqueued | EnqueueOutcome::Rejected(EnqueueRejectReason::Duplicate) => Ok(()),
            EnqueueOutcome::Rejected(reason) => Err(KernelError::Queue(reason)),
        }
    }

    /// Unblocks every task parked on `event`; their read or write is retried.
    pub fn wake_event(&mut self, event: EventId) -> usize {
        let mut woken = 0;
        for pid in self.tasks.pids() {
            let Some(task) = self.tasks.get_mut(pid) else {
                continue;
            };
            if task.block_reason() == Some(BlockReason::Event(event)) {
                task.unblock();
                woken += 1;
            }
        }
        if woken > 0 {
            log::debug!(target: "sched", "event {} woke {} task(s)", event.0, woken);
        }
        woken
    }

    /// Installs `file` in the lowest free descriptor slot of `pid`.
    pub fn install_file(&mut self, pid: Pid, file: Arc<dyn FileOps>) -> Result<usize, KernelError> {
        let task = self.tasks.get_mut(pid).ok_or(KernelError::NoSuchTask)?;
        task.files_mut().install(file).map_err(|_| KernelError::TableFull)
    }
}
