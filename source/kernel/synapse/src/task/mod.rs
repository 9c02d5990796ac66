// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Task descriptors, the task table and lifecycle transitions
//! OWNERS: @kernel-sched-team
//! STATUS: Functional
//! PUBLIC API: Task, TaskTable (create/fork/exec/terminate/end_of_life/wait), TaskState, BlockReason
//! DEPENDS_ON: mm::AddressSpaceManager, signal::SignalState, task::image::ImageLoader, trap::TrapFrame
//! INVARIANTS: One state per task; one exclusively attached context per task;
//!             live kernel stacks and page tables are released one trap late
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

pub mod files;
pub mod image;
mod lifecycle;
pub mod memory;
mod wait;

#[cfg(test)]
mod tests;

use alloc::vec::Vec;
use core::marker::PhantomData;

use crate::dev::EventId;
use crate::mm::{AddressSpaceError, AddressSpaceManager, AsHandle};
use crate::signal::SignalState;
use crate::syscall::errno::Errno;
use crate::trap::{reg, TrapFrame};
use crate::types::VirtAddr;

pub use self::files::{FileTable, TableFull, MAX_FILES};
pub use self::image::{ImageLoader, LoadError, LoadedImage};
pub use self::memory::{Region, RegionKind, StackFault, TaskMemory};
pub use self::wait::WaitOutcome;
pub use crate::signal::ExitStatus;
pub use crate::types::Pid;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    /// Executing a system call on its own behalf.
    Syscall,
    /// Blocked on a deadline or a device event.
    Sleeping,
    /// Blocked in `wait` for a child.
    Waiting,
    Stopped,
    /// Dead; end-of-life has not run yet.
    Terminated,
    /// Dead and released; keeps pid and status for its parent.
    Zombie,
    Reaped,
    /// Superseded by exec.
    Replaced,
}

impl TaskState {
    /// Still able to run, block or receive signals.
    pub const fn is_live(self) -> bool {
        !matches!(self, Self::Terminated | Self::Zombie | Self::Reaped | Self::Replaced)
    }

    pub const fn is_runnable(self) -> bool {
        matches!(self, Self::Running | Self::Syscall)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub euid: u32,
    pub egid: u32,
}

impl Credentials {
    pub const ROOT: Self = Self { uid: 0, gid: 0, euid: 0, egid: 0 };

    pub const fn user(uid: u32, gid: u32) -> Self {
        Self { uid, gid, euid: uid, egid: gid }
    }
}

/// Which children a wait accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTarget {
    Any,
    Pid(Pid),
}

impl WaitTarget {
    /// Raw pid 0 means any child.
    pub fn from_raw(raw: usize) -> Option<Self> {
        match raw {
            0 => Some(Self::Any),
            raw => u32::try_from(raw).ok().map(|raw| Self::Pid(Pid::from_raw(raw))),
        }
    }

    pub fn matches(self, pid: Pid) -> bool {
        match self {
            Self::Any => true,
            Self::Pid(target) => target == pid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitRequest {
    pub target: WaitTarget,
    /// User address receiving the status word.
    pub status: Option<VirtAddr>,
}

/// Condition a blocked task resumes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    WaitChild(WaitRequest),
    Sleep { deadline: u64 },
    Event(EventId),
}

/// Kernel stack range inside the kernel context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelStack {
    base: VirtAddr,
    pages: usize,
}

impl KernelStack {
    pub fn base(&self) -> VirtAddr {
        self.base
    }

    pub fn top(&self) -> usize {
        self.base.raw() + self.pages * crate::mm::PAGE_SIZE
    }
}

/// Error returned when creating or replacing a task.
#[must_use = "spawn errors must be handled explicitly"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    /// Parent (or exec target) does not exist or is not live.
    InvalidParent,
    /// No descriptor slot is left.
    TableFull,
    /// The bootstrap task cannot fork or exec.
    Bootstrap,
    Load(LoadError),
    AddressSpace(AddressSpaceError),
}

impl From<AddressSpaceError> for SpawnError {
    fn from(value: AddressSpaceError) -> Self {
        Self::AddressSpace(value)
    }
}

impl From<LoadError> for SpawnError {
    fn from(value: LoadError) -> Self {
        Self::Load(value)
    }
}

/// Errors returned when waiting for child processes.
#[must_use = "wait errors must be handled explicitly"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// Waiting on oneself.
    InvalidTarget,
    /// Requested pid is not an unreaped child of the caller.
    NoSuchChild,
    /// Caller has no unreaped children.
    NoChildren,
    /// Status word could not be written; the child stays a zombie.
    Fault(AddressSpaceError),
}

/// Task control block.
pub struct Task {
    pid: Pid,
    creds: Credentials,
    space: AsHandle,
    kstack: Option<KernelStack>,
    frame: TrapFrame,
    files: FileTable,
    parent: Option<Pid>,
    children: Vec<Pid>,
    memory: TaskMemory,
    signals: SignalState,
    state: TaskState,
    block: Option<BlockReason>,
    errno: Option<Errno>,
    yield_requested: bool,
    exit: Option<ExitStatus>,
    argv: Vec<Vec<u8>>,
    envp: Vec<Vec<u8>>,
}

impl Task {
    /// PID 0: runs on the boot stack inside the kernel context and idles.
    fn bootstrap(kernel: AsHandle) -> Self {
        Self {
            frame: TrapFrame { sstatus: crate::trap::SSTATUS_SPP, ..TrapFrame::default() },
            ..Self::blank(Pid::KERNEL, kernel)
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn credentials(&self) -> Credentials {
        self.creds
    }

    pub fn set_credentials(&mut self, creds: Credentials) {
        self.creds = creds;
    }

    pub fn space(&self) -> AsHandle {
        self.space
    }

    pub fn kernel_stack(&self) -> Option<KernelStack> {
        self.kstack
    }

    /// Returns the saved trap frame.
    pub fn frame(&self) -> &TrapFrame {
        &self.frame
    }

    pub fn frame_mut(&mut self) -> &mut TrapFrame {
        &mut self.frame
    }

    pub fn files(&self) -> &FileTable {
        &self.files
    }

    pub fn files_mut(&mut self) -> &mut FileTable {
        &mut self.files
    }

    pub fn parent(&self) -> Option<Pid> {
        self.parent
    }

    pub fn children(&self) -> &[Pid] {
        &self.children
    }

    pub fn memory(&self) -> &TaskMemory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut TaskMemory {
        &mut self.memory
    }

    pub fn signals(&self) -> &SignalState {
        &self.signals
    }

    pub fn signals_mut(&mut self) -> &mut SignalState {
        &mut self.signals
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn block_reason(&self) -> Option<BlockReason> {
        self.block
    }

    /// Errno recorded by the last failed system call.
    pub fn errno(&self) -> Option<Errno> {
        self.errno
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit
    }

    pub fn argv(&self) -> &[Vec<u8>] {
        &self.argv
    }

    pub fn envp(&self) -> &[Vec<u8>] {
        &self.envp
    }

    pub fn is_blocked(&self) -> bool {
        self.block.is_some()
    }

    pub fn yield_requested(&self) -> bool {
        self.yield_requested
    }

    pub fn request_yield(&mut self) {
        self.yield_requested = true;
    }

    pub(crate) fn take_yield(&mut self) -> bool {
        core::mem::take(&mut self.yield_requested)
    }

    pub(crate) fn set_state(&mut self, state: TaskState) {
        self.state = state;
    }

    /// Parks the task on `reason` and asks for a scheduler pass.
    pub(crate) fn block_on(&mut self, reason: BlockReason) {
        self.state = match reason {
            BlockReason::WaitChild(_) => TaskState::Waiting,
            BlockReason::Sleep { .. } | BlockReason::Event(_) => TaskState::Sleeping,
        };
        self.block = Some(reason);
        self.yield_requested = true;
    }

    /// Clears the block; a stopped task stays stopped.
    pub(crate) fn unblock(&mut self) {
        self.block = None;
        if matches!(self.state, TaskState::Waiting | TaskState::Sleeping) {
            self.state = TaskState::Running;
        }
    }

    /// Writes a syscall result into the saved frame (a0 plus the errno side channel).
    pub(crate) fn complete_syscall(&mut self, result: Result<usize, Errno>) {
        match result {
            Ok(value) => {
                self.frame.x[reg::A0] = value;
                self.errno = None;
            }
            Err(errno) => {
                self.frame.x[reg::A0] = errno.encode();
                self.errno = Some(errno);
            }
        }
    }

    /// Aborts a pending blocking call with EINTR.
    pub(crate) fn interrupt(&mut self) -> bool {
        let Some(reason) = self.block else {
            return false;
        };
        // Event waits park on the ecall itself; step past it before failing the call.
        if matches!(reason, BlockReason::Event(_)) {
            self.frame.sepc += 4;
        }
        self.complete_syscall(Err(Errno::EINTR));
        self.unblock();
        true
    }
}

/// Resources of a dead or replaced descriptor awaiting release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Retired {
    pid: Pid,
    space: AsHandle,
    kstack: Option<KernelStack>,
    /// Trap sequence number at retirement; released on a later trap.
    seq: u64,
}

/// Kernel task table managing task control blocks.
pub struct TaskTable {
    slots: Vec<Option<Task>>,
    retired: Vec<Retired>,
    max_tasks: usize,
    // Single-hart contract: the table stays in the kernel execution context.
    _not_send_sync: PhantomData<*mut ()>,
}
static_assertions::assert_not_impl_any!(TaskTable: Send, Sync);

impl TaskTable {
    /// Creates a new table seeded with the bootstrap task (PID 0).
    pub fn new(kernel: AsHandle, max_tasks: usize) -> Self {
        let mut slots = Vec::new();
        slots.push(Some(Task::bootstrap(kernel)));
        Self { slots, retired: Vec::new(), max_tasks: max_tasks.max(1), _not_send_sync: PhantomData }
    }

    pub fn get(&self, pid: Pid) -> Option<&Task> {
        self.slots.get(pid.as_index()).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Task> {
        self.slots.get_mut(pid.as_index()).and_then(Option::as_mut)
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.get(pid).is_some()
    }

    pub fn state(&self, pid: Pid) -> Option<TaskState> {
        self.get(pid).map(Task::state)
    }

    /// Number of occupied descriptor slots.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.slots.iter().flatten().map(Task::pid).collect()
    }

    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }

    /// Lowest free pid above the bootstrap task.
    fn allocate_pid(&self) -> Result<Pid, SpawnError> {
        let index = match self.slots.iter().skip(1).position(Option::is_none) {
            Some(hole) => hole + 1,
            None if self.slots.len() < self.max_tasks => self.slots.len(),
            None => return Err(SpawnError::TableFull),
        };
        u32::try_from(index).map(Pid::from_raw).map_err(|_| SpawnError::TableFull)
    }

    fn insert(&mut self, task: Task) {
        let index = task.pid.as_index();
        if index >= self.slots.len() {
            self.slots.resize_with(index + 1, || None);
        }
        self.slots[index] = Some(task);
    }

    fn remove(&mut self, pid: Pid) -> Option<Task> {
        if pid == Pid::KERNEL {
            return None;
        }
        self.slots.get_mut(pid.as_index()).and_then(Option::take)
    }

    /// Queues a detached context and kernel stack for release after trap `seq`.
    fn retire(&mut self, pid: Pid, space: AsHandle, kstack: Option<KernelStack>, seq: u64) {
        self.retired.push(Retired { pid, space, kstack, seq });
    }

    /// Releases everything retired before trap `seq`.
    pub fn release_retired(&mut self, spaces: &mut AddressSpaceManager, seq: u64) {
        let (due, kept): (Vec<Retired>, Vec<Retired>) = self.retired.drain(..).partition(|entry| entry.seq < seq);
        self.retired = kept;
        for entry in due {
            release_resources(spaces, entry.pid, entry.space, entry.kstack);
        }
    }
}

/// Detaches and destroys a context and frees a kernel stack; failures are logged.
fn release_resources(spaces: &mut AddressSpaceManager, pid: Pid, space: AsHandle, kstack: Option<KernelStack>) {
    if let Err(err) = spaces.detach(space, pid).and_then(|()| spaces.destroy(space)) {
        log::error!(target: "task", "pid {}: context {} release failed: {:?}", pid, space.to_raw(), err);
    }
    if let Some(stack) = kstack {
        let kernel = spaces.kernel();
        if let Err(err) = spaces.free(kernel, stack.base) {
            log::error!(target: "task", "pid {}: kernel stack release failed: {:?}", pid, err);
        }
    }
}
