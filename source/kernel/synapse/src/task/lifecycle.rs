// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Task creation, fork, exec, termination and end-of-life
//! OWNERS: @kernel-sched-team
//! PUBLIC API: TaskTable::{create, fork, exec, terminate, exit, end_of_life, discard}
//! DEPENDS_ON: mm::AddressSpaceManager, task::image::ImageLoader, config::Config
//! INVARIANTS: A failed create/fork/exec leaves no context, stack or slot behind;
//!             children of a dying task are re-parented to a live init
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use alloc::vec::Vec;

use super::image::{push_args, ImageLoader, LoadError};
use super::memory::{RegionKind, TaskMemory};
use super::{release_resources, Credentials, KernelStack, SpawnError, Task, TaskState, TaskTable};
use crate::config::Config;
use crate::mm::{align_down, align_up, Access, AddressSpaceError, AddressSpaceManager, AllocRequest, AsHandle, RangeKind, PAGE_SIZE};
use crate::signal::{self, ExitStatus, Signal, SignalState};
use crate::trap::{reg, TrapFrame};
use crate::types::{Pid, VirtAddr};

/// A populated context ready to become a task.
struct Image {
    space: AsHandle,
    kstack: KernelStack,
    frame: TrapFrame,
    memory: TaskMemory,
}

fn allocate_kernel_stack(config: &Config, spaces: &mut AddressSpaceManager) -> Result<KernelStack, AddressSpaceError> {
    let kernel = spaces.kernel();
    let request = AllocRequest::new(Access::KERNEL_RW, RangeKind::Owned { free_on_unmap: true }).zeroed();
    let base = spaces.allocate(kernel, config.kernel_stack_pages, request)?;
    Ok(KernelStack { base, pages: config.kernel_stack_pages })
}

/// Builds context, kernel stack, image, trampoline, stack and arguments; tears everything down on failure.
fn build_image(
    pid: Pid,
    path: &[u8],
    argv: &[Vec<u8>],
    envp: &[Vec<u8>],
    config: &Config,
    loader: &dyn ImageLoader,
    spaces: &mut AddressSpaceManager,
) -> Result<Image, SpawnError> {
    let space = spaces.create()?;
    let kstack = match allocate_kernel_stack(config, spaces) {
        Ok(stack) => stack,
        Err(err) => {
            release_resources(spaces, pid, space, None);
            return Err(err.into());
        }
    };
    match populate(space, path, argv, envp, config, loader, spaces) {
        Ok((frame, memory)) => Ok(Image { space, kstack, frame, memory }),
        Err(err) => {
            release_resources(spaces, pid, space, Some(kstack));
            Err(err)
        }
    }
}

fn populate(
    space: AsHandle,
    path: &[u8],
    argv: &[Vec<u8>],
    envp: &[Vec<u8>],
    config: &Config,
    loader: &dyn ImageLoader,
    spaces: &mut AddressSpaceManager,
) -> Result<(TrapFrame, TaskMemory), SpawnError> {
    let image = loader.load(path, spaces, space)?;
    if image.end < image.entry {
        return Err(LoadError::Malformed.into());
    }
    let trampoline = VirtAddr::page_aligned(config.trampoline_va).ok_or(AddressSpaceError::InvalidArgs)?;
    spaces.map_trampoline(space, trampoline)?;

    let floor = config.user_top - config.stack_initial_pages * PAGE_SIZE;
    let stack = VirtAddr::page_aligned(floor).ok_or(AddressSpaceError::InvalidArgs)?;
    let request = AllocRequest::new(Access::USER_RW, RangeKind::CopyOnFork).at(stack).zeroed();
    spaces.allocate(space, config.stack_initial_pages, request)?;
    let layout = push_args(spaces, space, config.user_top, argv, envp)?;

    let mut frame = TrapFrame::user(image.entry.raw(), layout.sp);
    frame.x[reg::A0] = layout.argc;
    frame.x[reg::A1] = layout.argv;
    frame.x[reg::A2] = layout.envp;

    let mut memory = TaskMemory::new(image.end, floor);
    let image_start = align_down(image.entry.raw());
    memory.record(
        RegionKind::Image,
        VirtAddr::new_unchecked(image_start),
        (align_up(image.end.raw()) - image_start) / PAGE_SIZE,
    );
    memory.record(RegionKind::Trampoline, trampoline, 1);
    memory.record(RegionKind::Stack, stack, config.stack_initial_pages);
    Ok((frame, memory))
}

impl TaskTable {
    /// Creates a task running `path` with a fresh context.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &mut self,
        parent: Option<Pid>,
        creds: Credentials,
        path: &[u8],
        argv: &[Vec<u8>],
        envp: &[Vec<u8>],
        config: &Config,
        loader: &dyn ImageLoader,
        spaces: &mut AddressSpaceManager,
    ) -> Result<Pid, SpawnError> {
        if let Some(parent) = parent {
            if !self.state(parent).is_some_and(TaskState::is_live) {
                return Err(SpawnError::InvalidParent);
            }
        }
        let pid = self.allocate_pid()?;
        let image = build_image(pid, path, argv, envp, config, loader, spaces)?;
        if let Err(err) = spaces.attach(image.space, pid) {
            release_resources(spaces, pid, image.space, Some(image.kstack));
            return Err(err.into());
        }
        self.insert(Task {
            space: image.space,
            kstack: Some(image.kstack),
            frame: image.frame,
            memory: image.memory,
            parent,
            creds,
            argv: argv.to_vec(),
            envp: envp.to_vec(),
            ..Task::blank(pid, image.space)
        });
        if let Some(parent) = parent.and_then(|parent| self.get_mut(parent)) {
            parent.children.push(pid);
        }
        log::info!(target: "task", "pid {} created (parent {:?}, entry {:#x})", pid, parent, image.frame.sepc);
        Ok(pid)
    }

    /// Duplicates `parent`; the child resumes past the same ecall with a0 = 0.
    pub fn fork(&mut self, parent: Pid, config: &Config, spaces: &mut AddressSpaceManager) -> Result<Pid, SpawnError> {
        if parent == Pid::KERNEL {
            return Err(SpawnError::Bootstrap);
        }
        let source = self.get(parent).filter(|task| task.state.is_live()).ok_or(SpawnError::InvalidParent)?;
        let mut frame = source.frame;
        let source_space = source.space;
        let pid = self.allocate_pid()?;

        let space = spaces.create()?;
        if let Err(err) = spaces.clone_into(space, source_space, config.fork_policy) {
            release_resources(spaces, pid, space, None);
            return Err(err.into());
        }
        let kstack = match allocate_kernel_stack(config, spaces) {
            Ok(stack) => stack,
            Err(err) => {
                release_resources(spaces, pid, space, None);
                return Err(err.into());
            }
        };
        if let Err(err) = spaces.attach(space, pid) {
            release_resources(spaces, pid, space, Some(kstack));
            return Err(err.into());
        }

        frame.x[reg::A0] = 0;
        frame.sepc += 4;
        let Some(source) = self.get(parent) else {
            release_resources(spaces, pid, space, Some(kstack));
            return Err(SpawnError::InvalidParent);
        };
        let mut memory = source.memory.clone();
        if let Ok(child_space) = spaces.get(space) {
            memory.retain(|region| child_space.range_at(region.start).is_some());
        }
        let child = Task {
            space,
            kstack: Some(kstack),
            frame,
            memory,
            parent: Some(parent),
            creds: source.creds,
            files: source.files.clone(),
            signals: source.signals.clone(),
            argv: source.argv.clone(),
            envp: source.envp.clone(),
            ..Task::blank(pid, space)
        };
        self.insert(child);
        if let Some(parent) = self.get_mut(parent) {
            parent.children.push(pid);
        }
        log::debug!(target: "task", "pid {} forked from {}", pid, parent);
        Ok(pid)
    }

    /// Replaces the image of `pid`. The old descriptor's context and kernel stack
    /// are retired at trap `seq`; on failure the caller is untouched.
    #[allow(clippy::too_many_arguments)]
    pub fn exec(
        &mut self,
        pid: Pid,
        path: &[u8],
        argv: &[Vec<u8>],
        envp: &[Vec<u8>],
        config: &Config,
        loader: &dyn ImageLoader,
        spaces: &mut AddressSpaceManager,
        seq: u64,
    ) -> Result<(), SpawnError> {
        if pid == Pid::KERNEL {
            return Err(SpawnError::Bootstrap);
        }
        if !self.state(pid).is_some_and(TaskState::is_live) {
            return Err(SpawnError::InvalidParent);
        }
        let image = build_image(pid, path, argv, envp, config, loader, spaces)?;
        if let Err(err) = spaces.attach(image.space, pid) {
            release_resources(spaces, pid, image.space, Some(image.kstack));
            return Err(err.into());
        }
        let Some(mut old) = self.remove(pid) else {
            release_resources(spaces, pid, image.space, Some(image.kstack));
            return Err(SpawnError::InvalidParent);
        };
        let mut signals = old.signals.clone();
        signals.reset_for_exec();
        let replacement = Task {
            space: image.space,
            kstack: Some(image.kstack),
            frame: image.frame,
            memory: image.memory,
            parent: old.parent,
            children: core::mem::take(&mut old.children),
            creds: old.creds,
            files: core::mem::take(&mut old.files),
            signals,
            argv: argv.to_vec(),
            envp: envp.to_vec(),
            ..Task::blank(pid, image.space)
        };
        old.state = TaskState::Replaced;
        self.retire(pid, old.space, old.kstack, seq);
        self.insert(replacement);
        log::info!(target: "task", "pid {} exec {:?}", pid, core::str::from_utf8(path).unwrap_or("<bin>"));
        Ok(())
    }

    /// Marks a live task dead with `status`; end-of-life runs on the next scheduler pass.
    pub fn terminate(&mut self, pid: Pid, status: ExitStatus) -> bool {
        if pid == Pid::KERNEL {
            return false;
        }
        let Some(task) = self.get_mut(pid).filter(|task| task.state.is_live()) else {
            return false;
        };
        task.state = TaskState::Terminated;
        task.block = None;
        task.exit = Some(status);
        task.yield_requested = true;
        log::debug!(target: "task", "pid {} terminated status {:#x}", pid, status.raw());
        true
    }

    pub fn exit(&mut self, pid: Pid, code: usize) -> bool {
        self.terminate(pid, ExitStatus::exited(code))
    }

    /// Tears down a `Terminated` task. `current` names the task whose kernel
    /// stack and page table are live; its release is deferred past trap `seq`.
    pub fn end_of_life(
        &mut self,
        pid: Pid,
        spaces: &mut AddressSpaceManager,
        config: &Config,
        current: Pid,
        seq: u64,
    ) {
        let Some(task) = self.get_mut(pid).filter(|task| task.state == TaskState::Terminated) else {
            return;
        };
        task.files.close_all();
        let children = core::mem::take(&mut task.children);
        let parent = task.parent;
        let space = task.space;
        let kstack = task.kstack.take();

        let heir = (pid != Pid::INIT && self.state(Pid::INIT).is_some_and(TaskState::is_live)).then_some(Pid::INIT);
        for child in &children {
            if let Some(task) = self.get_mut(*child) {
                task.parent = heir;
            }
        }
        if let Some(init) = heir.and_then(|init| self.get_mut(init)) {
            init.children.extend_from_slice(&children);
        }

        let reaped = self.finish_child(pid, spaces);
        if pid == current {
            self.retire(pid, space, kstack, seq);
        } else {
            release_resources(spaces, pid, space, kstack);
        }
        if reaped || parent.is_none() {
            if let Some(task) = self.get_mut(pid) {
                task.state = TaskState::Reaped;
            }
            self.remove(pid);
        } else if let Some(task) = self.get_mut(pid) {
            task.state = TaskState::Zombie;
        }
        log::info!(target: "task", "pid {} end of life (reaped={}, parent {:?})", pid, reaped || parent.is_none(), parent);

        if let Some(parent) = parent {
            signal::deliver(self, spaces, parent, Signal::CHLD, config.trampoline_va);
        }
        for child in children {
            if self.state(child) != Some(TaskState::Zombie) {
                continue;
            }
            match heir {
                Some(_) => {
                    self.finish_child(child, spaces);
                }
                None => {
                    self.remove(child);
                }
            }
        }
    }

    /// Drops a task that never ran (for instance when it could not be queued).
    pub fn discard(&mut self, pid: Pid, spaces: &mut AddressSpaceManager) {
        let Some(task) = self.remove(pid) else {
            return;
        };
        if let Some(parent) = task.parent.and_then(|parent| self.get_mut(parent)) {
            parent.children.retain(|child| *child != pid);
        }
        release_resources(spaces, pid, task.space, task.kstack);
    }
}

impl Task {
    /// Empty live descriptor; constructors override what they populate.
    pub(super) fn blank(pid: Pid, space: AsHandle) -> Self {
        Self {
            pid,
            creds: Credentials::ROOT,
            space,
            kstack: None,
            frame: TrapFrame::default(),
            files: super::FileTable::new(),
            parent: None,
            children: Vec::new(),
            memory: TaskMemory::empty(),
            signals: SignalState::new(),
            state: TaskState::Running,
            block: None,
            errno: None,
            yield_requested: false,
            exit: None,
            argv: Vec::new(),
            envp: Vec::new(),
        }
    }
}
