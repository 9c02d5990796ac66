// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall handlers exposed to the dispatcher
//! OWNERS: @kernel-team
//! PUBLIC API: install_handlers(table), Context
//! DEPENDS_ON: sched::Scheduler, task::TaskTable, mm::AddressSpaceManager, signal
//! INVARIANTS: Stable syscall IDs; Decode→Check→Execute pattern; handlers never switch tasks
//!             themselves, they return Reschedule/Suspended and let trap exit switch
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use alloc::vec::Vec;
use core::cmp;

use super::errno::Errno;
use super::{
    Args, Error, SysResult, SyscallTable, SYSCALL_CLOSE, SYSCALL_EXECVE, SYSCALL_EXIT, SYSCALL_FORK,
    SYSCALL_GETPID, SYSCALL_GETPPID, SYSCALL_KILL, SYSCALL_MMAP, SYSCALL_READ, SYSCALL_SBRK,
    SYSCALL_SIGACTION, SYSCALL_SIGPROCMASK, SYSCALL_SIGRETURN, SYSCALL_SLEEP, SYSCALL_WAITPID,
    SYSCALL_WRITE, SYSCALL_YIELD, WNOHANG,
};
use crate::config::Config;
use crate::dev::IoError;
use crate::mm::{pages_for, Access, AddressSpaceError, AddressSpaceManager, AsHandle, PAGE_SIZE};
use crate::sched::{EnqueueOutcome, EnqueueRejectReason, Scheduler};
use crate::signal::{self, Delivery, Disposition, ExitStatus, MaskHow, SigSet, Signal, SignalError};
use crate::task::{BlockReason, ImageLoader, Task, TaskState, TaskTable, WaitOutcome, WaitTarget};
use crate::types::{Pid, VirtAddr};

/// Execution context shared across syscalls.
pub struct Context<'a> {
    pub tasks: &'a mut TaskTable,
    pub spaces: &'a mut AddressSpaceManager,
    pub scheduler: &'a mut Scheduler,
    pub config: &'a Config,
    pub loader: &'a dyn ImageLoader,
    /// Tick count at trap entry.
    pub now: u64,
    /// Sequence number of the trap being served.
    pub trap_seq: u64,
    pub caller: Pid,
}

/// Registers the default set of syscall handlers.
pub fn install_handlers(table: &mut SyscallTable) {
    table.register(SYSCALL_YIELD, sys_yield);
    table.register(SYSCALL_EXIT, sys_exit);
    table.register(SYSCALL_FORK, sys_fork);
    table.register(SYSCALL_EXECVE, sys_execve);
    table.register(SYSCALL_WAITPID, sys_waitpid);
    table.register(SYSCALL_KILL, sys_kill);
    table.register(SYSCALL_SIGACTION, sys_sigaction);
    table.register(SYSCALL_SIGPROCMASK, sys_sigprocmask);
    table.register(SYSCALL_SIGRETURN, sys_sigreturn);
    table.register(SYSCALL_SBRK, sys_sbrk);
    table.register(SYSCALL_MMAP, sys_mmap);
    table.register(SYSCALL_GETPID, sys_getpid);
    table.register(SYSCALL_GETPPID, sys_getppid);
    table.register(SYSCALL_SLEEP, sys_sleep);
    table.register(SYSCALL_READ, sys_read);
    table.register(SYSCALL_WRITE, sys_write);
    table.register(SYSCALL_CLOSE, sys_close);
}

fn caller(tasks: &mut TaskTable, pid: Pid) -> SysResult<&mut Task> {
    tasks.get_mut(pid).ok_or(Error::Errno(Errno::ESRCH))
}

fn user_ptr(raw: usize) -> SysResult<VirtAddr> {
    VirtAddr::new(raw).ok_or(Error::Errno(Errno::EFAULT))
}

fn sys_yield(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    caller(ctx.tasks, ctx.caller)?.request_yield();
    Ok(0)
}

fn sys_exit(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    ctx.tasks.exit(ctx.caller, args.get(0));
    Err(Error::TaskExit)
}

fn sys_fork(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    let child = ctx.tasks.fork(ctx.caller, ctx.config, ctx.spaces)?;
    match ctx.scheduler.enqueue(child) {
        EnqueueOutcome::Enqueued | EnqueueOutcome::Rejected(EnqueueRejectReason::Duplicate) => {
            Ok(child.as_raw() as usize)
        }
        EnqueueOutcome::Rejected(reason) => {
            log::warn!(target: "syscall", "fork: child {} not queued ({:?})", child, reason);
            ctx.tasks.discard(child, ctx.spaces);
            Err(Errno::EAGAIN.into())
        }
    }
}

/// Copies one string argument; overlong strings are E2BIG.
fn read_arg(spaces: &AddressSpaceManager, space: AsHandle, va: VirtAddr, max: usize) -> SysResult<Vec<u8>> {
    spaces.copy_in_cstr(space, va, max).map_err(|err| match err {
        AddressSpaceError::InvalidArgs => Error::Errno(Errno::E2BIG),
        other => other.into(),
    })
}

/// Reads a NULL-terminated pointer vector; a null vector is empty.
fn read_vector(spaces: &AddressSpaceManager, space: AsHandle, raw: usize, config: &Config) -> SysResult<Vec<Vec<u8>>> {
    let mut out = Vec::new();
    if raw == 0 {
        return Ok(out);
    }
    let base = user_ptr(raw)?;
    loop {
        let slot = base.offset(out.len() * core::mem::size_of::<usize>()).ok_or(Error::Errno(Errno::EFAULT))?;
        let ptr = spaces.read_word(space, slot)?;
        if ptr == 0 {
            return Ok(out);
        }
        if out.len() == config.max_args {
            return Err(Errno::E2BIG.into());
        }
        out.push(read_arg(spaces, space, user_ptr(ptr)?, config.max_arg_len)?);
    }
}

fn sys_execve(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let space = caller(ctx.tasks, ctx.caller)?.space();
    let path = read_arg(ctx.spaces, space, user_ptr(args.get(0))?, ctx.config.max_arg_len)?;
    let argv = read_vector(ctx.spaces, space, args.get(1), ctx.config)?;
    let envp = read_vector(ctx.spaces, space, args.get(2), ctx.config)?;
    ctx.tasks.exec(ctx.caller, &path, &argv, &envp, ctx.config, ctx.loader, ctx.spaces, ctx.trap_seq)?;
    Err(Error::FrameReplaced)
}

fn sys_waitpid(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let target = WaitTarget::from_raw(args.get(0)).ok_or(Error::Errno(Errno::EINVAL))?;
    let status = match args.get(1) {
        0 => None,
        raw => Some(user_ptr(raw)?),
    };
    let nohang = args.get(2) & WNOHANG != 0;
    match ctx.tasks.wait(ctx.caller, target, status, nohang, ctx.spaces)? {
        WaitOutcome::Reaped { pid, .. } => Ok(pid.as_raw() as usize),
        WaitOutcome::NotReady => Ok(0),
        WaitOutcome::Blocked => Err(Error::Suspended),
    }
}

fn sys_kill(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let target = u32::try_from(args.get(0)).map(Pid::from_raw).map_err(|_| SignalError::NoSuchProcess)?;
    let outcome =
        signal::kill(ctx.tasks, ctx.spaces, Some(ctx.caller), target, args.get(1), ctx.config.trampoline_va)?;
    if !ctx.tasks.state(ctx.caller).is_some_and(TaskState::is_live) {
        return Err(Error::TaskExit);
    }
    if target == ctx.caller && outcome == Delivery::Caught {
        // The handler frame already completed this call.
        return Err(Error::FrameReplaced);
    }
    Ok(0)
}

fn sys_sigaction(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let sig = Signal::new(args.get(0)).ok_or(SignalError::InvalidSignal)?;
    let disposition =
        Disposition::from_raw(args.get(1), SigSet::from_bits(args.get(2) as u32)).ok_or(Error::Errno(Errno::EFAULT))?;
    let old = caller(ctx.tasks, ctx.caller)?.signals_mut().install(sig, disposition)?;
    Ok(old.to_raw())
}

fn sys_sigprocmask(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let how = MaskHow::from_raw(args.get(0)).ok_or(Error::Errno(Errno::EINVAL))?;
    let old = caller(ctx.tasks, ctx.caller)?.signals_mut().set_mask(how, SigSet::from_bits(args.get(1) as u32));
    Ok(old.bits() as usize)
}

fn sys_sigreturn(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    let task = caller(ctx.tasks, ctx.caller)?;
    match signal::sigreturn(task, ctx.spaces) {
        Ok(()) => Err(Error::FrameReplaced),
        Err(err) => {
            log::warn!(target: "syscall", "pid {}: bad signal frame ({:?})", ctx.caller, err);
            ctx.tasks.terminate(ctx.caller, ExitStatus::signaled(Signal::SEGV));
            Err(Error::TaskExit)
        }
    }
}

fn sys_sbrk(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let task = caller(ctx.tasks, ctx.caller)?;
    let space = task.space();
    Ok(task.memory_mut().grow_heap(args.get(0) as isize, ctx.spaces, space)?)
}

fn sys_mmap(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let len = args.get(0);
    if len == 0 {
        return Err(Errno::EINVAL.into());
    }
    let task = caller(ctx.tasks, ctx.caller)?;
    let space = task.space();
    Ok(task.memory_mut().map_anonymous(pages_for(len), ctx.spaces, space)?.raw())
}

fn sys_getpid(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    Ok(ctx.caller.as_raw() as usize)
}

fn sys_getppid(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    let parent = caller(ctx.tasks, ctx.caller)?.parent();
    Ok(parent.map_or(0, |pid| pid.as_raw() as usize))
}

fn sys_sleep(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let deadline = ctx.now.saturating_add(args.get(0) as u64);
    caller(ctx.tasks, ctx.caller)?.block_on(BlockReason::Sleep { deadline });
    Err(Error::Suspended)
}

/// Parks the caller on `err` if it is `WouldBlock`; the read or write restarts after the wake.
fn block_or_fail(task: &mut Task, err: IoError) -> Error {
    match err {
        IoError::WouldBlock(event) => {
            task.block_on(BlockReason::Event(event));
            Error::Reschedule
        }
        other => other.into(),
    }
}

fn sys_read(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let task = caller(ctx.tasks, ctx.caller)?;
    let file = task.files().get(args.get(0)).cloned().ok_or(Error::Errno(Errno::EBADF))?;
    let buf = user_ptr(args.get(1))?;
    let mut chunk = alloc::vec![0u8; cmp::min(args.get(2), PAGE_SIZE)];
    // Bytes taken from the file must have somewhere to land.
    ctx.spaces.check_access(task.space(), buf, chunk.len(), Access::WRITE)?;
    let read = match file.read(&mut chunk) {
        Ok(read) => cmp::min(read, chunk.len()),
        Err(err) => return Err(block_or_fail(task, err)),
    };
    ctx.spaces.copy_out(task.space(), buf, &chunk[..read])?;
    Ok(read)
}

fn sys_write(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let task = caller(ctx.tasks, ctx.caller)?;
    let file = task.files().get(args.get(0)).cloned().ok_or(Error::Errno(Errno::EBADF))?;
    let buf = user_ptr(args.get(1))?;
    let mut chunk = alloc::vec![0u8; cmp::min(args.get(2), PAGE_SIZE)];
    ctx.spaces.copy_in(task.space(), buf, &mut chunk)?;
    file.write(&chunk).map_err(|err| block_or_fail(task, err))
}

fn sys_close(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    if caller(ctx.tasks, ctx.caller)?.files_mut().close(args.get(0)) {
        Ok(0)
    } else {
        Err(Errno::EBADF.into())
    }
}
