// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall dispatcher and error handling
//! OWNERS: @kernel-team
//! PUBLIC API: SyscallTable, Args, Error, Handler, SYSCALL_* IDs, errno::Errno
//! DEPENDS_ON: mm, task, signal, dev, syscall::api
//! INVARIANTS: Fixed MAX_SYSCALL window; stable IDs; one errno mapping for every subsystem error
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

pub mod api;
pub mod errno;

use core::fmt;

use crate::dev::IoError;
use crate::mm::AddressSpaceError;
use crate::signal::SignalError;
use crate::task::{LoadError, SpawnError, WaitError};

use self::errno::Errno;

/// Maximum number of syscalls supported by the table.
const MAX_SYSCALL: usize = 32;

/// Result type used by syscall handlers.
pub type SysResult<T> = Result<T, Error>;

/// Syscall arguments passed in registers a0-a2.
#[derive(Default, Clone, Copy, Debug)]
pub struct Args {
    regs: [usize; 3],
}

impl Args {
    pub const fn new(regs: [usize; 3]) -> Self {
        Self { regs }
    }

    /// Returns the raw register at `index`.
    pub fn get(&self, index: usize) -> usize {
        self.regs[index]
    }
}

/// Public syscall numbers.
pub const SYSCALL_YIELD: usize = 0;
pub const SYSCALL_EXIT: usize = 1;
pub const SYSCALL_FORK: usize = 2;
pub const SYSCALL_EXECVE: usize = 3;
pub const SYSCALL_WAITPID: usize = 4;
pub const SYSCALL_KILL: usize = 5;
pub const SYSCALL_SIGACTION: usize = 6;
pub const SYSCALL_SIGPROCMASK: usize = 7;
/// Issued by the signal trampoline; restores the pre-handler context.
pub const SYSCALL_SIGRETURN: usize = 8;
pub const SYSCALL_SBRK: usize = 9;
pub const SYSCALL_MMAP: usize = 10;
pub const SYSCALL_GETPID: usize = 11;
pub const SYSCALL_GETPPID: usize = 12;
pub const SYSCALL_SLEEP: usize = 13;
pub const SYSCALL_READ: usize = 14;
pub const SYSCALL_WRITE: usize = 15;
pub const SYSCALL_CLOSE: usize = 16;

/// `waitpid` option: return 0 instead of blocking.
pub const WNOHANG: usize = 1;

/// Error returned by the dispatcher and handler stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Syscall number not present in the dispatch table.
    InvalidSyscall,
    /// Handler-level failure with a direct errno.
    Errno(Errno),
    AddressSpace(AddressSpaceError),
    Spawn(SpawnError),
    Wait(WaitError),
    Signal(SignalError),
    Io(IoError),
    /// Current task terminated and should not resume.
    TaskExit,
    /// Request a reschedule **without** advancing `sepc`; the call is retried
    /// when the task runs again.
    Reschedule,
    /// Caller is blocked past the ecall; the waker writes the result.
    Suspended,
    /// The saved frame was rewritten (exec, sigreturn, caught self-signal)
    /// and must resume as-is.
    FrameReplaced,
}

impl Error {
    /// POSIX errno reported to the caller for this failure.
    pub fn errno(&self) -> Errno {
        match self {
            Self::InvalidSyscall => Errno::ENOSYS,
            Self::Errno(errno) => *errno,
            Self::AddressSpace(err) => address_space_errno(*err),
            Self::Spawn(err) => match err {
                SpawnError::InvalidParent => Errno::ESRCH,
                SpawnError::TableFull => Errno::EAGAIN,
                SpawnError::Bootstrap => Errno::EPERM,
                SpawnError::Load(LoadError::NotFound) => Errno::ENOENT,
                SpawnError::Load(LoadError::Malformed) => Errno::ENOEXEC,
                SpawnError::Load(LoadError::AddressSpace(err)) | SpawnError::AddressSpace(err) => {
                    address_space_errno(*err)
                }
            },
            Self::Wait(err) => match err {
                WaitError::InvalidTarget => Errno::EINVAL,
                WaitError::NoSuchChild | WaitError::NoChildren => Errno::ECHILD,
                WaitError::Fault(_) => Errno::EFAULT,
            },
            Self::Signal(err) => match err {
                SignalError::InvalidSignal => Errno::EINVAL,
                SignalError::NoSuchProcess => Errno::ESRCH,
                SignalError::PermissionDenied => Errno::EPERM,
            },
            Self::Io(err) => match err {
                IoError::WouldBlock(_) => Errno::EAGAIN,
                IoError::Io => Errno::EIO,
                IoError::Unsupported | IoError::Invalid => Errno::EINVAL,
            },
            // Control-flow results never reach the caller's a0.
            Self::TaskExit | Self::Reschedule | Self::Suspended | Self::FrameReplaced => Errno::EINTR,
        }
    }
}

fn address_space_errno(err: AddressSpaceError) -> Errno {
    match err {
        AddressSpaceError::OutOfMemory | AddressSpaceError::NoVirtualSpace | AddressSpaceError::AsidExhausted => {
            Errno::ENOMEM
        }
        AddressSpaceError::NotMapped | AddressSpaceError::PermissionDenied | AddressSpaceError::OutOfRange => {
            Errno::EFAULT
        }
        AddressSpaceError::InUse => Errno::EBUSY,
        AddressSpaceError::KernelSpace => Errno::EPERM,
        AddressSpaceError::InvalidArgs
        | AddressSpaceError::InvalidHandle
        | AddressSpaceError::Overlap
        | AddressSpaceError::Mapping(_) => Errno::EINVAL,
    }
}

impl From<Errno> for Error {
    fn from(value: Errno) -> Self {
        Self::Errno(value)
    }
}

impl From<AddressSpaceError> for Error {
    fn from(value: AddressSpaceError) -> Self {
        Self::AddressSpace(value)
    }
}

impl From<SpawnError> for Error {
    fn from(value: SpawnError) -> Self {
        Self::Spawn(value)
    }
}

impl From<WaitError> for Error {
    fn from(value: WaitError) -> Self {
        Self::Wait(value)
    }
}

impl From<SignalError> for Error {
    fn from(value: SignalError) -> Self {
        Self::Signal(value)
    }
}

impl From<IoError> for Error {
    fn from(value: IoError) -> Self {
        Self::Io(value)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Type alias for a syscall handler.
pub type Handler = fn(&mut api::Context<'_>, &Args) -> SysResult<usize>;

/// Dispatch table storing handlers by syscall number.
pub struct SyscallTable {
    handlers: [Option<Handler>; MAX_SYSCALL],
}

impl SyscallTable {
    /// Creates an empty dispatch table.
    pub const fn new() -> Self {
        const NONE: Option<Handler> = None;
        Self { handlers: [NONE; MAX_SYSCALL] }
    }

    /// Table with every handler in [`api`] installed.
    pub fn standard() -> Self {
        let mut table = Self::new();
        api::install_handlers(&mut table);
        table
    }

    pub fn register(&mut self, number: usize, handler: Handler) {
        if number < MAX_SYSCALL {
            self.handlers[number] = Some(handler);
        }
    }

    /// Executes the handler referenced by `number`.
    #[must_use]
    pub fn dispatch(&self, number: usize, ctx: &mut api::Context<'_>, args: &Args) -> SysResult<usize> {
        self.handlers
            .get(number)
            .and_then(|entry| *entry)
            .ok_or(Error::InvalidSyscall)
            .and_then(|handler| handler(ctx, args))
    }
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::standard()
    }
}
