// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: POSIX-style signals: numbers, dispositions, masks and exit status encoding
//! OWNERS: @kernel-sched-team
//! PUBLIC API: Signal, SigSet, Disposition, SignalState, ExitStatus, deliver(), sigreturn(), may_signal()
//! DEPENDS_ON: task::TaskTable, mm::AddressSpaceManager, trap::TrapFrame
//! INVARIANTS: SIGKILL/SIGSTOP are never caught or masked; dead tasks never receive signals
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

mod deliver;

#[cfg(test)]
mod tests_prop;

use core::fmt;

use crate::types::VirtAddr;

pub use deliver::{
    deliver, deliver_fault, kill, may_signal, sigreturn, trampoline_code, Delivery, SignalFrame, SIGNAL_FRAME_SIZE,
};

/// Number of disposition slots (signal 0 is the probe and has none).
pub const NSIG: usize = 32;

/// A signal number in `1..NSIG`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Signal(u8);

impl Signal {
    pub const HUP: Self = Self(1);
    pub const INT: Self = Self(2);
    pub const QUIT: Self = Self(3);
    pub const ILL: Self = Self(4);
    pub const TRAP: Self = Self(5);
    pub const ABRT: Self = Self(6);
    pub const BUS: Self = Self(7);
    pub const FPE: Self = Self(8);
    pub const KILL: Self = Self(9);
    pub const USR1: Self = Self(10);
    pub const SEGV: Self = Self(11);
    pub const USR2: Self = Self(12);
    pub const PIPE: Self = Self(13);
    pub const ALRM: Self = Self(14);
    pub const TERM: Self = Self(15);
    pub const CHLD: Self = Self(17);
    pub const CONT: Self = Self(18);
    pub const STOP: Self = Self(19);
    pub const TSTP: Self = Self(20);
    pub const URG: Self = Self(23);
    pub const WINCH: Self = Self(28);
    pub const SYS: Self = Self(31);

    pub const fn new(raw: usize) -> Option<Self> {
        if raw >= 1 && raw < NSIG {
            Some(Self(raw as u8))
        } else {
            None
        }
    }

    pub const fn number(self) -> u8 {
        self.0
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// SIGKILL and SIGSTOP bypass dispositions and masks.
    pub const fn is_unblockable(self) -> bool {
        self.0 == Self::KILL.0 || self.0 == Self::STOP.0
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sig{}", self.0)
    }
}

/// Bit set of signals; bit `n` stands for signal `n`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SigSet(u32);

impl SigSet {
    pub const EMPTY: Self = Self(0);
    const UNBLOCKABLE: u32 = (1 << 9) | (1 << 19);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits & !1)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn of(sig: Signal) -> Self {
        Self(1 << sig.0)
    }

    pub const fn contains(self, sig: Signal) -> bool {
        self.0 & (1 << sig.0) != 0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Removes SIGKILL and SIGSTOP.
    pub const fn sanitized(self) -> Self {
        Self(self.0 & !Self::UNBLOCKABLE)
    }
}

/// Action taken on delivery.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Disposition {
    #[default]
    Default,
    Ignore,
    Handler { entry: VirtAddr, mask: SigSet },
}

/// Raw `sigaction` handler values.
pub const SIG_DFL: usize = 0;
pub const SIG_IGN: usize = 1;

impl Disposition {
    pub fn from_raw(handler: usize, mask: SigSet) -> Option<Self> {
        match handler {
            SIG_DFL => Some(Self::Default),
            SIG_IGN => Some(Self::Ignore),
            entry => VirtAddr::new(entry).map(|entry| Self::Handler { entry, mask }),
        }
    }

    pub fn to_raw(self) -> usize {
        match self {
            Self::Default => SIG_DFL,
            Self::Ignore => SIG_IGN,
            Self::Handler { entry, .. } => entry.raw(),
        }
    }
}

/// `sigprocmask` operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaskHow {
    Block,
    Unblock,
    SetMask,
}

impl MaskHow {
    pub fn from_raw(raw: usize) -> Option<Self> {
        match raw {
            0 => Some(Self::Block),
            1 => Some(Self::Unblock),
            2 => Some(Self::SetMask),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use]
pub enum SignalError {
    InvalidSignal,
    NoSuchProcess,
    PermissionDenied,
}

/// Per-task dispositions and blocked mask.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignalState {
    handlers: [Disposition; NSIG],
    mask: SigSet,
}

impl SignalState {
    pub const fn new() -> Self {
        Self { handlers: [Disposition::Default; NSIG], mask: SigSet::EMPTY }
    }

    pub fn disposition(&self, sig: Signal) -> Disposition {
        self.handlers[sig.index()]
    }

    /// Replaces the disposition of `sig`, returning the previous one.
    pub fn install(&mut self, sig: Signal, disposition: Disposition) -> Result<Disposition, SignalError> {
        if sig.is_unblockable() {
            return Err(SignalError::InvalidSignal);
        }
        let Disposition::Handler { entry, mask } = disposition else {
            return Ok(core::mem::replace(&mut self.handlers[sig.index()], disposition));
        };
        let sanitized = Disposition::Handler { entry, mask: mask.sanitized() };
        Ok(core::mem::replace(&mut self.handlers[sig.index()], sanitized))
    }

    pub fn mask(&self) -> SigSet {
        self.mask
    }

    /// Applies `how` to the mask and returns the previous mask.
    pub fn set_mask(&mut self, how: MaskHow, set: SigSet) -> SigSet {
        let old = self.mask;
        self.mask = match how {
            MaskHow::Block => old.union(set),
            MaskHow::Unblock => old.difference(set),
            MaskHow::SetMask => set,
        }
        .sanitized();
        old
    }

    pub(crate) fn replace_mask(&mut self, mask: SigSet) {
        self.mask = mask.sanitized();
    }

    /// Caught signals return to Default across exec; ignored ones stay ignored.
    pub fn reset_for_exec(&mut self) {
        for slot in self.handlers.iter_mut() {
            if matches!(slot, Disposition::Handler { .. }) {
                *slot = Disposition::Default;
            }
        }
    }
}

impl Default for SignalState {
    fn default() -> Self {
        Self::new()
    }
}

/// POSIX wait status word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExitStatus(u32);

impl ExitStatus {
    pub const fn exited(code: usize) -> Self {
        Self(((code & 0xff) as u32) << 8)
    }

    pub const fn signaled(sig: Signal) -> Self {
        Self((sig.0 & 0x7f) as u32)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Exit code when the task exited normally.
    pub const fn code(self) -> Option<u8> {
        if self.0 & 0x7f == 0 {
            Some((self.0 >> 8) as u8)
        } else {
            None
        }
    }

    /// Terminating signal when the task was killed.
    pub const fn signal(self) -> Option<Signal> {
        Signal::new((self.0 & 0x7f) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kill_and_stop_cannot_be_caught() {
        let mut state = SignalState::new();
        assert_eq!(state.install(Signal::KILL, Disposition::Ignore), Err(SignalError::InvalidSignal));
        assert_eq!(state.install(Signal::STOP, Disposition::Ignore), Err(SignalError::InvalidSignal));
        assert_eq!(state.install(Signal::TERM, Disposition::Ignore), Ok(Disposition::Default));
        assert_eq!(state.disposition(Signal::TERM), Disposition::Ignore);
    }

    #[test]
    fn masks_never_hold_unblockable_signals() {
        let mut state = SignalState::new();
        let all = SigSet::from_bits(u32::MAX);
        assert_eq!(state.set_mask(MaskHow::Block, all), SigSet::EMPTY);
        assert!(!state.mask().contains(Signal::KILL));
        assert!(!state.mask().contains(Signal::STOP));
        assert!(state.mask().contains(Signal::TERM));
        state.set_mask(MaskHow::Unblock, SigSet::of(Signal::TERM));
        assert!(!state.mask().contains(Signal::TERM));
        state.set_mask(MaskHow::SetMask, SigSet::of(Signal::USR1));
        assert_eq!(state.mask(), SigSet::of(Signal::USR1));
    }

    #[test]
    fn exec_resets_only_caught_signals() {
        let mut state = SignalState::new();
        let entry = VirtAddr::new(0x1_0040).unwrap();
        state.install(Signal::USR1, Disposition::Handler { entry, mask: SigSet::EMPTY }).unwrap();
        state.install(Signal::INT, Disposition::Ignore).unwrap();
        state.set_mask(MaskHow::Block, SigSet::of(Signal::USR2));
        state.reset_for_exec();
        assert_eq!(state.disposition(Signal::USR1), Disposition::Default);
        assert_eq!(state.disposition(Signal::INT), Disposition::Ignore);
        assert!(state.mask().contains(Signal::USR2));
    }

    #[test]
    fn exit_status_encoding() {
        let exited = ExitStatus::exited(0x1_03);
        assert_eq!(exited.raw(), 0x300);
        assert_eq!(exited.code(), Some(3));
        assert_eq!(exited.signal(), None);
        let killed = ExitStatus::signaled(Signal::KILL);
        assert_eq!(killed.raw(), 9);
        assert_eq!(killed.code(), None);
        assert_eq!(killed.signal(), Some(Signal::KILL));
    }

    #[test]
    fn raw_dispositions() {
        assert_eq!(Disposition::from_raw(SIG_DFL, SigSet::EMPTY), Some(Disposition::Default));
        assert_eq!(Disposition::from_raw(SIG_IGN, SigSet::EMPTY), Some(Disposition::Ignore));
        let handler = Disposition::from_raw(0x2000, SigSet::EMPTY).unwrap();
        assert_eq!(handler.to_raw(), 0x2000);
        assert_eq!(Signal::new(0), None);
        assert_eq!(Signal::new(32), None);
    }
}
