// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Trap frame, cause decoding and the interrupt/syscall dispatcher
//! OWNERS: @kernel-trap-team
//! PUBLIC API: TrapFrame, TrapCause, Vector, IrqTable, IrqSink, fmt_trap(), Kernel::handle_trap()
//! DEPENDS_ON: sched::Scheduler, syscall::SyscallTable, signal::deliver, hal::Cpu
//! INVARIANTS: Unclaimed vectors and kernel-mode faults are fatal; user faults become signals
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use core::fmt::{self, Write};

mod dispatch;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub mod entry;
pub mod irq;

pub use irq::{IrqError, IrqSink, IrqTable, Vector};

const INTERRUPT_FLAG: usize = 1 << (usize::BITS - 1);
/// Previous privilege was supervisor.
pub const SSTATUS_SPP: usize = 1 << 8;
/// Interrupts re-enabled on `sret`.
pub const SSTATUS_SPIE: usize = 1 << 5;
/// Supervisor may touch user pages.
pub const SSTATUS_SUM: usize = 1 << 18;

/// Register indices into [`TrapFrame::x`].
pub mod reg {
    pub const RA: usize = 1;
    pub const SP: usize = 2;
    pub const A0: usize = 10;
    pub const A1: usize = 11;
    pub const A2: usize = 12;
    pub const A7: usize = 17;
}

/// Saved register state for an S-mode trap.
/// Must match the trap entry stub's save/restore layout.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrapFrame {
    /// x0..x31 (x0 is always 0; we never write it).
    pub x: [usize; 32],
    pub sepc: usize,
    pub sstatus: usize,
    pub scause: usize,
    pub stval: usize,
}

impl TrapFrame {
    /// Fresh user-mode frame entering at `entry` with stack `sp`.
    pub fn user(entry: usize, sp: usize) -> Self {
        let mut frame = Self { sepc: entry, sstatus: SSTATUS_SPIE, ..Self::default() };
        frame.x[reg::SP] = sp;
        frame
    }

    #[inline]
    pub fn set_x(&mut self, rd: usize, value: usize) {
        if rd != 0 && rd < 32 {
            self.x[rd] = value;
        }
    }

    #[inline]
    pub fn sp(&self) -> usize {
        self.x[reg::SP]
    }

    /// True when the trap was taken from user mode.
    #[inline]
    pub fn from_user(&self) -> bool {
        self.sstatus & SSTATUS_SPP == 0
    }
}

/// Access kind of a faulting memory operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultAccess {
    Fetch,
    Load,
    Store,
}

/// Decoded `scause`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapCause {
    Interrupt(Vector),
    Syscall,
    PageFault { addr: usize, access: FaultAccess },
    AccessFault { addr: usize },
    Misaligned { addr: usize },
    IllegalInstruction,
    Breakpoint,
    Unknown(usize),
}

impl TrapCause {
    pub fn decode(frame: &TrapFrame) -> Self {
        let code = frame.scause & !INTERRUPT_FLAG;
        if is_interrupt(frame.scause) {
            return match u16::try_from(code) {
                Ok(vector) => TrapCause::Interrupt(Vector(vector)),
                Err(_) => TrapCause::Unknown(frame.scause),
            };
        }
        let addr = frame.stval;
        match code {
            0 | 4 | 6 => TrapCause::Misaligned { addr },
            1 | 5 | 7 => TrapCause::AccessFault { addr },
            2 => TrapCause::IllegalInstruction,
            3 => TrapCause::Breakpoint,
            8 => TrapCause::Syscall,
            12 => TrapCause::PageFault { addr, access: FaultAccess::Fetch },
            13 => TrapCause::PageFault { addr, access: FaultAccess::Load },
            15 => TrapCause::PageFault { addr, access: FaultAccess::Store },
            _ => TrapCause::Unknown(frame.scause),
        }
    }
}

#[inline]
pub fn is_interrupt(scause: usize) -> bool {
    scause & INTERRUPT_FLAG != 0
}

pub fn describe_cause(scause: usize) -> &'static str {
    let code = scause & (usize::MAX >> 1);
    if is_interrupt(scause) {
        match code {
            1 => "SupervisorSoftInt",
            5 => "SupervisorTimerInt",
            9 => "SupervisorExternalInt",
            _ => "Interrupt",
        }
    } else {
        match code {
            0 => "InstructionAddressMisaligned",
            1 => "InstructionAccessFault",
            2 => "IllegalInstruction",
            3 => "Breakpoint",
            4 => "LoadAddressMisaligned",
            5 => "LoadAccessFault",
            6 => "StoreAMOAddressMisaligned",
            7 => "StoreAMOAccessFault",
            8 => "EnvironmentCallFromUMode",
            9 => "EnvironmentCallFromSMode",
            12 => "InstructionPageFault",
            13 => "LoadPageFault",
            15 => "StoreAMOPageFault",
            _ => "Exception",
        }
    }
}

pub fn fmt_trap<W: Write>(frame: &TrapFrame, f: &mut W) -> fmt::Result {
    writeln!(f, " sepc=0x{:016x}", frame.sepc)?;
    writeln!(f, " scause=0x{:016x} ({})", frame.scause, describe_cause(frame.scause))?;
    writeln!(f, " stval=0x{:016x}", frame.stval)?;
    writeln!(f, " ra=0x{:016x} sp=0x{:016x}", frame.x[reg::RA], frame.x[reg::SP])?;
    writeln!(f, " a0..a7 = {:016x?}", &frame.x[10..=17])
}

/// Display adapter used in panic messages.
pub struct TrapDump<'a>(pub &'a TrapFrame);

impl fmt::Display for TrapDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_trap(self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::String;

    #[test]
    fn fmt_includes_registers() {
        let mut frame = TrapFrame::default();
        frame.x[10..=17].copy_from_slice(&[1; 8]);
        frame.sepc = 0x2000;
        frame.scause = 9;
        frame.stval = 0x3000;
        let mut out = String::new();
        fmt_trap(&frame, &mut out).unwrap();
        assert!(out.contains("sepc"));
        assert!(out.contains("EnvironmentCallFromSMode"));
        assert!(out.contains("a0..a7"));
    }

    #[test]
    fn decodes_interrupts_and_faults() {
        let mut frame = TrapFrame { scause: INTERRUPT_FLAG | 5, ..TrapFrame::default() };
        assert_eq!(TrapCause::decode(&frame), TrapCause::Interrupt(Vector::SUPERVISOR_TIMER));
        frame.scause = 15;
        frame.stval = 0x3fff_f000;
        assert_eq!(
            TrapCause::decode(&frame),
            TrapCause::PageFault { addr: 0x3fff_f000, access: FaultAccess::Store }
        );
        frame.scause = 8;
        assert_eq!(TrapCause::decode(&frame), TrapCause::Syscall);
        frame.scause = 2;
        assert_eq!(TrapCause::decode(&frame), TrapCause::IllegalInstruction);
    }

    #[test]
    fn x0_is_never_written() {
        let mut frame = TrapFrame::default();
        frame.set_x(0, 7);
        frame.set_x(reg::A0, 9);
        assert_eq!(frame.x[0], 0);
        assert_eq!(frame.x[reg::A0], 9);
    }

    #[test]
    fn user_frames_report_user_mode() {
        let frame = TrapFrame::user(0x1_0000, 0x4000_0000);
        assert!(frame.from_user());
        assert_eq!(frame.sp(), 0x4000_0000);
        let kernel = TrapFrame { sstatus: SSTATUS_SPP, ..TrapFrame::default() };
        assert!(!kernel.from_user());
    }
}
