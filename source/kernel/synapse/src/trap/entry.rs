// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Trap vector glue: external ASM prologue/epilogue, SBI timer re-arm and the
//! hand-off into [`Kernel::handle_trap`].

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use super::{TrapCause, TrapFrame, SSTATUS_SPIE, SSTATUS_SPP};
use crate::kernel::Kernel;
use crate::sync::TimedLock;

core::arch::global_asm!(
    include_str!("entry.S"),
    TF_SIZE     = const core::mem::size_of::<TrapFrame>(),
    OFF_SEPC    = const 32 * 8,
    OFF_SSTATUS = const 33 * 8,
    OFF_SCAUSE  = const 34 * 8,
    OFF_STVAL   = const 35 * 8,
    SPP         = const SSTATUS_SPP,
);

extern "C" {
    fn __trap_vector();
}

static_assertions::const_assert_eq!(core::mem::size_of::<TrapFrame>(), 36 * 8);

/// QEMU `virt` mtime frequency.
const TIMEBASE_HZ: u64 = 10_000_000;
const REGISTER_SPINS: u32 = 1_000;

/// Kernel stack top loaded into sscratch before returning to user mode.
#[no_mangle]
static SYNAPSE_KSTACK_TOP: AtomicUsize = AtomicUsize::new(0);

/// Address of the registered [`Kernel`].
static KERNEL: TimedLock<Option<usize>> = TimedLock::new(None);
static LAST_TRAP: spin::Mutex<Option<TrapFrame>> = spin::Mutex::new(None);
static IN_TRAP: AtomicBool = AtomicBool::new(false);
static TICK_NS: AtomicU64 = AtomicU64::new(0);
static TIMER_VECTOR: AtomicUsize = AtomicUsize::new(usize::MAX);

/// Sets the stack the next user-mode trap lands on.
pub(crate) fn set_kernel_stack(top: usize) {
    SYNAPSE_KSTACK_TOP.store(top, Ordering::Relaxed);
}

/// Last frame seen by the vector, for panic diagnostics.
pub fn last_trap() -> Option<TrapFrame> {
    LAST_TRAP.try_lock().and_then(|frame| *frame)
}

/// Registers the kernel every trap is dispatched to.
///
/// # Safety
/// Single hart; `kernel` must not be touched outside trap context afterwards.
pub unsafe fn register_kernel(kernel: &'static mut Kernel) {
    TICK_NS.store(kernel.config().tick_ns, Ordering::Relaxed);
    TIMER_VECTOR.store(kernel.config().timer_vector.index(), Ordering::Relaxed);
    let addr = kernel as *mut Kernel as usize;
    match KERNEL.try_lock_for(REGISTER_SPINS) {
        Ok(mut slot) => *slot = Some(addr),
        Err(_) => panic!("trap registration lock held"),
    }
}

/// Installs the trap vector and arms the first tick.
///
/// # Safety
/// Call once during early boot, after [`register_kernel`] and before enabling SIE.
pub unsafe fn install_vector() {
    // SAFETY: sscratch is consumed only by the trap vector; 0 marks kernel mode.
    unsafe {
        riscv::register::sscratch::write(0);
        riscv::register::stvec::write(__trap_vector as usize, riscv::register::stvec::TrapMode::Direct);
        rearm_timer();
        riscv::register::sie::set_stimer();
    }
}

fn rearm_timer() {
    let cycles = TICK_NS.load(Ordering::Relaxed).saturating_mul(TIMEBASE_HZ) / 1_000_000_000;
    let now = riscv::register::time::read() as u64;
    let _ = sbi_rt::set_timer(now.wrapping_add(cycles.max(1)));
}

fn registered() -> Option<usize> {
    KERNEL.try_lock_for(REGISTER_SPINS).ok().and_then(|slot| *slot)
}

// ——— Rust trap handler called from assembly ———

#[no_mangle]
extern "C" fn __trap_rust(frame: &mut TrapFrame) {
    if let Some(mut last) = LAST_TRAP.try_lock() {
        *last = Some(*frame);
    }
    let cause = TrapCause::decode(frame);
    let timer = matches!(cause, TrapCause::Interrupt(vector) if vector.index() == TIMER_VECTOR.load(Ordering::Relaxed));
    if timer {
        rearm_timer();
    }

    if IN_TRAP.swap(true, Ordering::Acquire) {
        // Raised inside a reentrant handler while the kernel is borrowed:
        // ticks are dropped, device lines stay masked until the outer sret.
        match cause {
            TrapCause::Interrupt(_) if timer => {}
            TrapCause::Interrupt(_) => frame.sstatus &= !SSTATUS_SPIE,
            _ => panic!("nested kernel fault {:?}\n{}", cause, super::TrapDump(frame)),
        }
        return;
    }
    let Some(addr) = registered() else {
        panic!("trap before kernel registration\n{}", super::TrapDump(frame));
    };
    // SAFETY: registered once; IN_TRAP guarantees this is the only live borrow.
    let kernel = unsafe { &mut *(addr as *mut Kernel) };
    kernel.handle_trap(frame);
    IN_TRAP.store(false, Ordering::Release);
}
