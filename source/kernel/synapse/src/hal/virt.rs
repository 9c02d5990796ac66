// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! HAL implementation targeting QEMU's `virt` machine.

use core::ptr::{read_volatile, write_volatile};

use super::{Console, Cpu, PhysMemory};
use crate::sync::poll_bounded;
use crate::types::PhysAddr;

const UART0_BASE: usize = 0x1000_0000;
const UART_TX: usize = 0x0;
const UART_LSR: usize = 0x5;
const LSR_TX_IDLE: u8 = 1 << 5;
/// Transmitter polls per byte before the byte is dropped.
const TX_POLL_LIMIT: u32 = 100_000;

/// Supervisor CSR access for the boot hart.
pub struct VirtCpu;

impl Cpu for VirtCpu {
    fn enable_interrupts(&self) {
        // SAFETY: toggling SIE only affects interrupt delivery on this hart.
        unsafe { riscv::register::sstatus::set_sie() };
    }

    fn disable_interrupts(&self) {
        // SAFETY: see `enable_interrupts`.
        unsafe { riscv::register::sstatus::clear_sie() };
    }

    fn interrupts_enabled(&self) -> bool {
        riscv::register::sstatus::read().sie()
    }

    fn set_kernel_stack(&self, top: usize) {
        // Loaded into sscratch by the vector on the way back to user mode.
        crate::trap::entry::set_kernel_stack(top);
    }

    fn activate(&self, root: PhysAddr, asid: u16) {
        // SAFETY: `root` is a live Sv39 root whose upper half maps the kernel.
        unsafe {
            riscv::register::satp::set(riscv::register::satp::Mode::Sv39, asid as usize, root.raw() >> 12);
            riscv::asm::sfence_vma_all();
        }
    }
}

/// Physical memory reached through the kernel's identity window.
pub struct IdentityMemory;

impl PhysMemory for IdentityMemory {
    fn read(&self, src: PhysAddr, buf: &mut [u8]) {
        // SAFETY: the frame allocator only hands out identity-mapped RAM.
        unsafe { core::ptr::copy_nonoverlapping(src.raw() as *const u8, buf.as_mut_ptr(), buf.len()) };
    }

    fn write(&mut self, dst: PhysAddr, data: &[u8]) {
        // SAFETY: see `read`.
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), dst.raw() as *mut u8, data.len()) };
    }

    fn fill(&mut self, dst: PhysAddr, len: usize, byte: u8) {
        // SAFETY: see `read`.
        unsafe { core::ptr::write_bytes(dst.raw() as *mut u8, byte, len) };
    }

    fn copy(&mut self, dst: PhysAddr, src: PhysAddr, len: usize) {
        // SAFETY: see `read`; frames of distinct ranges never overlap.
        unsafe { core::ptr::copy_nonoverlapping(src.raw() as *const u8, dst.raw() as *mut u8, len) };
    }
}

/// Polled NS16550 console on UART0.
pub struct UartConsole;

impl UartConsole {
    fn put(byte: u8) {
        // SAFETY: UART0 is identity mapped for the kernel's lifetime.
        let idle = || unsafe { read_volatile((UART0_BASE + UART_LSR) as *const u8) & LSR_TX_IDLE != 0 };
        if poll_bounded(TX_POLL_LIMIT, idle).is_ok() {
            // SAFETY: as above.
            unsafe { write_volatile((UART0_BASE + UART_TX) as *mut u8, byte) };
        }
    }
}

impl Console for UartConsole {
    fn write_str(&self, s: &str) {
        for &byte in s.as_bytes() {
            if byte == b'\n' {
                Self::put(b'\r');
            }
            Self::put(byte);
        }
    }
}
