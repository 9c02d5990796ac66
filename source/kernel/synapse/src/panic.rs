// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Panic handler emitting the message and last trap over UART
//! OWNERS: @kernel-team
//! PUBLIC API: panic handler (no_std)
//! DEPENDS_ON: trap::entry::last_trap(), hal::virt::UartConsole
//! INVARIANTS: Bypasses the logger lock; never returns; no allocations
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use core::fmt::{self, Write};
use core::panic::PanicInfo;

use crate::hal::virt::UartConsole;
use crate::hal::Console;
use crate::trap::{entry, TrapDump};

struct Raw;

impl Write for Raw {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        UartConsole.write_str(s);
        Ok(())
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    let mut w = Raw;
    let _ = writeln!(w, "\nPANIC: {}", info);
    if let Some(frame) = entry::last_trap() {
        let _ = writeln!(w, "PANIC: last trap\n{}", TrapDump(&frame));
    }
    loop {
        // SAFETY: parks the hart until the next interrupt.
        unsafe { core::arch::asm!("wfi", options(nomem, nostack, preserves_flags)) };
    }
}
