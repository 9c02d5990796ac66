// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Hardware seams consumed by the task/address-space core
//! OWNERS: @kernel-hal-team
//! PUBLIC API: Cpu, PhysMemory, Console
//! DEPENDS_ON: types::PhysAddr
//! INVARIANTS: Core subsystems reach hardware only through these traits
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use crate::types::PhysAddr;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub mod virt;

#[cfg(test)]
pub mod testing;

/// Per-hart control used by the dispatcher when switching tasks.
pub trait Cpu {
    /// Unmasks supervisor interrupts.
    fn enable_interrupts(&self);
    /// Masks supervisor interrupts.
    fn disable_interrupts(&self);
    fn interrupts_enabled(&self) -> bool;
    /// Repoints the task-switch register at the kernel stack top used on the next trap.
    fn set_kernel_stack(&self, top: usize);
    /// Installs `root` as the active translation root tagged with `asid`.
    fn activate(&self, root: PhysAddr, asid: u16);
}

/// Access to physical frames for zeroing and kernel/user copies.
pub trait PhysMemory {
    fn read(&self, src: PhysAddr, buf: &mut [u8]);
    fn write(&mut self, dst: PhysAddr, data: &[u8]);
    fn fill(&mut self, dst: PhysAddr, len: usize, byte: u8);

    /// Copies `len` bytes between non-overlapping physical ranges.
    fn copy(&mut self, dst: PhysAddr, src: PhysAddr, len: usize) {
        let mut bounce = [0u8; 256];
        let mut done = 0;
        while done < len {
            let chunk = (len - done).min(bounce.len());
            self.read(src.add(done), &mut bounce[..chunk]);
            self.write(dst.add(done), &bounce[..chunk]);
            done += chunk;
        }
    }
}

/// Byte sink for kernel log lines.
pub trait Console: Sync {
    fn write_str(&self, s: &str);
}
