// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Host fakes for the HAL traits.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};

use super::{Console, Cpu, PhysMemory};
use crate::mm::PAGE_SIZE;
use crate::types::PhysAddr;

#[derive(Default)]
struct CpuState {
    irq_enabled: Cell<bool>,
    enables: Cell<usize>,
    kernel_stack: Cell<usize>,
    activations: RefCell<Vec<(PhysAddr, u16)>>,
}

/// Records every CPU control call; clones share state.
#[derive(Clone, Default)]
pub struct FakeCpu {
    state: Rc<CpuState>,
}

impl FakeCpu {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable_count(&self) -> usize {
        self.state.enables.get()
    }

    pub fn kernel_stack(&self) -> usize {
        self.state.kernel_stack.get()
    }

    pub fn last_activation(&self) -> Option<(PhysAddr, u16)> {
        self.state.activations.borrow().last().copied()
    }
}

impl Cpu for FakeCpu {
    fn enable_interrupts(&self) {
        self.state.irq_enabled.set(true);
        self.state.enables.set(self.state.enables.get() + 1);
    }

    fn disable_interrupts(&self) {
        self.state.irq_enabled.set(false);
    }

    fn interrupts_enabled(&self) -> bool {
        self.state.irq_enabled.get()
    }

    fn set_kernel_stack(&self, top: usize) {
        self.state.kernel_stack.set(top);
    }

    fn activate(&self, root: PhysAddr, asid: u16) {
        self.state.activations.borrow_mut().push((root, asid));
    }
}

/// Sparse RAM; untouched frames read as zero.
#[derive(Default)]
pub struct RamMemory {
    frames: BTreeMap<usize, Box<[u8; PAGE_SIZE]>>,
}

impl RamMemory {
    pub fn new() -> Self {
        Self::default()
    }

    fn frame_mut(&mut self, number: usize) -> &mut [u8; PAGE_SIZE] {
        self.frames.entry(number).or_insert_with(|| Box::new([0; PAGE_SIZE]))
    }
}

impl PhysMemory for RamMemory {
    fn read(&self, src: PhysAddr, buf: &mut [u8]) {
        let mut done = 0;
        while done < buf.len() {
            let addr = src.raw() + done;
            let offset = addr % PAGE_SIZE;
            let chunk = (PAGE_SIZE - offset).min(buf.len() - done);
            match self.frames.get(&(addr / PAGE_SIZE)) {
                Some(frame) => buf[done..done + chunk].copy_from_slice(&frame[offset..offset + chunk]),
                None => buf[done..done + chunk].fill(0),
            }
            done += chunk;
        }
    }

    fn write(&mut self, dst: PhysAddr, data: &[u8]) {
        let mut done = 0;
        while done < data.len() {
            let addr = dst.raw() + done;
            let offset = addr % PAGE_SIZE;
            let chunk = (PAGE_SIZE - offset).min(data.len() - done);
            self.frame_mut(addr / PAGE_SIZE)[offset..offset + chunk].copy_from_slice(&data[done..done + chunk]);
            done += chunk;
        }
    }

    fn fill(&mut self, dst: PhysAddr, len: usize, byte: u8) {
        let mut done = 0;
        while done < len {
            let addr = dst.raw() + done;
            let offset = addr % PAGE_SIZE;
            let chunk = (PAGE_SIZE - offset).min(len - done);
            self.frame_mut(addr / PAGE_SIZE)[offset..offset + chunk].fill(byte);
            done += chunk;
        }
    }
}

/// Console capturing everything written to it.
#[derive(Default)]
pub struct RecordingConsole {
    out: spin::Mutex<String>,
}

impl RecordingConsole {
    pub fn contents(&self) -> String {
        self.out.lock().clone()
    }
}

impl Console for RecordingConsole {
    fn write_str(&self, s: &str) {
        self.out.lock().push_str(s);
    }
}
