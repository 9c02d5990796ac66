// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared host fixtures: contexts, loaders and booted kernels without hardware.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::config::Config;
use crate::hal::testing::{FakeCpu, RamMemory};
use crate::kernel::Kernel;
use crate::mm::{Access, AddressSpaceManager, AllocRequest, AsHandle, FrameAllocator, RangeKind, PAGE_SIZE};
use crate::signal::trampoline_code;
use crate::task::image::{ImageLoader, LoadError, LoadedImage};
use crate::task::{Credentials, TaskTable};
use crate::types::{PhysAddr, Pid, VirtAddr};

pub const RAM_BASE: PhysAddr = PhysAddr::new(0x8000_0000);
pub const RAM_FRAMES: usize = 1024;
/// Where `StubLoader` places program images.
pub const IMAGE_BASE: usize = 0x1_0000;

pub fn config() -> Config {
    Config::new().with_preempt_period(4)
}

pub fn manager() -> AddressSpaceManager {
    manager_with_frames(RAM_FRAMES)
}

/// Manager over `frames` frames with the signal trampoline installed, as
/// `Kernel::new` leaves it; the trampoline takes one frame.
pub fn manager_with_frames(frames: usize) -> AddressSpaceManager {
    let pool = FrameAllocator::new(RAM_BASE, frames);
    let built = AddressSpaceManager::new(&config(), pool, Box::new(RamMemory::new())).and_then(|mut manager| {
        manager.install_trampoline(&trampoline_code())?;
        Ok(manager)
    });
    match built {
        Ok(manager) => manager,
        Err(err) => panic!("fixture manager: {err:?}"),
    }
}

/// Loader mapping one read/execute page of fixed bytes; paths starting with
/// `missing` fail to load.
pub struct StubLoader;

impl ImageLoader for StubLoader {
    fn load(
        &self,
        path: &[u8],
        spaces: &mut AddressSpaceManager,
        space: AsHandle,
    ) -> Result<LoadedImage, LoadError> {
        if path.starts_with(b"missing") {
            return Err(LoadError::NotFound);
        }
        let base = VirtAddr::new_unchecked(IMAGE_BASE);
        spaces.allocate(space, 1, AllocRequest::new(Access::USER_RX, RangeKind::CopyOnFork).at(base).zeroed())?;
        Ok(LoadedImage { entry: base, end: VirtAddr::new_unchecked(IMAGE_BASE + PAGE_SIZE) })
    }
}

pub fn table(spaces: &AddressSpaceManager) -> TaskTable {
    TaskTable::new(spaces.kernel(), config().max_tasks)
}

/// Creates a root-owned task running the stub image.
pub fn spawn(tasks: &mut TaskTable, spaces: &mut AddressSpaceManager, parent: Option<Pid>) -> Pid {
    let argv = args(&["test"]);
    match tasks.create(parent, Credentials::ROOT, b"/bin/test", &argv, &[], &config(), &StubLoader, spaces) {
        Ok(pid) => pid,
        Err(err) => panic!("fixture spawn: {err:?}"),
    }
}

pub fn kernel() -> (Kernel, FakeCpu) {
    kernel_with(config())
}

pub fn kernel_with(config: Config) -> (Kernel, FakeCpu) {
    let cpu = FakeCpu::new();
    let frames = FrameAllocator::new(RAM_BASE, RAM_FRAMES);
    match Kernel::new(config, Box::new(cpu.clone()), Box::new(RamMemory::new()), frames, Box::new(StubLoader)) {
        Ok(kernel) => (kernel, cpu),
        Err(err) => panic!("fixture kernel: {err:?}"),
    }
}

pub fn args(items: &[&str]) -> Vec<Vec<u8>> {
    items.iter().map(|item| item.as_bytes().to_vec()).collect()
}
