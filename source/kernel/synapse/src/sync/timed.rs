// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

use core::ops::{Deref, DerefMut};

/// Lock was still held after the spin budget ran out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockTimeout;

/// Polled condition never became true within the budget.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollTimeout;

/// Spin mutex that can only be taken with an explicit spin budget.
pub struct TimedLock<T> {
    inner: spin::Mutex<T>,
}

impl<T> TimedLock<T> {
    pub const fn new(value: T) -> Self {
        Self { inner: spin::Mutex::new(value) }
    }

    /// Attempts the lock up to `spins` times (at least once).
    pub fn try_lock_for(&self, spins: u32) -> Result<TimedLockGuard<'_, T>, LockTimeout> {
        for _ in 0..spins.max(1) {
            if let Some(guard) = self.inner.try_lock() {
                return Ok(TimedLockGuard { guard });
            }
            core::hint::spin_loop();
        }
        Err(LockTimeout)
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

pub struct TimedLockGuard<'a, T> {
    guard: spin::MutexGuard<'a, T>,
}

impl<T> Deref for TimedLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<T> DerefMut for TimedLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

/// Evaluates `cond` until it holds, at most `limit` times. Returns the attempts used.
pub fn poll_bounded(limit: u32, mut cond: impl FnMut() -> bool) -> Result<u32, PollTimeout> {
    for attempt in 1..=limit {
        if cond() {
            return Ok(attempt);
        }
        core::hint::spin_loop();
    }
    Err(PollTimeout)
}
