// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-vector interrupt sink registry.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use crate::kernel::Kernel;

/// Number of vectors tracked by the table.
pub const MAX_VECTORS: usize = 256;
/// First vector used for PLIC-routed device interrupts.
const EXTERNAL_BASE: u16 = 16;

/// Interrupt vector number as reported by `scause` (device IRQs are offset).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Vector(pub u16);

impl Vector {
    pub const SUPERVISOR_SOFT: Self = Self(1);
    pub const SUPERVISOR_TIMER: Self = Self(5);
    pub const SUPERVISOR_EXTERNAL: Self = Self(9);

    /// Vector assigned to PLIC source `irq`.
    pub const fn external(irq: u16) -> Self {
        Self(EXTERNAL_BASE + irq)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Vector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Consumer of an interrupt vector (device driver, timer work, ...).
pub trait IrqSink {
    fn handle(&self, vector: Vector, kernel: &mut Kernel);
}

#[derive(Clone)]
pub struct Registration {
    pub sink: Arc<dyn IrqSink>,
    /// Run with interrupts re-enabled.
    pub reentrant: bool,
}

#[derive(Clone)]
struct Periodic {
    period: u64,
    sink: Arc<dyn IrqSink>,
}

/// Registration failures; the table is unchanged when one is returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use]
pub enum IrqError {
    InvalidVector(Vector),
    InvalidPeriod,
}

/// Vector -> handlers mapping plus periodic timer work.
pub struct IrqTable {
    vectors: Vec<Vec<Registration>>,
    periodic: Vec<Periodic>,
}

impl IrqTable {
    pub fn new() -> Self {
        Self { vectors: (0..MAX_VECTORS).map(|_| Vec::new()).collect(), periodic: Vec::new() }
    }

    pub fn register(&mut self, vector: Vector, sink: Arc<dyn IrqSink>, reentrant: bool) -> Result<(), IrqError> {
        let slot = self.vectors.get_mut(vector.index()).ok_or(IrqError::InvalidVector(vector))?;
        slot.push(Registration { sink, reentrant });
        log::debug!(target: "trap", "vector {} registered (reentrant={})", vector, reentrant);
        Ok(())
    }

    /// Registers `sink` on every vector of `range`; nothing is registered if any vector is invalid.
    pub fn register_range(
        &mut self,
        range: core::ops::Range<u16>,
        sink: Arc<dyn IrqSink>,
        reentrant: bool,
    ) -> Result<(), IrqError> {
        if let Some(bad) = range.clone().find(|raw| *raw as usize >= MAX_VECTORS) {
            return Err(IrqError::InvalidVector(Vector(bad)));
        }
        for raw in range {
            self.register(Vector(raw), Arc::clone(&sink), reentrant)?;
        }
        Ok(())
    }

    /// Runs `sink` on every `period`-th timer tick.
    pub fn attach_periodic(&mut self, period: u64, sink: Arc<dyn IrqSink>) -> Result<(), IrqError> {
        if period == 0 {
            return Err(IrqError::InvalidPeriod);
        }
        self.periodic.push(Periodic { period, sink });
        Ok(())
    }

    pub fn is_claimed(&self, vector: Vector) -> bool {
        self.vectors.get(vector.index()).is_some_and(|slot| !slot.is_empty())
    }

    /// Snapshot of the handlers for `vector`, so they can run against `&mut Kernel`.
    pub fn handlers(&self, vector: Vector) -> Vec<Registration> {
        self.vectors.get(vector.index()).cloned().unwrap_or_default()
    }

    /// Periodic work due on `tick`.
    pub fn due(&self, tick: u64) -> Vec<Arc<dyn IrqSink>> {
        self.periodic.iter().filter(|work| tick % work.period == 0).map(|work| Arc::clone(&work.sink)).collect()
    }
}

impl Default for IrqTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    impl IrqSink for Nop {
        fn handle(&self, _vector: Vector, _kernel: &mut Kernel) {}
    }

    #[test]
    fn multiple_sinks_share_a_vector() {
        let mut table = IrqTable::new();
        let sink: Arc<dyn IrqSink> = Arc::new(Nop);
        table.register(Vector::external(3), Arc::clone(&sink), false).unwrap();
        table.register(Vector::external(3), sink, true).unwrap();
        let handlers = table.handlers(Vector::external(3));
        assert_eq!(handlers.len(), 2);
        assert!(handlers[1].reentrant);
        assert!(!table.is_claimed(Vector::external(4)));
    }

    #[test]
    fn range_registration_is_all_or_nothing() {
        let mut table = IrqTable::new();
        let sink: Arc<dyn IrqSink> = Arc::new(Nop);
        assert_eq!(
            table.register_range(250..260, Arc::clone(&sink), false),
            Err(IrqError::InvalidVector(Vector(256)))
        );
        assert!(!table.is_claimed(Vector(250)));
        table.register_range(32..40, sink, false).unwrap();
        assert!((32..40).all(|raw| table.is_claimed(Vector(raw))));
    }

    #[test]
    fn periodic_work_fires_on_multiples() {
        let mut table = IrqTable::new();
        assert_eq!(table.attach_periodic(0, Arc::new(Nop)), Err(IrqError::InvalidPeriod));
        table.attach_periodic(3, Arc::new(Nop)).unwrap();
        assert_eq!(table.due(2).len(), 0);
        assert_eq!(table.due(6).len(), 1);
    }
}
