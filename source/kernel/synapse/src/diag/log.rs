// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! `log` facade backend writing `[LEVEL target] message` lines to a console.

use core::fmt::{self, Write};

use ::log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};

use crate::config::Config;
use crate::hal::Console;
use crate::sync::TimedLock;

static LOGGER: KernelLogger = KernelLogger::new(Config::new().lock_timeout_spins);

/// Serialized console logger; a line that cannot take the lock in time is dropped.
pub struct KernelLogger {
    console: spin::Once<&'static dyn Console>,
    gate: TimedLock<()>,
    spins: u32,
}

impl KernelLogger {
    pub const fn new(spins: u32) -> Self {
        Self { console: spin::Once::new(), gate: TimedLock::new(()), spins }
    }

    /// Binds the output console; later calls are ignored.
    pub fn attach(&self, console: &'static dyn Console) {
        self.console.call_once(|| console);
    }
}

const fn tag(level: Level) -> &'static str {
    match level {
        Level::Error => "ERROR",
        Level::Warn => "WARN",
        Level::Info => "INFO",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    }
}

struct ConsoleWriter<'a>(&'a dyn Console);

impl Write for ConsoleWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        match metadata.level() {
            Level::Debug | Level::Trace => cfg!(debug_assertions),
            _ => true,
        }
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let Some(console) = self.console.get() else {
            return;
        };
        let Ok(_line) = self.gate.try_lock_for(self.spins) else {
            return;
        };
        let mut out = ConsoleWriter(*console);
        let _ = writeln!(out, "[{} {}] {}", tag(record.level()), record.target(), record.args());
    }

    fn flush(&self) {}
}

/// Installs the global logger on `console` with `level` as the runtime ceiling.
pub fn init(console: &'static dyn Console, level: LevelFilter) -> Result<(), SetLoggerError> {
    LOGGER.attach(console);
    ::log::set_logger(&LOGGER)?;
    ::log::set_max_level(level);
    Ok(())
}
