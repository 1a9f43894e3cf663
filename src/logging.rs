// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Line logger for the debug UART.

extern crate alloc;

use {
    alloc::boxed::Box,
    core::{
        cell::RefCell,
        fmt::Write,
        sync::atomic::{AtomicUsize, Ordering},
    },
    log::{LevelFilter, Log, Metadata, Record},
};

struct SinkLogger<W> {
    sink: critical_section::Mutex<RefCell<W>>,
    level: LevelFilter,
    tick_ms: Option<&'static AtomicUsize>,
}

impl<W> SinkLogger<W> {
    fn new(sink: W, level: LevelFilter, tick_ms: Option<&'static AtomicUsize>) -> Self {
        Self {
            sink: critical_section::Mutex::new(RefCell::new(sink)),
            level,
            tick_ms,
        }
    }
}

/// `<level> <seconds>.<millis> [<module>] <message>`
fn write_record<W: Write>(out: &mut W, record: &Record, ms: usize) -> core::fmt::Result {
    writeln!(
        out,
        "{} {}.{:03} [{}] {}",
        record.level(),
        ms / 1000,
        ms % 1000,
        record.module_path().unwrap_or("se"),
        record.args()
    )
}

impl<W: Send + Write> Log for SinkLogger<W> {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let ms = self
            .tick_ms
            .map(|t| t.load(Ordering::SeqCst))
            .unwrap_or(0);
        critical_section::with(|cs| {
            write_record(&mut *self.sink.borrow(cs).borrow_mut(), record, ms).ok();
        })
    }

    fn flush(&self) {}
}

/// Routes `log` output to `sink`, typically the debug UART.
///
/// A second call is ignored. Needs a global allocator.
pub fn init_logging<W: Send + Write + 'static>(
    sink: W,
    level: LevelFilter,
    tick_ms: Option<&'static AtomicUsize>,
) {
    log::set_max_level(level);
    log::set_logger(Box::leak(Box::new(SinkLogger::new(sink, level, tick_ms)))).ok();
}
