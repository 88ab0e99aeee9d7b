//! Kernel logger.
//!
//! Routes the `log` facade to a byte sink such as a serial port. Lines
//! look like `[INFO  kestrel_kernel::scheduler] message`.

use alloc::string::String;
use core::fmt::{self, Write};
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::{Mutex, Once};

/// Destination of formatted log lines.
pub trait LogSink: Sync {
    fn write_str(&self, s: &str);
}

/// A sink that keeps everything in memory.
pub struct BufferSink {
    buf: Mutex<String>,
}

impl BufferSink {
    pub const fn new() -> Self {
        BufferSink {
            buf: Mutex::new(String::new()),
        }
    }

    pub fn contents(&self) -> String {
        self.buf.lock().clone()
    }

    pub fn clear(&self) {
        self.buf.lock().clear();
    }
}

impl Default for BufferSink {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSink for BufferSink {
    fn write_str(&self, s: &str) {
        self.buf.lock().push_str(s);
    }
}

struct SinkWriter<'a>(&'a dyn LogSink);

impl Write for SinkWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

pub struct KernelLogger {
    sink: Once<&'static dyn LogSink>,
}

static LOGGER: KernelLogger = KernelLogger { sink: Once::new() };

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Some(sink) = self.sink.get() {
            let _ = writeln!(
                SinkWriter(*sink),
                "[{:<5} {}] {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

/// Install the kernel logger writing to `sink`.
///
/// Fails if a logger is already installed.
pub fn init(sink: &'static dyn LogSink, level: LevelFilter) -> Result<(), SetLoggerError> {
    LOGGER.sink.call_once(|| sink);
    log::set_logger(&LOGGER)?;
    log::set_max_level(level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    static SINK: BufferSink = BufferSink::new();

    #[test]
    fn test_lines_reach_the_sink() {
        init(&SINK, LevelFilter::Debug).expect("logger already installed");
        log::info!(target: "boot", "hello {}", 42);
        log::trace!(target: "boot", "dropped");
        let out = SINK.contents();
        assert!(out.contains("[INFO  boot] hello 42\n"), "{:?}", out);
        assert!(!out.contains("dropped"));
    }
}
