//! Kernel sink for the [`log`] facade.
//!
//! Subsystems log through `log::{info, debug, ...}`; whichever console the
//! kernel brought up is wrapped in a [`KernelLogger`] and installed once with
//! [`init`].

use core::fmt::Write;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::Mutex;

/// Formats records as `[LEVEL target] message` lines into `W`.
pub struct KernelLogger<W> {
    writer: Mutex<W>,
    level: LevelFilter,
}

impl<W: Write + Send> KernelLogger<W> {
    pub const fn new(writer: W, level: LevelFilter) -> Self {
        Self {
            writer: Mutex::new(writer),
            level,
        }
    }

    pub fn level(&self) -> LevelFilter {
        self.level
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }

    /// Runs `f` with the writer locked.
    pub fn with_writer<R>(&self, f: impl FnOnce(&mut W) -> R) -> R {
        f(&mut self.writer.lock())
    }
}

impl<W: Write + Send> Log for KernelLogger<W> {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut writer = self.writer.lock();
        // A console that rejects a line has nowhere to report it.
        let _ = writeln!(
            writer,
            "[{:<5} {}] {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

/// Installs `logger` as the global logger. Fails if one is already set.
pub fn init<W: Write + Send + 'static>(
    logger: &'static KernelLogger<W>,
) -> Result<(), SetLoggerError> {
    log::set_logger(logger)?;
    log::set_max_level(logger.level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;

    fn emit<W: Write + Send>(logger: &KernelLogger<W>, level: Level, message: &str) {
        logger.log(
            &Record::builder()
                .level(level)
                .target("vm::swap")
                .args(format_args!("{message}"))
                .build(),
        );
    }

    #[test]
    fn formats_level_and_target() {
        let logger = KernelLogger::new(String::new(), LevelFilter::Debug);
        emit(&logger, Level::Info, "10 slots");
        emit(&logger, Level::Debug, "slot 3 out");
        assert_eq!(
            logger.into_inner(),
            "[INFO  vm::swap] 10 slots\n[DEBUG vm::swap] slot 3 out\n"
        );
    }

    #[test]
    fn filters_below_level() {
        let logger = KernelLogger::new(String::new(), LevelFilter::Warn);
        emit(&logger, Level::Debug, "dropped");
        emit(&logger, Level::Error, "kept");
        assert_eq!(logger.into_inner(), "[ERROR vm::swap] kept\n");
    }
}
