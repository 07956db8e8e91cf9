//! # Console
//!
//! System console and the `log` backend writing to it.

use core::fmt::{self, Write};
use std::io::Write as _;

use spin::Mutex;

use crate::clock;
use crate::{HalError, HalResult};

/// Console writer trait
pub trait ConsoleWriter: Send {
    /// Write a string to the console
    fn write_str(&mut self, s: &str);

    /// Flush the console
    fn flush(&mut self) {}
}

/// Host standard error
#[derive(Debug, Default)]
pub struct HostConsole;

impl ConsoleWriter for HostConsole {
    fn write_str(&mut self, s: &str) {
        let _ = std::io::stderr().write_all(s.as_bytes());
    }

    fn flush(&mut self) {
        let _ = std::io::stderr().flush();
    }
}

static CONSOLE: Mutex<Option<Box<dyn ConsoleWriter>>> = Mutex::new(None);

/// Set the console writer
///
/// Until one is set, output goes to [`HostConsole`].
pub fn set_console(writer: Box<dyn ConsoleWriter>) {
    *CONSOLE.lock() = Some(writer);
}

/// Print to the console
pub fn print(args: fmt::Arguments<'_>) {
    let mut console = CONSOLE.lock();
    match console.as_mut() {
        Some(writer) => {
            let _ = write_to_console(writer.as_mut(), args);
        },
        None => {
            let _ = write_to_console(&mut HostConsole, args);
        },
    }
}

fn write_to_console(console: &mut dyn ConsoleWriter, args: fmt::Arguments<'_>) -> fmt::Result {
    struct Adapter<'a>(&'a mut dyn ConsoleWriter);

    impl Write for Adapter<'_> {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            ConsoleWriter::write_str(self.0, s);
            Ok(())
        }
    }

    Adapter(console).write_fmt(args)
}

/// `log` backend printing `[uptime] LEVEL target: message` lines
#[derive(Debug)]
pub struct ConsoleLogger;

static LOGGER: ConsoleLogger = ConsoleLogger;

impl log::Log for ConsoleLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let up = clock::uptime();
        print(format_args!(
            "[{:>5}.{:06}] {:<5} {}: {}\n",
            up.as_secs(),
            up.subsec_micros(),
            record.level(),
            record.target(),
            record.args()
        ));
    }

    fn flush(&self) {
        if let Some(writer) = CONSOLE.lock().as_mut() {
            writer.flush();
        }
    }
}

/// Install the console logger with the given maximum level
pub fn init(level: log::LevelFilter) -> HalResult<()> {
    log::set_logger(&LOGGER).map_err(|_| HalError::LoggerAlreadySet)?;
    log::set_max_level(level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct Capture(Arc<Mutex<String>>);

    impl ConsoleWriter for Capture {
        fn write_str(&mut self, s: &str) {
            self.0.lock().push_str(s);
        }
    }

    #[test]
    fn test_print_goes_to_installed_writer() {
        let buffer = Arc::new(Mutex::new(String::new()));
        set_console(Box::new(Capture(buffer.clone())));
        print(format_args!("cpu{} online\n", 3));
        assert!(buffer.lock().contains("cpu3 online"));
    }
}
