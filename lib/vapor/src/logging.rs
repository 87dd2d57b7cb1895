//! Thin facade over `slog` so components only ever name this module.

pub use slog::{crit, debug, error, info, o, trace, warn};
pub use slog::{Discard, Logger};

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// Builds the process-wide terminal logger. Binaries call this once at startup
/// and hand child loggers to the components they construct.
pub fn init() -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(Severity::Debug);
    builder.destination(Destination::Stderr);

    builder.build().expect("Logger initialization failed")
}

/// A logger that drops everything. Used by tests and by components constructed
/// without a parent logger.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
