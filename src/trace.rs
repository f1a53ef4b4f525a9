//! Debug tracing controlled by the `IO_PLUMBING_DEBUG` environment
//! variable: 0 or unset disables tracing, 1 emits fork and plumb events,
//! higher values additionally emit per-descriptor events.
//!
//! Events go through the `log` facade.  If the host program installed a
//! logger, records are delivered there; otherwise, when tracing is enabled
//! (or a warning must be reported), a minimal stderr logger is installed
//! lazily so the output is not silently dropped.

use std::env;
use std::sync::OnceLock;

use log::{LevelFilter, Log, Metadata, Record};

const DEBUG_VAR: &str = "IO_PLUMBING_DEBUG";

static LEVEL: OnceLock<u32> = OnceLock::new();

/// The debug level requested through the environment, read once.
pub(crate) fn level() -> u32 {
    *LEVEL.get_or_init(|| {
        let level = env::var(DEBUG_VAR)
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);
        ensure_logger(level);
        level
    })
}

struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.target().starts_with(env!("CARGO_CRATE_NAME"))
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("{}: {}", record.level().to_string().to_lowercase(), record.args());
        }
    }

    fn flush(&self) {}
}

static STDERR_LOGGER: StderrLogger = StderrLogger;

fn ensure_logger(level: u32) {
    let filter = match level {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    // Fails if the host already installed a logger; that logger wins.
    if log::set_logger(&STDERR_LOGGER).is_ok() {
        log::set_max_level(filter);
    }
}

/// Fork and plumb events, visible from `IO_PLUMBING_DEBUG=1`.
macro_rules! plumb_debug {
    ($($arg:tt)*) => {
        if $crate::trace::level() >= 1 {
            log::debug!($($arg)*);
        }
    };
}

/// Per-descriptor events, visible from `IO_PLUMBING_DEBUG=2`.
macro_rules! fd_trace {
    ($($arg:tt)*) => {
        if $crate::trace::level() >= 2 {
            log::trace!($($arg)*);
        }
    };
}

/// Warnings are always emitted; `level()` makes sure a logger exists.
macro_rules! plumb_warn {
    ($($arg:tt)*) => {{
        let _ = $crate::trace::level();
        log::warn!($($arg)*);
    }};
}

pub(crate) use {fd_trace, plumb_debug, plumb_warn};
