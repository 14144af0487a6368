//! Logging initialization.
//!
//! One rolling log file plus stderr, both behind `RUST_LOG`-style filtering.
//! The file name comes from the `LOG_FILE_NAME` environment variable so each
//! stage binary can write its own log. Initialization is guarded: calling
//! [`init`] more than once is a no-op.

use std::path::Path;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{EnvFilter, fmt};

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Default log file name when `LOG_FILE_NAME` is unset.
pub const DEFAULT_LOG_FILE: &str = "synthforge.log";

/// Install the global subscriber: daily-rolling file in `log_dir` plus
/// stderr. Subsequent calls return without touching the installed
/// subscriber.
pub fn init(log_dir: impl AsRef<Path>) {
    if GUARD.get().is_some() {
        return;
    }

    let file_name =
        std::env::var("LOG_FILE_NAME").unwrap_or_else(|_| DEFAULT_LOG_FILE.to_owned());
    let appender = tracing_appender::rolling::daily(log_dir.as_ref(), file_name);
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();

    if result.is_ok() {
        let _ = GUARD.set(guard);
    }
}
