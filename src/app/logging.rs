//! Tracing initialization for the controller process.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// What: Initialize the global tracing subscriber.
///
/// Inputs:
/// - `log_dir`: When set, logs roll daily into `<dir>/kurator.log` via a
///   non-blocking appender; otherwise logs go to stderr.
///
/// Output:
/// - The appender guard when file logging is active; dropping it flushes
///   and stops the background writer, so the caller holds it for the
///   process lifetime.
///
/// Details:
/// - The filter honors `RUST_LOG` and defaults to `info`.
pub fn init(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "kurator.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}
