//! Structured logging setup (§A.1): `tracing` + `tracing-subscriber` +
//! `tracing-appender`, the stack `fantoch` already depends on. The forced
//! log level (CLI flag or config, §6 "environment-like inputs") overrides
//! `RUST_LOG`; if the subscriber can't be installed, fatal messages fall
//! back to standard error (§7) rather than being silently lost.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Holds the non-blocking file-appender's worker guard, if one is in use.
/// Dropping it flushes any buffered log lines — §4.8 shutdown step 6,
/// "close the logger (if asynchronous, flush its buffer first)".
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Installs the global `tracing` subscriber. `forced_level` overrides
/// `RUST_LOG`/the default filter when set (§6, §A.1); `log_dir` additionally
/// wires a daily-rolling non-blocking file appender alongside stdout.
pub fn init(forced_level: Option<&str>, log_dir: Option<&Path>) -> LogGuard {
    let filter = forced_level
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));

    let (file_guard, result) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "loadgen-coordinator.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(non_blocking)
                .finish();
            (Some(guard), tracing::subscriber::set_global_default(subscriber))
        }
        None => {
            let subscriber = tracing_subscriber::fmt().with_env_filter(filter).finish();
            (None, tracing::subscriber::set_global_default(subscriber))
        }
    };

    if let Err(e) = result {
        eprintln!("failed to install tracing subscriber, falling back to stderr-only logging: {e}");
    }

    LogGuard { _file_guard: file_guard }
}
