//! Connection and dispatch fabric for the load-generation coordinator.
//!
//! The coordinator accepts persistent connections from four agent
//! populations (load clients, resource-monitor clients, stat clients and
//! client managers), multiplexes a framed request/response protocol with
//! each of them, and hands cohorts of connected clients to an external
//! scheduler for job dispatch.

pub mod admin;
pub mod config;
pub mod error;
pub mod ids;
pub mod job;
pub mod lifecycle;
pub mod listener;
pub mod logging;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod stats;
pub mod time;
pub mod wire;

pub use error::{CoreError, CoreResult};

/// Emits a `tracing::trace!` line. Mirrors the rest of the logging macros
/// below so call sites never need to depend on `tracing` directly.
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {
        tracing::trace!($($arg)*)
    };
}

/// Emits a `tracing::debug!` line.
#[macro_export]
macro_rules! log {
    ($($arg:tt)*) => {
        tracing::debug!($($arg)*)
    };
}

/// Emits a `tracing::warn!` line.
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        tracing::warn!($($arg)*)
    };
}

/// Emits a `tracing::error!` line.
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        tracing::error!($($arg)*)
    };
}
