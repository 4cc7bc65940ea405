//! Error kinds named in the error handling design: protocol, authentication,
//! transport, timeout, capacity, local and class-resolution errors. These
//! are surfaced rather than thrown across task boundaries — most of them
//! travel as a field on a response message (`hello-response`,
//! `job-response`, `status-response`) rather than as a Rust `Err`, but a
//! typed enum still gives callers within a module something to match on
//! instead of stringly-typed failures.

use std::fmt;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    /// Decode failure, message out of context for the session's role, or an
    /// unsupported authentication scheme.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The client's credentials were rejected by the validator.
    #[error("authentication error: {code:?} {message}")]
    Authentication { code: AuthCode, message: String },

    /// A read or write on the underlying socket failed.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// A solicited response did not arrive within the configured wait.
    #[error("timeout waiting for response")]
    Timeout,

    /// The listener is at its configured connection limit, or a cohort
    /// could not be fully allocated.
    #[error("capacity error: {0}")]
    Capacity(String),

    /// Sending a request to an agent failed outright (the session is dead
    /// from the caller's point of view).
    #[error("local error: {0}")]
    Local(String),

    /// A registry lock could not be acquired within its bounded timeout.
    #[error("registry lock timed out")]
    LockTimeout,

    /// `dispatch_job` was called on a session that already has an
    /// in-progress job (§4.3: "fails immediately with job-request-refused").
    #[error("job request refused: {0}")]
    JobRequestRefused(String),

    /// `control_job`/`status_request` referenced a job this session isn't
    /// tracking as in-progress.
    #[error("no such job: {0}")]
    NoSuchJob(String),
}

/// Mirrors the validator's own result vocabulary; kept distinct from
/// `CoreError::Protocol` per §7 ("Authentication error — distinct from
/// protocol error").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthCode {
    Success,
    InvalidCredentials,
    SchemeNotSupported,
    ValidatorNotConfigured,
}

impl fmt::Display for AuthCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuthCode::Success => "success",
            AuthCode::InvalidCredentials => "invalid-credentials",
            AuthCode::SchemeNotSupported => "scheme-not-supported",
            AuthCode::ValidatorNotConfigured => "validator-not-configured",
        };
        f.write_str(s)
    }
}
