//! Unified error handling for the xylem engine.
//!
//! Every failure mode in the crate is represented by one public enum,
//! [`XylemError`], constructed through the helper methods below. The kinds
//! mirror the layers of the pipeline:
//!
//! - `Configuration`: bad rule data, unknown backends, unusable settings.
//!   Raised at compile/setup time, never mid-parse.
//! - `Authentication`: the transport saw a 401. Always distinct from
//!   `Communication` so callers can prompt for credentials instead of
//!   debugging routing.
//! - `Communication`: connection failures, redirect-limit exhaustion, and
//!   any non-success, non-redirect status. Carries the status code and its
//!   class for diagnostics.
//! - `Parse`: malformed markup reported by an adapter. Non-fatal by default;
//!   these accumulate in the run's error record rather than raising.
//! - `Protocol`: a nonzero result code embedded in a successfully
//!   transported document. Surfaced only when the caller asks, never during
//!   parsing.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, XylemError>;

/// Coarse classification of an HTTP status code, carried on
/// [`XylemError::Communication`] for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Informational,
    Success,
    Redirection,
    ClientError,
    ServerError,
    Unknown,
}

impl StatusClass {
    pub fn of(status: u16) -> Self {
        match status {
            100..=199 => StatusClass::Informational,
            200..=299 => StatusClass::Success,
            300..=399 => StatusClass::Redirection,
            400..=499 => StatusClass::ClientError,
            500..=599 => StatusClass::ServerError,
            _ => StatusClass::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StatusClass::Informational => "informational",
            StatusClass::Success => "success",
            StatusClass::Redirection => "redirection",
            StatusClass::ClientError => "client error",
            StatusClass::ServerError => "server error",
            StatusClass::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for StatusClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified error type for every xylem failure mode.
#[derive(Debug, Error)]
pub enum XylemError {
    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("authentication failed: {message}")]
    Authentication { message: String },

    #[error("communication error: {message}")]
    Communication {
        message: String,
        /// HTTP status, when one was received before the failure.
        status: Option<u16>,
        class: Option<StatusClass>,
    },

    #[error("malformed document: {message}")]
    Parse { message: String },

    #[error("server returned error code {code}")]
    Protocol { code: i32 },

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

impl XylemError {
    pub fn config(message: impl Into<String>) -> Self {
        XylemError::Configuration { message: message.into() }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        XylemError::Authentication { message: message.into() }
    }

    /// Communication failure without an HTTP status (connect errors,
    /// truncated responses, exhausted redirects).
    pub fn comm(message: impl Into<String>) -> Self {
        XylemError::Communication { message: message.into(), status: None, class: None }
    }

    /// Communication failure classified from a received status code.
    pub fn comm_status(status: u16, message: impl Into<String>) -> Self {
        XylemError::Communication {
            message: message.into(),
            status: Some(status),
            class: Some(StatusClass::of(status)),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        XylemError::Parse { message: message.into() }
    }

    /// The HTTP status this error carries, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            XylemError::Communication { status, .. } => *status,
            _ => None,
        }
    }
}

/// One recorded, non-fatal failure from a parsing run: the cause plus a
/// short note about where in the run it happened.
///
/// The error record is append-only. A recoverable structural error lands
/// here and the run continues, unless abort-on-error is configured.
#[derive(Debug)]
pub struct ErrorEntry {
    pub error: XylemError,
    pub context: String,
}

impl ErrorEntry {
    pub fn new(error: XylemError, context: impl Into<String>) -> Self {
        Self { error, context: context.into() }
    }
}

impl std::fmt::Display for ErrorEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.error, self.context)
    }
}
