//! Error types for retrying-http
//!
//! Every failure a task can finish with is a variant of [`Error`]. The
//! variants that belong to the module's own error domain carry a signed
//! domain code (see [`Error::domain_code`]):
//! - positive codes are HTTP status codes rejected by the acceptable-status policy
//! - negative codes are module-internal failures (response too large, output
//!   stream failure, bad content type)
//! - 0 is never a valid code
//!
//! Errors are `Clone` so the same terminal error can be read through a task
//! handle and through the orchestrator that owned the task.

use std::sync::Arc;
use thiserror::Error;

/// Result type alias for retrying-http operations
pub type Result<T> = std::result::Result<T, Error>;

/// Name of the module's error domain
pub const ERROR_DOMAIN: &str = "retrying_http";

/// Domain code: the in-memory response grew past its maximum size
pub const CODE_RESPONSE_TOO_LARGE: i64 = -1;
/// Domain code: writing to the configured output sink failed
pub const CODE_OUTPUT_STREAM: i64 = -2;
/// Domain code: the response content type was not acceptable
pub const CODE_BAD_CONTENT_TYPE: i64 = -3;

/// Main error type for retrying-http
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "retry.schedule")
        key: Option<String>,
    },

    /// The request descriptor cannot be sent (bad URL, unsupported scheme, no host)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Transport-level failure reported by the HTTP client
    #[error("transport error: {0}")]
    Transport(#[source] Arc<reqwest::Error>),

    /// I/O failure outside the response sink (context threads, DNS lookups)
    #[error("I/O error: {0}")]
    Io(#[source] Arc<std::io::Error>),

    /// The final status code is not in the acceptable set
    #[error("unacceptable HTTP status {code}")]
    Status {
        /// The HTTP status code of the final response
        code: u16,
    },

    /// The status was acceptable but the content type was not
    #[error("unacceptable content type {}", content_type.as_deref().unwrap_or("<none>"))]
    BadContentType {
        /// The MIME type the server sent, if any
        content_type: Option<String>,
    },

    /// The in-memory response would exceed its maximum size
    #[error("response exceeds maximum size of {limit} bytes")]
    ResponseTooLarge {
        /// The configured maximum response size
        limit: usize,
    },

    /// Writing the response to the output sink failed
    #[error("output stream error: {0}")]
    OutputStream(#[source] Arc<std::io::Error>),

    /// The task was cancelled before it finished
    #[error("cancelled")]
    Cancelled,

    /// Configuration (de)serialization failed
    #[error("serialization error: {0}")]
    Serialization(#[source] Arc<serde_json::Error>),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Signed code of this error inside [`ERROR_DOMAIN`]
    ///
    /// Returns `None` for errors that belong to other domains (transport,
    /// I/O, cancellation, configuration).
    pub fn domain_code(&self) -> Option<i64> {
        match self {
            Error::Status { code } => Some(i64::from(*code)),
            Error::ResponseTooLarge { .. } => Some(CODE_RESPONSE_TOO_LARGE),
            Error::OutputStream(_) => Some(CODE_OUTPUT_STREAM),
            Error::BadContentType { .. } => Some(CODE_BAD_CONTENT_TYPE),
            _ => None,
        }
    }

    /// True if the error reports a cancellation rather than a failure
    ///
    /// UI layers use this to suppress error display for user-initiated cancels.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// The HTTP status carried by a status rejection
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::Status { code } => Some(*code),
            _ => None,
        }
    }

    /// Machine-readable error code
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config_error",
            Error::InvalidRequest(_) => "invalid_request",
            Error::Transport(_) => "transport_error",
            Error::Io(_) => "io_error",
            Error::Status { .. } => "unacceptable_status",
            Error::BadContentType { .. } => "bad_content_type",
            Error::ResponseTooLarge { .. } => "response_too_large",
            Error::OutputStream(_) => "output_stream_error",
            Error::Cancelled => "cancelled",
            Error::Serialization(_) => "serialization_error",
            Error::Other(_) => "internal_error",
        }
    }

    pub(crate) fn config(message: impl Into<String>, key: &str) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.to_string()),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        Error::Transport(Arc::new(error))
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Io(Arc::new(error))
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Serialization(Arc::new(error))
    }
}

impl From<url::ParseError> for Error {
    fn from(error: url::ParseError) -> Self {
        Error::InvalidRequest(error.to_string())
    }
}
