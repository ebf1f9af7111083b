use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error classification carried on the wire.
///
/// `Unhealthy` is the configurable alias for `Declined` used when circuit
/// breaking is enabled and the operator wants tripped circuits to be
/// distinguishable from ordinary declines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Malformed or incomplete request. Never retried.
    BadRequest,
    /// The receiver chose not to serve the request.
    Declined,
    /// Rate limit exceeded; the message names the limit that tripped.
    Busy,
    /// Circuit open for the addressed (caller, service, endpoint).
    Unhealthy,
    /// Transport-level connection failure. Retryable.
    NetworkError,
    /// The request or connection attempt timed out. Retryable.
    Timeout,
    /// The caller gave up before a response was produced.
    Cancelled,
    /// Transport-classified unrecoverable failure. Logged at error level.
    Fatal,
}

impl ErrorCode {
    /// Outbound retries are only attempted on network/timeout classifications.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorCode::NetworkError | ErrorCode::Timeout)
    }

    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorCode::Fatal)
    }
}

/// An error frame as returned to the caller over the framed transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{code:?}: {message}")]
pub struct ErrorFrame {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorFrame {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn declined(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Declined, message)
    }

    pub fn busy(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Busy, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NetworkError, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }
}

/// Errors raised by the common layer itself (parsing, encoding).
#[derive(Error, Debug)]
pub enum CommonError {
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid host-port {0:?}")]
    InvalidHostPort(String),
}

pub type Result<T> = std::result::Result<T, CommonError>;
