//! Error types for the export pipeline.
//!
//! None of these reach producers: `Recorder::record` absorbs every failure
//! and reports it through [`Diagnostics`](crate::Diagnostics) and logs.

use crate::config::OverflowPolicy;
use crate::record::Signal;
use std::time::Duration;
use thiserror::Error;

/// Failure taxonomy of the export path.
#[derive(Debug, Error, Clone)]
pub enum ExportError {
    /// Buffer full; resolved by the overflow policy.
    #[error("buffer full, record dropped under {policy} policy")]
    Overflow { policy: OverflowPolicy },
    /// A record could not be represented on the wire.
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    /// Network or connection failure (retryable).
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Collector refused the payload; retrying would repeat forever.
    #[error("collector rejected {signal} batch {sequence} with status {status}")]
    RejectedPayload {
        signal: Signal,
        sequence: u64,
        status: u16,
    },
    /// Shutdown flush did not finish within its budget.
    #[error("shutdown flush exceeded {budget:?}, {discarded} records discarded")]
    ShutdownTimeout { budget: Duration, discarded: u64 },
}

/// Per-record or per-payload encoding failure.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EncodingError {
    #[error("non-finite double in {field} cannot be encoded as {protocol}")]
    NonFinite {
        field: &'static str,
        protocol: &'static str,
    },
    #[error("invalid histogram: {0}")]
    InvalidHistogram(String),
    #[error("metric {name:?} kind does not match its value")]
    KindMismatch { name: String },
    #[error("counter {name:?} has negative value")]
    NegativeCounter { name: String },
    #[error("span {name:?} has an invalid trace or span id")]
    InvalidSpanContext { name: String },
    #[error("span {name:?} ends before it starts")]
    InvertedSpan { name: String },
    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// Transport-layer failure. Always treated as retryable.
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request failed: {0}")]
    Request(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout
        } else if e.is_connect() {
            TransportError::Connect(e.to_string())
        } else {
            TransportError::Request(e.to_string())
        }
    }
}

/// Invalid exporter configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("environment variable {var} has unusable value {value:?}")]
    Env { var: &'static str, value: String },
    #[error("malformed configuration document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to build HTTP client: {0}")]
    Client(String),
    #[error("export pipeline must be started inside a tokio runtime")]
    NoRuntime,
}
