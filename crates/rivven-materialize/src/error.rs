//! Error types for materialization
//!
//! Errors are split by how they propagate:
//!
//! - [`DecodeError`] never leaves the ingestion path. The offending event is
//!   dropped and counted, the stream continues.
//! - [`MaterializeError::DrainTimeout`] is only surfaced when the bulk loader
//!   is configured to fail on timeout.
//! - [`MaterializeError::Compaction`] is isolated to one key.
//! - [`MaterializeError::StoreUnavailable`] is fatal and reaches the caller.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Error categories for metrics and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Malformed or unroutable change events
    Decode,
    /// Versioned store failures
    Storage,
    /// Backpressure / transport lag
    Backpressure,
    /// Background compaction
    Compaction,
    /// Configuration errors (invalid settings)
    Configuration,
    /// Serialization errors (JSON, YAML)
    Serialization,
    /// Other/unknown errors
    Other,
}

/// Reasons a raw change event cannot be decoded.
///
/// Decoding is deterministic, so a replay of the same event fails the same
/// way. These errors are logged and the event is skipped, never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Key field absent, null or empty
    #[error("missing key field '{field}' for entity '{entity}'")]
    MissingKey { entity: String, field: String },

    /// The image selected by the operation is absent
    #[error("{op} event carries no {image} image")]
    MissingImage { op: String, image: &'static str },

    /// Operation code outside create/update/snapshot/delete
    #[error("unknown operation code: {0}")]
    UnknownOperation(String),

    /// No schema registered for the entity
    #[error("no schema registered for entity '{0}'")]
    UnknownEntity(String),

    /// Not a change event at all
    #[error("malformed change event: {0}")]
    Malformed(String),
}

impl DecodeError {
    /// Get a metric-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::MissingKey { .. } => "missing_key",
            Self::MissingImage { .. } => "missing_image",
            Self::UnknownOperation(_) => "unknown_operation",
            Self::UnknownEntity(_) => "unknown_entity",
            Self::Malformed(_) => "malformed",
        }
    }
}

/// Materialization errors
#[derive(Error, Debug)]
pub enum MaterializeError {
    /// Event could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Reserved: merge is total under valid input
    #[error("Merge error: {0}")]
    Merge(String),

    /// Transport lag did not drain within the per-chunk budget
    #[error("Drain timeout after chunk {chunk}: lag {lag:?} still above threshold after {waited:?}")]
    DrainTimeout {
        chunk: usize,
        waited: Duration,
        lag: Option<u64>,
    },

    /// Compaction of a single key failed
    #[error("Compaction error for key {key}: {reason}")]
    Compaction { key: String, reason: String },

    /// Versioned store cannot be reached
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Lag observation failed
    #[error("Lag query failed for stream {stream}: {reason}")]
    LagQuery { stream: String, reason: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MaterializeError {
    /// Create a new merge error
    pub fn merge(msg: impl Into<String>) -> Self {
        Self::Merge(msg.into())
    }

    /// Create a new compaction error
    pub fn compaction(key: impl ToString, reason: impl Into<String>) -> Self {
        Self::Compaction {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a store unavailable error
    pub fn store_unavailable(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    /// Create a lag query error
    pub fn lag_query(stream: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::LagQuery {
            stream: stream.into(),
            reason: reason.into(),
        }
    }

    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Check if this error is fatal for the caller of merge / current_of.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }

    /// Check if this error is retriable.
    ///
    /// Decode errors are deterministic and never retriable.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Compaction { .. } => true,
            Self::LagQuery { .. } => true,
            Self::DrainTimeout { .. } => true,
            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                )
            }
            Self::Decode(_)
            | Self::Merge(_)
            | Self::StoreUnavailable(_)
            | Self::Config(_)
            | Self::Json(_)
            | Self::Yaml(_) => false,
        }
    }

    /// Get the error category for metrics and alerting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Decode(_) => ErrorCategory::Decode,
            Self::Merge(_) => ErrorCategory::Storage,
            Self::StoreUnavailable(_) => ErrorCategory::Storage,
            Self::DrainTimeout { .. } => ErrorCategory::Backpressure,
            Self::LagQuery { .. } => ErrorCategory::Backpressure,
            Self::Compaction { .. } => ErrorCategory::Compaction,
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Json(_) => ErrorCategory::Serialization,
            Self::Yaml(_) => ErrorCategory::Serialization,
            Self::Io(_) => ErrorCategory::Other,
        }
    }

    /// Get a metric-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Decode(e) => e.error_code(),
            Self::Merge(_) => "merge_error",
            Self::DrainTimeout { .. } => "drain_timeout",
            Self::Compaction { .. } => "compaction_error",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::LagQuery { .. } => "lag_query_error",
            Self::Config(_) => "config_error",
            Self::Json(_) => "json_error",
            Self::Yaml(_) => "yaml_error",
            Self::Io(_) => "io_error",
        }
    }
}

/// Result type for materialization operations
pub type Result<T> = std::result::Result<T, MaterializeError>;
