//! Error types for the rollup core

use thiserror::Error;

/// Main error type for the rollup core
#[derive(Error, Debug)]
pub enum Error {
    /// Aggregation error
    #[error("Rollup error: {0}")]
    Rollup(#[from] RollupError),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// A unit of work was found in a state that correct coalescing should
    /// never produce, e.g. a coarser slot scheduled while a finer slot in its
    /// range is still Active
    #[error("Inconsistent state for {key}: {detail}")]
    InconsistentState {
        /// Slot key of the offending unit
        key: String,
        /// What was observed
        detail: String,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Aggregation errors
///
/// These are local to one unit of work: a failed build fails that unit only.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RollupError {
    /// Aggregation was invoked without any data
    #[error("Cannot build {kind} rollup from empty input")]
    EmptyInput {
        /// Rollup kind being built
        kind: &'static str,
    },

    /// A stored rollup of the wrong kind was handed to a typed reader
    #[error("Rollup type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Kind the caller asked for
        expected: &'static str,
        /// Kind found in storage
        actual: &'static str,
    },
}

/// Storage errors
///
/// Transient variants are retried on the next scheduling pass and never
/// escalate to data loss.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Read, write or connection failure that may succeed on retry
    #[error("Transient storage failure during {operation}: {message}")]
    Transient {
        /// Operation that failed (read_raw, write_rollups, ...)
        operation: &'static str,
        /// Backend-provided description
        message: String,
    },

    /// Operation exceeded its caller-supplied timeout
    #[error("Storage operation {operation} timed out after {timeout_ms}ms")]
    Timeout {
        /// Operation that timed out
        operation: &'static str,
        /// Timeout that elapsed
        timeout_ms: u64,
    },

    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted data could not be decoded
    #[error("Corrupted data: {0}")]
    CorruptedData(String),

    /// Encoding data for persistence failed
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Create a transient error for the given operation
    pub fn transient(operation: &'static str, message: impl Into<String>) -> Self {
        StorageError::Transient {
            operation,
            message: message.into(),
        }
    }

    /// Whether retrying the operation later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::Transient { .. } | StorageError::Timeout { .. } | StorageError::Io(_)
        )
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_data() || e.is_syntax() || e.is_eof() {
            StorageError::CorruptedData(e.to_string())
        } else {
            StorageError::Serialization(e.to_string())
        }
    }
}

/// Validation errors for configuration and inputs
#[derive(Error, Debug)]
pub enum ValidationError {
    /// Value is out of allowed range
    #[error("{field} value {value} is out of range [{min}, {max}]")]
    OutOfRange {
        /// Field name being validated
        field: String,
        /// The invalid value
        value: String,
        /// Minimum allowed value
        min: String,
        /// Maximum allowed value
        max: String,
    },

    /// Required field is missing or empty
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    Failed(String),
}

impl From<ValidationError> for Error {
    fn from(e: ValidationError) -> Self {
        Error::Configuration(e.to_string())
    }
}

impl Error {
    /// Whether the failed unit should simply be retried on a later pass
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Storage(e) => e.is_transient(),
            Error::Io(_) => true,
            _ => false,
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
