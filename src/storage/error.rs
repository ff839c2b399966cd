//! Storage engine error types
//!
//! Defines all errors that can occur in the storage and indexing layer.

use thiserror::Error;

/// Errors that can occur in the storage and indexing layer
#[derive(Error, Debug)]
pub enum StoreError {
    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Underlying relational engine failed
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Requested time series or metadata does not exist
    #[error("not stored: {0}")]
    NotStored(String),

    /// Caller logic error: read-only violation, ambiguous match, unsupported mode
    #[error("operation not allowed: {0}")]
    OperationNotAllowed(String),

    /// Unsupported time-series subtype or storage kind
    #[error("not implemented: {0}")]
    Unimplemented(String),

    /// Index and backend disagree; indicates a bug, never partial data
    #[error("internal consistency error: {0}")]
    Consistency(String),

    /// Serialization/deserialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Data corruption detected (checksum mismatch, invalid magic, etc.)
    #[error("corrupt data: {0}")]
    Corruption(String),

    /// Segment file format error
    #[error("invalid segment format: {0}")]
    InvalidSegment(String),
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Result type alias for storage operations
pub type StoreResult<T> = Result<T, StoreError>;
