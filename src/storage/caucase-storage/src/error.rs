//! Storage error types.

use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Entry not found.
    #[error("entry not found: {0}")]
    NotFound(String),

    /// The operation would break a state transition or uniqueness rule.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A configured ceiling has been reached.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Caller supplied a value the store cannot accept.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Connection error.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// A query failed to execute.
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Transaction error.
    #[error("transaction error: {0}")]
    Transaction(String),

    /// Generic I/O error.
    #[error("io error: {0}")]
    Io(String),
}
