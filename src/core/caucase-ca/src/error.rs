//! Authority error taxonomy.

use thiserror::Error;

use caucase_crypto::CryptoError;
use caucase_storage::StorageError;

/// Errors returned by the issuance authorities.
///
/// Each variant maps to one fixed transport status; only operator supplied
/// reasons are meant to cross the trust boundary.
#[derive(Debug, Error)]
pub enum CaError {
    /// Malformed or self-inconsistent request.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Pending ceiling or auto-approval budget reached.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Missing, invalid or revoked authorizing certificate.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Unknown id or serial.
    #[error("not found: {0}")]
    NotFound(String),

    /// Terminal state violation.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Unexpected failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CaError {
    /// Stable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::ResourceExhausted(_) => "resource_exhausted",
            Self::Unauthorized(_) => "unauthorized",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Internal(_) => "internal",
        }
    }

    /// Wraps a parse failure of caller supplied input.
    pub fn invalid(e: CryptoError) -> Self {
        Self::Validation(e.to_string())
    }
}

impl From<StorageError> for CaError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(m) => Self::NotFound(m),
            StorageError::Conflict(m) => Self::Conflict(m),
            StorageError::ResourceExhausted(m) => Self::ResourceExhausted(m),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<CryptoError> for CaError {
    fn from(e: CryptoError) -> Self {
        Self::Internal(e.to_string())
    }
}
