//! Backup error types.

use thiserror::Error;

use caucase_ca::CaError;
use caucase_crypto::CryptoError;
use caucase_storage::StorageError;

/// Errors raised while writing or restoring a backup.
#[derive(Debug, Error)]
pub enum BackupError {
    /// Filesystem failure.
    #[error("io error: {0}")]
    Io(String),

    /// A frame, digest or row failed verification.
    #[error("corrupt backup: {0}")]
    Corrupt(String),

    /// Restoring would overwrite an existing store.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The proving key matches no user certificate in the backup.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// No user certificate can receive the backup's data key.
    #[error("no user certificate can receive a backup")]
    NoRecipients,

    /// Caller supplied unusable input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Row (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Store failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Issuance failure during bridging.
    #[error(transparent)]
    Authority(#[from] CaError),
}

impl From<std::io::Error> for BackupError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<CryptoError> for BackupError {
    fn from(e: CryptoError) -> Self {
        Self::InvalidInput(e.to_string())
    }
}

impl From<serde_json::Error> for BackupError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
