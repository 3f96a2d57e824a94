//! Maintenance error types.

use thiserror::Error;

use caucase_backup::BackupError;
use caucase_ca::CaError;
use caucase_crypto::CryptoError;
use caucase_storage::StorageError;

/// Errors raised by a maintenance pass.
#[derive(Debug, Error)]
pub enum MaintenanceError {
    /// Filesystem failure.
    #[error("io error: {0}")]
    Io(String),

    /// Unusable settings.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Key or request generation failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Rollover or issuance failed.
    #[error(transparent)]
    Authority(#[from] CaError),

    /// Scheduled backup failed.
    #[error(transparent)]
    Backup(#[from] BackupError),

    /// Store failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<std::io::Error> for MaintenanceError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
