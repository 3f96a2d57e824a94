//! # Caucase Backup
//!
//! Integrity-checked snapshots of the certificate store and recovery from
//! them.
//!
//! Backups hold public material and CA keys alike. Rows are encrypted under a
//! per-file key that only the operators' certificates can unwrap, and files
//! are written owner readable only.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod format;
pub mod restore;
pub mod writer;

pub use error::BackupError;
pub use restore::{restore, RestoreOptions, RestoreOutcome, RESTORED_REASON};
pub use format::{BackupHeader, Recipient};
pub use writer::{backup_file_name, write_backup, BackupRecord, DEFAULT_CHUNK_BYTES};
