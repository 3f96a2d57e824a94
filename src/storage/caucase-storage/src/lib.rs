//! # Caucase Storage
//!
//! Persistence model shared by both certificate hierarchies.
//!
//! Provides the entity types, the [`CertificateStore`] trait that storage
//! backends implement, and the row stream used by backup and restore.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod error;
pub mod model;

pub use backend::{CertificateStore, DumpReader};
pub use error::StorageError;
pub use model::{
    AutoApprovalCounter, CaKeyPair, CsrRecord, CsrStatus, CsrSubmission, DumpCursor, DumpRow,
    Hierarchy, IssuedCertificate, NewCertificate, NewCsr, RevokedEntry,
};
