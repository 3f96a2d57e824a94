//! Entities persisted by the certificate store.
//!
//! Every entity is scoped by [`Hierarchy`]; the two hierarchies share one
//! store but never share ids, serials or counters.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// One of the two independent trust domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Hierarchy {
    /// Machine and service identities (`cas`).
    #[serde(rename = "cas")]
    Service,
    /// Operators administering the service hierarchy (`cau`).
    #[serde(rename = "cau")]
    User,
}

impl Hierarchy {
    /// Both hierarchies, in dump order.
    pub const ALL: [Hierarchy; 2] = [Hierarchy::Service, Hierarchy::User];

    /// Short name used in paths and table rows.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Service => "cas",
            Self::User => "cau",
        }
    }
}

impl fmt::Display for Hierarchy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Hierarchy {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cas" => Ok(Self::Service),
            "cau" => Ok(Self::User),
            other => Err(StorageError::InvalidInput(format!("unknown hierarchy: {other}"))),
        }
    }
}

/// Lifecycle state of a signing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CsrStatus {
    /// Waiting for a decision.
    Pending,
    /// A certificate was issued. Terminal.
    Signed,
    /// An operator refused the request. Terminal.
    Rejected,
}

impl CsrStatus {
    /// Column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Signed => "signed",
            Self::Rejected => "rejected",
        }
    }
}

impl FromStr for CsrStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "signed" => Ok(Self::Signed),
            "rejected" => Ok(Self::Rejected),
            other => Err(StorageError::Serialization(format!("unknown csr status: {other}"))),
        }
    }
}

/// A stored certificate signing request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsrRecord {
    /// Owning hierarchy.
    pub hierarchy: Hierarchy,
    /// Monotonic id within the hierarchy.
    pub id: u64,
    /// Hex SHA-256 of the DER request.
    pub content_hash: String,
    /// Request as submitted.
    pub csr_pem: String,
    /// Submission time (unix seconds).
    pub submitted_at: u64,
    /// Current state.
    pub status: CsrStatus,
    /// Operator supplied reason, set on rejection.
    pub reason: Option<String>,
    /// Serial of the issued certificate, set once signed.
    pub certificate_serial: Option<String>,
}

/// A request about to be stored.
#[derive(Debug, Clone)]
pub struct NewCsr {
    /// Hex SHA-256 of the DER request.
    pub content_hash: String,
    /// Request as submitted.
    pub csr_pem: String,
    /// Submission time (unix seconds).
    pub submitted_at: u64,
}

/// Outcome of storing a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsrSubmission {
    /// Id of the stored (or already pending) request.
    pub id: u64,
    /// False when an identical pending request was found instead.
    pub created: bool,
}

/// A certificate issued by one of the hierarchy's CA key pairs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedCertificate {
    /// Owning hierarchy.
    pub hierarchy: Hierarchy,
    /// Lowercase hex serial, unique across all CA generations.
    pub serial: String,
    /// Request this certificate answers.
    pub csr_id: u64,
    /// Certificate PEM.
    pub certificate_pem: String,
    /// Issuance time (unix seconds).
    pub issued_at: u64,
    /// Start of validity (unix seconds).
    pub not_before: u64,
    /// End of validity (unix seconds).
    pub not_after: u64,
    /// Issued through auto-approval.
    pub auto_signed: bool,
}

/// A freshly built certificate; the store assigns hierarchy and request id.
#[derive(Debug, Clone)]
pub struct NewCertificate {
    /// Lowercase hex serial.
    pub serial: String,
    /// Certificate PEM.
    pub certificate_pem: String,
    /// Issuance time (unix seconds).
    pub issued_at: u64,
    /// Start of validity (unix seconds).
    pub not_before: u64,
    /// End of validity (unix seconds).
    pub not_after: u64,
    /// Issued through auto-approval.
    pub auto_signed: bool,
}

impl NewCertificate {
    /// Attaches the certificate to its request.
    pub fn into_issued(self, hierarchy: Hierarchy, csr_id: u64) -> IssuedCertificate {
        IssuedCertificate {
            hierarchy,
            serial: self.serial,
            csr_id,
            certificate_pem: self.certificate_pem,
            issued_at: self.issued_at,
            not_before: self.not_before,
            not_after: self.not_after,
            auto_signed: self.auto_signed,
        }
    }
}

/// Permanent record of a revocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokedEntry {
    /// Owning hierarchy.
    pub hierarchy: Hierarchy,
    /// Serial of the revoked certificate.
    pub serial: String,
    /// Revocation time (unix seconds).
    pub revoked_at: u64,
    /// Operator supplied reason.
    pub reason: String,
    /// Expiry of the revoked certificate; past it the entry leaves the CRL.
    pub not_after: u64,
}

/// One generation of a hierarchy's CA.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaKeyPair {
    /// Owning hierarchy.
    pub hierarchy: Hierarchy,
    /// Serial of the CA certificate.
    pub serial: String,
    /// PKCS#8 private key PEM.
    pub key_pem: String,
    /// Self-signed CA certificate PEM.
    pub certificate_pem: String,
    /// Start of validity (unix seconds).
    pub not_before: u64,
    /// End of validity (unix seconds).
    pub not_after: u64,
    /// Creation time (unix seconds).
    pub created_at: u64,
}

impl CaKeyPair {
    /// Whether `now` lies inside the validity window.
    pub fn is_valid_at(&self, now: u64) -> bool {
        self.not_before <= now && now < self.not_after
    }

    /// Seconds of validity left at `now`.
    pub fn remaining(&self, now: u64) -> u64 {
        self.not_after.saturating_sub(now)
    }
}

impl fmt::Debug for CaKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaKeyPair")
            .field("hierarchy", &self.hierarchy)
            .field("serial", &self.serial)
            .field("key_pem", &"[REDACTED]")
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Bootstrap trust budget of a hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoApprovalCounter {
    /// Owning hierarchy.
    pub hierarchy: Hierarchy,
    /// Requests that may be signed without an operator.
    pub max_count: u64,
    /// Requests signed that way so far.
    pub used_count: u64,
    /// When set, `max_count` can no longer be raised.
    pub locked: bool,
}

impl AutoApprovalCounter {
    /// Whether another request may still be auto-approved.
    pub fn has_remaining(&self) -> bool {
        self.used_count < self.max_count
    }
}

/// A row of the backup stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "table", rename_all = "snake_case")]
pub enum DumpRow {
    /// A named per-hierarchy counter.
    Counter {
        /// Owning hierarchy.
        hierarchy: Hierarchy,
        /// Counter name.
        name: String,
        /// Counter value.
        value: u64,
    },
    /// A CA generation.
    CaKeyPair(CaKeyPair),
    /// A signing request.
    Csr(CsrRecord),
    /// An issued certificate.
    Certificate(IssuedCertificate),
    /// A revocation.
    Revocation(RevokedEntry),
}

/// Resume point of a dump: the next row comes after this position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpCursor {
    /// Index into the requested hierarchies.
    pub hierarchy: usize,
    /// Index into the fixed table order.
    pub table: usize,
    /// Last row id emitted from that table.
    pub last_rowid: i64,
}
