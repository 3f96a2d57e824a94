//! Store trait definition.

use async_trait::async_trait;

use crate::error::StorageError;
use crate::model::{
    AutoApprovalCounter, CaKeyPair, CsrRecord, CsrSubmission, DumpCursor, DumpRow, Hierarchy,
    IssuedCertificate, NewCertificate, NewCsr, RevokedEntry,
};

/// Durable persistence for both hierarchies.
///
/// Every method that reads an invariant and then writes (id allocation,
/// pending ceiling, status transitions, revocations, counters) is atomic
/// against concurrent callers.
#[async_trait]
pub trait CertificateStore: Send + Sync {
    /// Stores a pending request.
    ///
    /// Looks up an identical pending request first and returns its id if
    /// found. Otherwise allocates the next id, refusing with
    /// [`StorageError::ResourceExhausted`] when `ceiling` requests are
    /// already pending.
    async fn insert_csr(
        &self,
        hierarchy: Hierarchy,
        csr: NewCsr,
        ceiling: u64,
    ) -> Result<CsrSubmission, StorageError>;

    /// Finds a pending request by content hash.
    async fn find_pending_by_hash(
        &self,
        hierarchy: Hierarchy,
        content_hash: &str,
    ) -> Result<Option<u64>, StorageError>;

    /// Fetches a request by id.
    async fn get_csr(&self, hierarchy: Hierarchy, id: u64)
        -> Result<Option<CsrRecord>, StorageError>;

    /// Lists pending requests, oldest first.
    async fn list_pending(&self, hierarchy: Hierarchy) -> Result<Vec<CsrRecord>, StorageError>;

    /// Number of pending requests.
    async fn pending_count(&self, hierarchy: Hierarchy) -> Result<u64, StorageError>;

    /// Records the certificate and moves the request to Signed.
    ///
    /// With `consume_auto_approval` the auto-approval counter is checked and
    /// incremented in the same transaction.
    async fn mark_signed(
        &self,
        hierarchy: Hierarchy,
        id: u64,
        certificate: NewCertificate,
        consume_auto_approval: bool,
    ) -> Result<IssuedCertificate, StorageError>;

    /// Moves the request to Rejected.
    async fn mark_rejected(
        &self,
        hierarchy: Hierarchy,
        id: u64,
        reason: &str,
    ) -> Result<(), StorageError>;

    /// Stores a request directly as Signed together with its certificate.
    ///
    /// Used for issuance that never waits for a decision, so it does not count
    /// against the pending ceiling.
    async fn record_internal_issuance(
        &self,
        hierarchy: Hierarchy,
        csr: NewCsr,
        certificate: NewCertificate,
    ) -> Result<IssuedCertificate, StorageError>;

    /// Fetches an issued certificate by serial.
    async fn get_issued_certificate(
        &self,
        hierarchy: Hierarchy,
        serial: &str,
    ) -> Result<Option<IssuedCertificate>, StorageError>;

    /// Lists issued certificates in issuance order.
    async fn list_issued(&self, hierarchy: Hierarchy)
        -> Result<Vec<IssuedCertificate>, StorageError>;

    /// Appends a revocation.
    ///
    /// Fails with [`StorageError::Conflict`] if the serial is already revoked
    /// or was never issued in this hierarchy.
    async fn insert_revocation(
        &self,
        hierarchy: Hierarchy,
        serial: &str,
        reason: &str,
        revoked_at: u64,
    ) -> Result<RevokedEntry, StorageError>;

    /// Whether the serial has been revoked.
    async fn is_revoked(&self, hierarchy: Hierarchy, serial: &str) -> Result<bool, StorageError>;

    /// Lists revocations in revocation order.
    async fn list_revocations(&self, hierarchy: Hierarchy)
        -> Result<Vec<RevokedEntry>, StorageError>;

    /// Stores a new CA generation.
    async fn insert_ca_key_pair(&self, pair: &CaKeyPair) -> Result<(), StorageError>;

    /// Lists CA generations ordered by `not_before`.
    async fn list_ca_key_pairs(&self, hierarchy: Hierarchy)
        -> Result<Vec<CaKeyPair>, StorageError>;

    /// Reads the auto-approval counter. Unconfigured hierarchies read as zero.
    async fn auto_approval(&self, hierarchy: Hierarchy)
        -> Result<AutoApprovalCounter, StorageError>;

    /// Applies the configured auto-approval budget.
    ///
    /// A locked counter refuses a larger `max_count` with
    /// [`StorageError::Conflict`] and keeps its value otherwise. `lock` sets
    /// the lock permanently.
    async fn configure_auto_approval(
        &self,
        hierarchy: Hierarchy,
        max_count: u64,
        lock: bool,
    ) -> Result<AutoApprovalCounter, StorageError>;

    /// Allocates the next CRL number.
    async fn next_crl_number(&self, hierarchy: Hierarchy) -> Result<u64, StorageError>;

    /// Reads a store-wide setting.
    async fn get_setting(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Writes a store-wide setting.
    async fn put_setting(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Opens a consistent, ordered row stream over the given hierarchies.
    ///
    /// Passing a cursor saved from an earlier reader resumes right after it.
    async fn dump_iterator(
        &self,
        hierarchies: &[Hierarchy],
        resume: Option<DumpCursor>,
    ) -> Result<Box<dyn DumpReader>, StorageError>;

    /// Inserts rows produced by a dump, all or nothing.
    async fn bulk_load(&self, rows: &[DumpRow]) -> Result<(), StorageError>;
}

/// Lazy, bounded-page reader over a store snapshot.
#[async_trait]
pub trait DumpReader: Send {
    /// Returns up to `limit` rows. An empty page means the stream is exhausted.
    async fn next_page(&mut self, limit: usize) -> Result<Vec<DumpRow>, StorageError>;

    /// Position after the last row returned.
    fn cursor(&self) -> DumpCursor;
}
