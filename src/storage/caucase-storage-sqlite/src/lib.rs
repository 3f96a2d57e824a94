//! # Caucase Storage - SQLite Backend
//!
//! SQLite implementation of the certificate store.
//!
//! One database file holds both hierarchies, every row keyed by its
//! hierarchy. Writers are serialized by an in-process lock and each
//! read-modify-write runs in a single transaction, so invariant checks and
//! the writes depending on them commit together or not at all. The journal
//! runs in WAL mode, letting backup readers hold a snapshot while writers
//! proceed.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod dump;
mod rows;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tokio::sync::Mutex;
use tracing::{debug, info};

use caucase_storage::{
    AutoApprovalCounter, CaKeyPair, CertificateStore, CsrRecord, CsrStatus, CsrSubmission,
    DumpCursor, DumpReader, DumpRow, Hierarchy, IssuedCertificate, NewCertificate, NewCsr,
    RevokedEntry, StorageError,
};

use crate::dump::SqliteDumpReader;
use crate::rows::{
    query_failed, CaKeyPairRow, CertificateRow, CsrRow, RevocationRow, AUTO_APPROVE_LOCKED,
    AUTO_APPROVE_MAX, AUTO_APPROVE_USED, CRL_NUMBER,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS counters (
    hierarchy TEXT NOT NULL,
    name      TEXT NOT NULL,
    value     INTEGER NOT NULL,
    PRIMARY KEY (hierarchy, name)
);

CREATE TABLE IF NOT EXISTS ca_key_pairs (
    hierarchy       TEXT NOT NULL,
    serial          TEXT NOT NULL,
    key_pem         TEXT NOT NULL,
    certificate_pem TEXT NOT NULL,
    not_before      INTEGER NOT NULL,
    not_after       INTEGER NOT NULL,
    created_at      INTEGER NOT NULL,
    PRIMARY KEY (hierarchy, serial)
);

CREATE TABLE IF NOT EXISTS csrs (
    hierarchy          TEXT NOT NULL,
    id                 INTEGER NOT NULL,
    content_hash       TEXT NOT NULL,
    csr_pem            TEXT NOT NULL,
    submitted_at       INTEGER NOT NULL,
    status             TEXT NOT NULL,
    reason             TEXT,
    certificate_serial TEXT,
    PRIMARY KEY (hierarchy, id)
);

CREATE INDEX IF NOT EXISTS idx_csrs_pending ON csrs (hierarchy, status, content_hash);

CREATE TABLE IF NOT EXISTS certificates (
    hierarchy       TEXT NOT NULL,
    serial          TEXT NOT NULL,
    csr_id          INTEGER NOT NULL,
    certificate_pem TEXT NOT NULL,
    issued_at       INTEGER NOT NULL,
    not_before      INTEGER NOT NULL,
    not_after       INTEGER NOT NULL,
    auto_signed     INTEGER NOT NULL,
    PRIMARY KEY (hierarchy, serial)
);

CREATE TABLE IF NOT EXISTS revocations (
    hierarchy  TEXT NOT NULL,
    serial     TEXT NOT NULL,
    revoked_at INTEGER NOT NULL,
    reason     TEXT NOT NULL,
    not_after  INTEGER NOT NULL,
    PRIMARY KEY (hierarchy, serial)
);

CREATE TABLE IF NOT EXISTS settings (
    key        TEXT PRIMARY KEY,
    value      TEXT NOT NULL,
    updated_at INTEGER NOT NULL
)
"#;

/// SQLite certificate store.
///
/// The database lives at `{base_path}/{name}.db`.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
    db_path: PathBuf,
}

impl SqliteStore {
    /// Opens or creates a store.
    ///
    /// # Arguments
    ///
    /// * `base_path` - Directory holding the database file
    /// * `name` - File stem (must match `[a-z0-9_-]+`)
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Name is invalid
    /// - Directory cannot be created
    /// - Database connection fails
    pub async fn open(base_path: impl AsRef<Path>, name: &str) -> Result<Self, StorageError> {
        Self::validate_name(name)?;

        let base = base_path.as_ref();
        std::fs::create_dir_all(base).map_err(|e| {
            StorageError::ConnectionFailed(format!("failed to create directory: {e}"))
        })?;

        let db_path = Self::database_path(base, name);
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        debug!(name = %name, path = %db_path.display(), "Opening SQLite database");

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        let store = Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
            db_path,
        };

        store.migrate().await?;

        info!(path = %store.db_path.display(), "Certificate store ready");

        Ok(store)
    }

    /// Location of the database file `open` would use.
    pub fn database_path(base_path: impl AsRef<Path>, name: &str) -> PathBuf {
        base_path.as_ref().join(format!("{name}.db"))
    }

    /// Location of this store's database file.
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Copies every committed page from the write-ahead log into the main
    /// database file and truncates the log.
    ///
    /// Afterwards the `.db` file alone holds the whole store and can be moved
    /// or copied without its `-wal` side file.
    ///
    /// # Errors
    ///
    /// Fails if a reader still pins part of the log.
    pub async fn checkpoint(&self) -> Result<(), StorageError> {
        let (busy, log_frames, checkpointed): (i64, i64, i64) =
            sqlx::query_as("PRAGMA wal_checkpoint(TRUNCATE)")
                .fetch_one(&self.pool)
                .await
                .map_err(query_failed)?;
        if busy != 0 {
            return Err(StorageError::Transaction(format!(
                "checkpoint blocked, {checkpointed} of {log_frames} frames copied"
            )));
        }
        debug!(path = %self.db_path.display(), "Journal checkpointed");
        Ok(())
    }

    /// Checkpoints the journal, then closes every pooled connection.
    ///
    /// The pool is closed even when the checkpoint fails.
    pub async fn close(self) -> Result<(), StorageError> {
        let checkpointed = self.checkpoint().await;
        self.pool.close().await;
        checkpointed
    }

    /// Only allows lowercase letters, digits, underscore, hyphen.
    fn validate_name(name: &str) -> Result<(), StorageError> {
        if name.is_empty() {
            return Err(StorageError::InvalidInput("store name cannot be empty".into()));
        }

        if name.len() > 64 {
            return Err(StorageError::InvalidInput("store name too long".into()));
        }

        let valid = name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');

        if !valid {
            return Err(StorageError::InvalidInput(
                "store name must match [a-z0-9_-]+".into(),
            ));
        }

        Ok(())
    }

    async fn migrate(&self) -> Result<(), StorageError> {
        debug!("Running database migrations");

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::ConnectionFailed(format!("failed to enable WAL: {e}")))?;

        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement.trim())
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::ConnectionFailed(format!("migration failed: {e}")))?;
        }

        debug!("Migrations complete");

        Ok(())
    }

    fn now() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default()
    }

    async fn acquire(&self) -> Result<sqlx::pool::PoolConnection<sqlx::Sqlite>, StorageError> {
        self.pool
            .acquire()
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))
    }

    async fn begin(&self) -> Result<sqlx::Transaction<'static, sqlx::Sqlite>, StorageError> {
        self.pool
            .begin()
            .await
            .map_err(|e| StorageError::Transaction(e.to_string()))
    }
}

async fn commit(tx: sqlx::Transaction<'static, sqlx::Sqlite>) -> Result<(), StorageError> {
    tx.commit()
        .await
        .map_err(|e| StorageError::Transaction(e.to_string()))
}

#[async_trait]
impl CertificateStore for SqliteStore {
    async fn insert_csr(
        &self,
        hierarchy: Hierarchy,
        csr: NewCsr,
        ceiling: u64,
    ) -> Result<CsrSubmission, StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.begin().await?;

        if let Some(id) = rows::find_pending(&mut tx, hierarchy, &csr.content_hash).await? {
            debug!(hierarchy = %hierarchy, csr_id = id, "Identical request already pending");
            return Ok(CsrSubmission { id, created: false });
        }

        let id = rows::allocate_csr_id(&mut tx, hierarchy, Some(ceiling)).await?;
        let record = CsrRecord {
            hierarchy,
            id,
            content_hash: csr.content_hash,
            csr_pem: csr.csr_pem,
            submitted_at: csr.submitted_at,
            status: CsrStatus::Pending,
            reason: None,
            certificate_serial: None,
        };
        rows::insert_csr_row(&mut tx, &record).await?;
        commit(tx).await?;

        Ok(CsrSubmission { id, created: true })
    }

    async fn find_pending_by_hash(
        &self,
        hierarchy: Hierarchy,
        content_hash: &str,
    ) -> Result<Option<u64>, StorageError> {
        let mut conn = self.acquire().await?;
        rows::find_pending(&mut conn, hierarchy, content_hash).await
    }

    async fn get_csr(
        &self,
        hierarchy: Hierarchy,
        id: u64,
    ) -> Result<Option<CsrRecord>, StorageError> {
        let mut conn = self.acquire().await?;
        rows::fetch_csr(&mut conn, hierarchy, id).await
    }

    async fn list_pending(&self, hierarchy: Hierarchy) -> Result<Vec<CsrRecord>, StorageError> {
        let found: Vec<CsrRow> = sqlx::query_as(
            r#"
            SELECT rowid, id, content_hash, csr_pem, submitted_at, status, reason, certificate_serial
            FROM csrs WHERE hierarchy = ? AND status = 'pending' ORDER BY id
            "#,
        )
        .bind(hierarchy.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed)?;

        found
            .into_iter()
            .map(|r| rows::csr_from_row(hierarchy, r))
            .collect()
    }

    async fn pending_count(&self, hierarchy: Hierarchy) -> Result<u64, StorageError> {
        let mut conn = self.acquire().await?;
        rows::count_pending(&mut conn, hierarchy).await
    }

    async fn mark_signed(
        &self,
        hierarchy: Hierarchy,
        id: u64,
        certificate: NewCertificate,
        consume_auto_approval: bool,
    ) -> Result<IssuedCertificate, StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.begin().await?;

        let csr = rows::fetch_csr(&mut tx, hierarchy, id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("{hierarchy} request {id}")))?;
        if csr.status != CsrStatus::Pending {
            return Err(StorageError::Conflict(format!(
                "{hierarchy} request {id} is already {}",
                csr.status.as_str()
            )));
        }

        if consume_auto_approval {
            let counter = rows::read_auto_approval(&mut tx, hierarchy).await?;
            if !counter.has_remaining() {
                return Err(StorageError::ResourceExhausted(format!(
                    "{hierarchy} auto-approval budget of {} is used up",
                    counter.max_count
                )));
            }
            rows::write_counter(&mut tx, hierarchy, AUTO_APPROVE_USED, counter.used_count + 1)
                .await?;
        }

        let issued = certificate.into_issued(hierarchy, id);
        rows::insert_certificate_row(&mut tx, &issued).await?;

        sqlx::query(
            "UPDATE csrs SET status = 'signed', certificate_serial = ? WHERE hierarchy = ? AND id = ?",
        )
        .bind(&issued.serial)
        .bind(hierarchy.as_str())
        .bind(id as i64)
        .execute(&mut *tx)
        .await
        .map_err(query_failed)?;

        commit(tx).await?;

        Ok(issued)
    }

    async fn mark_rejected(
        &self,
        hierarchy: Hierarchy,
        id: u64,
        reason: &str,
    ) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.begin().await?;

        let csr = rows::fetch_csr(&mut tx, hierarchy, id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("{hierarchy} request {id}")))?;
        if csr.status != CsrStatus::Pending {
            return Err(StorageError::Conflict(format!(
                "{hierarchy} request {id} is already {}",
                csr.status.as_str()
            )));
        }

        sqlx::query(
            "UPDATE csrs SET status = 'rejected', reason = ? WHERE hierarchy = ? AND id = ?",
        )
        .bind(reason)
        .bind(hierarchy.as_str())
        .bind(id as i64)
        .execute(&mut *tx)
        .await
        .map_err(query_failed)?;

        commit(tx).await
    }

    async fn record_internal_issuance(
        &self,
        hierarchy: Hierarchy,
        csr: NewCsr,
        certificate: NewCertificate,
    ) -> Result<IssuedCertificate, StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.begin().await?;

        let id = rows::allocate_csr_id(&mut tx, hierarchy, None).await?;
        let issued = certificate.into_issued(hierarchy, id);
        let record = CsrRecord {
            hierarchy,
            id,
            content_hash: csr.content_hash,
            csr_pem: csr.csr_pem,
            submitted_at: csr.submitted_at,
            status: CsrStatus::Signed,
            reason: None,
            certificate_serial: Some(issued.serial.clone()),
        };
        rows::insert_csr_row(&mut tx, &record).await?;
        rows::insert_certificate_row(&mut tx, &issued).await?;
        commit(tx).await?;

        Ok(issued)
    }

    async fn get_issued_certificate(
        &self,
        hierarchy: Hierarchy,
        serial: &str,
    ) -> Result<Option<IssuedCertificate>, StorageError> {
        let row: Option<CertificateRow> = sqlx::query_as(
            r#"
            SELECT rowid, serial, csr_id, certificate_pem, issued_at, not_before, not_after, auto_signed
            FROM certificates WHERE hierarchy = ? AND serial = ?
            "#,
        )
        .bind(hierarchy.as_str())
        .bind(serial)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_failed)?;

        Ok(row.map(|r| rows::certificate_from_row(hierarchy, r)))
    }

    async fn list_issued(
        &self,
        hierarchy: Hierarchy,
    ) -> Result<Vec<IssuedCertificate>, StorageError> {
        let found: Vec<CertificateRow> = sqlx::query_as(
            r#"
            SELECT rowid, serial, csr_id, certificate_pem, issued_at, not_before, not_after, auto_signed
            FROM certificates WHERE hierarchy = ? ORDER BY rowid
            "#,
        )
        .bind(hierarchy.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed)?;

        Ok(found
            .into_iter()
            .map(|r| rows::certificate_from_row(hierarchy, r))
            .collect())
    }

    async fn insert_revocation(
        &self,
        hierarchy: Hierarchy,
        serial: &str,
        reason: &str,
        revoked_at: u64,
    ) -> Result<RevokedEntry, StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.begin().await?;

        let issued: Option<(i64,)> = sqlx::query_as(
            "SELECT not_after FROM certificates WHERE hierarchy = ? AND serial = ?",
        )
        .bind(hierarchy.as_str())
        .bind(serial)
        .fetch_optional(&mut *tx)
        .await
        .map_err(query_failed)?;

        let Some((not_after,)) = issued else {
            return Err(StorageError::Conflict(format!(
                "{hierarchy} never issued serial {serial}"
            )));
        };

        let entry = RevokedEntry {
            hierarchy,
            serial: serial.to_string(),
            revoked_at,
            reason: reason.to_string(),
            not_after: not_after as u64,
        };

        rows::insert_revocation_row(&mut tx, &entry)
            .await
            .map_err(|e| match e {
                StorageError::Conflict(_) => {
                    StorageError::Conflict(format!("{hierarchy} serial {serial} already revoked"))
                },
                other => other,
            })?;
        commit(tx).await?;

        Ok(entry)
    }

    async fn is_revoked(&self, hierarchy: Hierarchy, serial: &str) -> Result<bool, StorageError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM revocations WHERE hierarchy = ? AND serial = ?")
                .bind(hierarchy.as_str())
                .bind(serial)
                .fetch_optional(&self.pool)
                .await
                .map_err(query_failed)?;
        Ok(row.is_some())
    }

    async fn list_revocations(
        &self,
        hierarchy: Hierarchy,
    ) -> Result<Vec<RevokedEntry>, StorageError> {
        let found: Vec<RevocationRow> = sqlx::query_as(
            r#"
            SELECT rowid, serial, revoked_at, reason, not_after
            FROM revocations WHERE hierarchy = ? ORDER BY rowid
            "#,
        )
        .bind(hierarchy.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed)?;

        Ok(found
            .into_iter()
            .map(|r| rows::revocation_from_row(hierarchy, r))
            .collect())
    }

    async fn insert_ca_key_pair(&self, pair: &CaKeyPair) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut conn = self.acquire().await?;
        rows::insert_ca_key_pair_row(&mut conn, pair).await?;

        info!(hierarchy = %pair.hierarchy, serial = %pair.serial, "CA key pair stored");

        Ok(())
    }

    async fn list_ca_key_pairs(
        &self,
        hierarchy: Hierarchy,
    ) -> Result<Vec<CaKeyPair>, StorageError> {
        let found: Vec<CaKeyPairRow> = sqlx::query_as(
            r#"
            SELECT rowid, serial, key_pem, certificate_pem, not_before, not_after, created_at
            FROM ca_key_pairs WHERE hierarchy = ? ORDER BY not_before, rowid
            "#,
        )
        .bind(hierarchy.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed)?;

        Ok(found
            .into_iter()
            .map(|r| rows::ca_key_pair_from_row(hierarchy, r))
            .collect())
    }

    async fn auto_approval(
        &self,
        hierarchy: Hierarchy,
    ) -> Result<AutoApprovalCounter, StorageError> {
        let mut conn = self.acquire().await?;
        rows::read_auto_approval(&mut conn, hierarchy).await
    }

    async fn configure_auto_approval(
        &self,
        hierarchy: Hierarchy,
        max_count: u64,
        lock: bool,
    ) -> Result<AutoApprovalCounter, StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.begin().await?;

        let current = rows::read_auto_approval(&mut tx, hierarchy).await?;
        if current.locked && max_count > current.max_count {
            return Err(StorageError::Conflict(format!(
                "{hierarchy} auto-approval count is locked at {}",
                current.max_count
            )));
        }

        // Lowering below what was already used keeps used_count <= max_count.
        let max_count = if current.locked {
            current.max_count
        } else {
            max_count.max(current.used_count)
        };
        let locked = current.locked || lock;

        rows::write_counter(&mut tx, hierarchy, AUTO_APPROVE_MAX, max_count).await?;
        rows::write_counter(&mut tx, hierarchy, AUTO_APPROVE_USED, current.used_count).await?;
        rows::write_counter(&mut tx, hierarchy, AUTO_APPROVE_LOCKED, u64::from(locked)).await?;
        commit(tx).await?;

        Ok(AutoApprovalCounter {
            hierarchy,
            max_count,
            used_count: current.used_count,
            locked,
        })
    }

    async fn next_crl_number(&self, hierarchy: Hierarchy) -> Result<u64, StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.begin().await?;

        let number = rows::read_counter(&mut tx, hierarchy, CRL_NUMBER)
            .await?
            .unwrap_or(0)
            + 1;
        rows::write_counter(&mut tx, hierarchy, CRL_NUMBER, number).await?;
        commit(tx).await?;

        Ok(number)
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>, StorageError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_failed)?;
        Ok(row.map(|(v,)| v))
    }

    async fn put_setting(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            r#"
            INSERT INTO settings (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Self::now())
        .execute(&self.pool)
        .await
        .map_err(query_failed)?;
        Ok(())
    }

    async fn dump_iterator(
        &self,
        hierarchies: &[Hierarchy],
        resume: Option<DumpCursor>,
    ) -> Result<Box<dyn DumpReader>, StorageError> {
        let tx = self.begin().await?;
        Ok(Box::new(SqliteDumpReader::new(
            tx,
            hierarchies.to_vec(),
            resume.unwrap_or_default(),
        )))
    }

    async fn bulk_load(&self, batch: &[DumpRow]) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.begin().await?;

        for row in batch {
            match row {
                DumpRow::Counter {
                    hierarchy,
                    name,
                    value,
                } => rows::write_counter(&mut tx, *hierarchy, name, *value).await?,
                DumpRow::CaKeyPair(pair) => rows::insert_ca_key_pair_row(&mut tx, pair).await?,
                DumpRow::Csr(csr) => rows::insert_csr_row(&mut tx, csr).await?,
                DumpRow::Certificate(certificate) => {
                    rows::insert_certificate_row(&mut tx, certificate).await?
                },
                DumpRow::Revocation(entry) => rows::insert_revocation_row(&mut tx, entry).await?,
            }
        }

        commit(tx).await?;
        debug!(rows = batch.len(), "Bulk load committed");

        Ok(())
    }
}
