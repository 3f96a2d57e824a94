//! Row mapping and statements shared by the store and the dump reader.
//!
//! Every helper takes a bare connection so callers decide whether it runs
//! inside a transaction.

use sqlx::SqliteConnection;

use caucase_storage::{
    AutoApprovalCounter, CaKeyPair, CsrRecord, CsrStatus, Hierarchy, IssuedCertificate,
    RevokedEntry, StorageError,
};

pub(crate) const NEXT_CSR_ID: &str = "next_csr_id";
pub(crate) const AUTO_APPROVE_MAX: &str = "auto_approve_max";
pub(crate) const AUTO_APPROVE_USED: &str = "auto_approve_used";
pub(crate) const AUTO_APPROVE_LOCKED: &str = "auto_approve_locked";
pub(crate) const CRL_NUMBER: &str = "crl_number";

pub(crate) type CounterRow = (i64, String, i64);
pub(crate) type CaKeyPairRow = (i64, String, String, String, i64, i64, i64);
pub(crate) type CsrRow = (i64, i64, String, String, i64, String, Option<String>, Option<String>);
pub(crate) type CertificateRow = (i64, String, i64, String, i64, i64, i64, bool);
pub(crate) type RevocationRow = (i64, String, i64, String, i64);

/// Maps a sqlx error, turning uniqueness violations into conflicts.
pub(crate) fn query_failed(e: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            return StorageError::Conflict(db.message().to_string());
        }
    }
    StorageError::QueryFailed(e.to_string())
}

pub(crate) fn ca_key_pair_from_row(hierarchy: Hierarchy, row: CaKeyPairRow) -> CaKeyPair {
    let (_, serial, key_pem, certificate_pem, not_before, not_after, created_at) = row;
    CaKeyPair {
        hierarchy,
        serial,
        key_pem,
        certificate_pem,
        not_before: not_before as u64,
        not_after: not_after as u64,
        created_at: created_at as u64,
    }
}

pub(crate) fn csr_from_row(hierarchy: Hierarchy, row: CsrRow) -> Result<CsrRecord, StorageError> {
    let (_, id, content_hash, csr_pem, submitted_at, status, reason, certificate_serial) = row;
    Ok(CsrRecord {
        hierarchy,
        id: id as u64,
        content_hash,
        csr_pem,
        submitted_at: submitted_at as u64,
        status: status.parse::<CsrStatus>()?,
        reason,
        certificate_serial,
    })
}

pub(crate) fn certificate_from_row(hierarchy: Hierarchy, row: CertificateRow) -> IssuedCertificate {
    let (_, serial, csr_id, certificate_pem, issued_at, not_before, not_after, auto_signed) = row;
    IssuedCertificate {
        hierarchy,
        serial,
        csr_id: csr_id as u64,
        certificate_pem,
        issued_at: issued_at as u64,
        not_before: not_before as u64,
        not_after: not_after as u64,
        auto_signed,
    }
}

pub(crate) fn revocation_from_row(hierarchy: Hierarchy, row: RevocationRow) -> RevokedEntry {
    let (_, serial, revoked_at, reason, not_after) = row;
    RevokedEntry {
        hierarchy,
        serial,
        revoked_at: revoked_at as u64,
        reason,
        not_after: not_after as u64,
    }
}

pub(crate) async fn read_counter(
    conn: &mut SqliteConnection,
    hierarchy: Hierarchy,
    name: &str,
) -> Result<Option<u64>, StorageError> {
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT value FROM counters WHERE hierarchy = ? AND name = ?")
            .bind(hierarchy.as_str())
            .bind(name)
            .fetch_optional(&mut *conn)
            .await
            .map_err(query_failed)?;
    Ok(row.map(|(v,)| v as u64))
}

pub(crate) async fn write_counter(
    conn: &mut SqliteConnection,
    hierarchy: Hierarchy,
    name: &str,
    value: u64,
) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        INSERT INTO counters (hierarchy, name, value) VALUES (?, ?, ?)
        ON CONFLICT(hierarchy, name) DO UPDATE SET value = excluded.value
        "#,
    )
    .bind(hierarchy.as_str())
    .bind(name)
    .bind(value as i64)
    .execute(&mut *conn)
    .await
    .map_err(query_failed)?;
    Ok(())
}

pub(crate) async fn read_auto_approval(
    conn: &mut SqliteConnection,
    hierarchy: Hierarchy,
) -> Result<AutoApprovalCounter, StorageError> {
    let max_count = read_counter(conn, hierarchy, AUTO_APPROVE_MAX).await?.unwrap_or(0);
    let used_count = read_counter(conn, hierarchy, AUTO_APPROVE_USED).await?.unwrap_or(0);
    let locked = read_counter(conn, hierarchy, AUTO_APPROVE_LOCKED).await?.unwrap_or(0) != 0;
    Ok(AutoApprovalCounter {
        hierarchy,
        max_count,
        used_count,
        locked,
    })
}

pub(crate) async fn fetch_csr(
    conn: &mut SqliteConnection,
    hierarchy: Hierarchy,
    id: u64,
) -> Result<Option<CsrRecord>, StorageError> {
    let row: Option<CsrRow> = sqlx::query_as(
        r#"
        SELECT rowid, id, content_hash, csr_pem, submitted_at, status, reason, certificate_serial
        FROM csrs WHERE hierarchy = ? AND id = ?
        "#,
    )
    .bind(hierarchy.as_str())
    .bind(id as i64)
    .fetch_optional(&mut *conn)
    .await
    .map_err(query_failed)?;

    row.map(|r| csr_from_row(hierarchy, r)).transpose()
}

pub(crate) async fn find_pending(
    conn: &mut SqliteConnection,
    hierarchy: Hierarchy,
    content_hash: &str,
) -> Result<Option<u64>, StorageError> {
    let row: Option<(i64,)> = sqlx::query_as(
        "SELECT id FROM csrs WHERE hierarchy = ? AND status = 'pending' AND content_hash = ?",
    )
    .bind(hierarchy.as_str())
    .bind(content_hash)
    .fetch_optional(&mut *conn)
    .await
    .map_err(query_failed)?;
    Ok(row.map(|(id,)| id as u64))
}

pub(crate) async fn count_pending(
    conn: &mut SqliteConnection,
    hierarchy: Hierarchy,
) -> Result<u64, StorageError> {
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM csrs WHERE hierarchy = ? AND status = 'pending'")
            .bind(hierarchy.as_str())
            .fetch_one(&mut *conn)
            .await
            .map_err(query_failed)?;
    Ok(count as u64)
}

/// Hands out the next request id, checking the pending ceiling first.
pub(crate) async fn allocate_csr_id(
    conn: &mut SqliteConnection,
    hierarchy: Hierarchy,
    ceiling: Option<u64>,
) -> Result<u64, StorageError> {
    if let Some(ceiling) = ceiling {
        let pending = count_pending(conn, hierarchy).await?;
        if pending >= ceiling {
            return Err(StorageError::ResourceExhausted(format!(
                "{hierarchy} already holds {pending} pending requests"
            )));
        }
    }

    let id = read_counter(conn, hierarchy, NEXT_CSR_ID).await?.unwrap_or(1);
    write_counter(conn, hierarchy, NEXT_CSR_ID, id + 1).await?;
    Ok(id)
}

pub(crate) async fn insert_csr_row(
    conn: &mut SqliteConnection,
    csr: &CsrRecord,
) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        INSERT INTO csrs (hierarchy, id, content_hash, csr_pem, submitted_at, status, reason, certificate_serial)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(csr.hierarchy.as_str())
    .bind(csr.id as i64)
    .bind(&csr.content_hash)
    .bind(&csr.csr_pem)
    .bind(csr.submitted_at as i64)
    .bind(csr.status.as_str())
    .bind(csr.reason.as_deref())
    .bind(csr.certificate_serial.as_deref())
    .execute(&mut *conn)
    .await
    .map_err(query_failed)?;
    Ok(())
}

pub(crate) async fn insert_certificate_row(
    conn: &mut SqliteConnection,
    certificate: &IssuedCertificate,
) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        INSERT INTO certificates (hierarchy, serial, csr_id, certificate_pem, issued_at, not_before, not_after, auto_signed)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(certificate.hierarchy.as_str())
    .bind(&certificate.serial)
    .bind(certificate.csr_id as i64)
    .bind(&certificate.certificate_pem)
    .bind(certificate.issued_at as i64)
    .bind(certificate.not_before as i64)
    .bind(certificate.not_after as i64)
    .bind(certificate.auto_signed)
    .execute(&mut *conn)
    .await
    .map_err(query_failed)?;
    Ok(())
}

pub(crate) async fn insert_revocation_row(
    conn: &mut SqliteConnection,
    entry: &RevokedEntry,
) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        INSERT INTO revocations (hierarchy, serial, revoked_at, reason, not_after)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(entry.hierarchy.as_str())
    .bind(&entry.serial)
    .bind(entry.revoked_at as i64)
    .bind(&entry.reason)
    .bind(entry.not_after as i64)
    .execute(&mut *conn)
    .await
    .map_err(query_failed)?;
    Ok(())
}

pub(crate) async fn insert_ca_key_pair_row(
    conn: &mut SqliteConnection,
    pair: &CaKeyPair,
) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        INSERT INTO ca_key_pairs (hierarchy, serial, key_pem, certificate_pem, not_before, not_after, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(pair.hierarchy.as_str())
    .bind(&pair.serial)
    .bind(&pair.key_pem)
    .bind(&pair.certificate_pem)
    .bind(pair.not_before as i64)
    .bind(pair.not_after as i64)
    .bind(pair.created_at as i64)
    .execute(&mut *conn)
    .await
    .map_err(query_failed)?;
    Ok(())
}
