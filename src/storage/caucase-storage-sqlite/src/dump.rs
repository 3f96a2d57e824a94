//! Snapshot reader behind [`CertificateStore::dump_iterator`].
//!
//! [`CertificateStore::dump_iterator`]: caucase_storage::CertificateStore::dump_iterator

use async_trait::async_trait;
use sqlx::{Sqlite, Transaction};

use caucase_storage::{DumpCursor, DumpReader, DumpRow, Hierarchy, StorageError};

use crate::rows::{
    self, query_failed, CaKeyPairRow, CertificateRow, CounterRow, CsrRow, RevocationRow,
};

/// Tables in dump order. Counters come first so a partial load never sees
/// rows ahead of the id allocator.
const TABLES: [&str; 5] = ["counters", "ca_key_pairs", "csrs", "certificates", "revocations"];

/// Pages through one read transaction; in WAL mode it never blocks writers.
pub(crate) struct SqliteDumpReader {
    tx: Transaction<'static, Sqlite>,
    hierarchies: Vec<Hierarchy>,
    cursor: DumpCursor,
}

impl SqliteDumpReader {
    pub(crate) fn new(
        tx: Transaction<'static, Sqlite>,
        hierarchies: Vec<Hierarchy>,
        cursor: DumpCursor,
    ) -> Self {
        Self {
            tx,
            hierarchies,
            cursor,
        }
    }

    /// Reads rows of the current table after the cursor, returning each with its rowid.
    async fn read_table(
        &mut self,
        hierarchy: Hierarchy,
        limit: usize,
    ) -> Result<Vec<(i64, DumpRow)>, StorageError> {
        let h = hierarchy.as_str();
        let after = self.cursor.last_rowid;
        let limit = limit as i64;
        let table = self.cursor.table;
        let conn = &mut *self.tx;

        let page = match table {
            0 => {
                let found: Vec<CounterRow> = sqlx::query_as(
                    "SELECT rowid, name, value FROM counters WHERE hierarchy = ? AND rowid > ? ORDER BY rowid LIMIT ?",
                )
                .bind(h)
                .bind(after)
                .bind(limit)
                .fetch_all(&mut *conn)
                .await
                .map_err(query_failed)?;
                found
                    .into_iter()
                    .map(|(rowid, name, value)| {
                        (
                            rowid,
                            DumpRow::Counter {
                                hierarchy,
                                name,
                                value: value as u64,
                            },
                        )
                    })
                    .collect()
            },
            1 => {
                let found: Vec<CaKeyPairRow> = sqlx::query_as(
                    r#"
                    SELECT rowid, serial, key_pem, certificate_pem, not_before, not_after, created_at
                    FROM ca_key_pairs WHERE hierarchy = ? AND rowid > ? ORDER BY rowid LIMIT ?
                    "#,
                )
                .bind(h)
                .bind(after)
                .bind(limit)
                .fetch_all(&mut *conn)
                .await
                .map_err(query_failed)?;
                found
                    .into_iter()
                    .map(|r| (r.0, DumpRow::CaKeyPair(rows::ca_key_pair_from_row(hierarchy, r))))
                    .collect()
            },
            2 => {
                let found: Vec<CsrRow> = sqlx::query_as(
                    r#"
                    SELECT rowid, id, content_hash, csr_pem, submitted_at, status, reason, certificate_serial
                    FROM csrs WHERE hierarchy = ? AND rowid > ? ORDER BY rowid LIMIT ?
                    "#,
                )
                .bind(h)
                .bind(after)
                .bind(limit)
                .fetch_all(&mut *conn)
                .await
                .map_err(query_failed)?;
                found
                    .into_iter()
                    .map(|r| Ok((r.0, DumpRow::Csr(rows::csr_from_row(hierarchy, r)?))))
                    .collect::<Result<Vec<_>, StorageError>>()?
            },
            3 => {
                let found: Vec<CertificateRow> = sqlx::query_as(
                    r#"
                    SELECT rowid, serial, csr_id, certificate_pem, issued_at, not_before, not_after, auto_signed
                    FROM certificates WHERE hierarchy = ? AND rowid > ? ORDER BY rowid LIMIT ?
                    "#,
                )
                .bind(h)
                .bind(after)
                .bind(limit)
                .fetch_all(&mut *conn)
                .await
                .map_err(query_failed)?;
                found
                    .into_iter()
                    .map(|r| (r.0, DumpRow::Certificate(rows::certificate_from_row(hierarchy, r))))
                    .collect()
            },
            _ => {
                let found: Vec<RevocationRow> = sqlx::query_as(
                    r#"
                    SELECT rowid, serial, revoked_at, reason, not_after
                    FROM revocations WHERE hierarchy = ? AND rowid > ? ORDER BY rowid LIMIT ?
                    "#,
                )
                .bind(h)
                .bind(after)
                .bind(limit)
                .fetch_all(&mut *conn)
                .await
                .map_err(query_failed)?;
                found
                    .into_iter()
                    .map(|r| (r.0, DumpRow::Revocation(rows::revocation_from_row(hierarchy, r))))
                    .collect()
            },
        };

        Ok(page)
    }

    fn advance_table(&mut self) {
        self.cursor.table += 1;
        self.cursor.last_rowid = 0;
        if self.cursor.table == TABLES.len() {
            self.cursor.table = 0;
            self.cursor.hierarchy += 1;
        }
    }
}

#[async_trait]
impl DumpReader for SqliteDumpReader {
    async fn next_page(&mut self, limit: usize) -> Result<Vec<DumpRow>, StorageError> {
        let mut page = Vec::new();

        while page.len() < limit {
            let Some(&hierarchy) = self.hierarchies.get(self.cursor.hierarchy) else {
                break;
            };

            let wanted = limit - page.len();
            let found = self.read_table(hierarchy, wanted).await?;
            let exhausted = found.len() < wanted;

            if let Some((rowid, _)) = found.last() {
                self.cursor.last_rowid = *rowid;
            }
            page.extend(found.into_iter().map(|(_, row)| row));

            if exhausted {
                self.advance_table();
            }
        }

        Ok(page)
    }

    fn cursor(&self) -> DumpCursor {
        self.cursor
    }
}
