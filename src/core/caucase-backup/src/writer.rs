//! Periodic store snapshots.
//!
//! Rows are sealed under a fresh data key per file. The key is wrapped for
//! every currently valid, unrevoked user certificate with a P-256 key, so any
//! operator can restore and nobody else can read the CA keys.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use caucase_crypto::aead::KEY_SIZE;
use caucase_crypto::{envelope, random, ParsedCertificate};
use caucase_storage::{CertificateStore, Hierarchy};

use crate::error::BackupError;
use crate::format::{self, BackupHeader, BackupWriter, Digest, Recipient};

/// Default chunk size.
pub const DEFAULT_CHUNK_BYTES: usize = 1024 * 1024;

/// Rows pulled from the store per page.
const PAGE_ROWS: usize = 256;

/// A written backup file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupRecord {
    /// Final location.
    pub path: PathBuf,
    /// Unix seconds, also part of the file name.
    pub created_at: u64,
    /// Hex SHA-256 of each chunk, in file order.
    pub chunk_checksums: Vec<String>,
    /// Rows written.
    pub rows: u64,
    /// Serials of the user certificates able to restore it.
    pub recipients: Vec<String>,
}

/// `caucase-<created_at>.backup`
pub fn backup_file_name(created_at: u64) -> String {
    format!("caucase-{created_at}.backup")
}

/// Streams both hierarchies of `store` into a new file under `dir`.
///
/// Rows are buffered until a chunk reaches `chunk_bytes`, so memory stays
/// bounded by one chunk plus one page. The file only appears under its final
/// name once complete.
///
/// # Errors
///
/// [`BackupError::NoRecipients`] when no user certificate can receive the
/// data key; nothing is written then.
pub async fn write_backup(
    store: &dyn CertificateStore,
    dir: &Path,
    chunk_bytes: usize,
    now: u64,
) -> Result<BackupRecord, BackupError> {
    if chunk_bytes == 0 {
        return Err(BackupError::InvalidInput("chunk size must be positive".into()));
    }
    let (header, data_key) = recipients(store, now).await?;
    fs::create_dir_all(dir).await?;

    let path = dir.join(backup_file_name(now));
    let temp_path = path.with_extension("backup.tmp");

    let written = write_frames(store, &temp_path, &header, data_key, chunk_bytes).await;
    let (digests, rows) = match written {
        Ok(written) => written,
        Err(e) => {
            warn!(path = %temp_path.display(), error = %e, "Backup aborted");
            let _ = fs::remove_file(&temp_path).await;
            return Err(e);
        },
    };
    fs::rename(&temp_path, &path).await?;

    info!(
        path = %path.display(),
        rows,
        chunks = digests.len(),
        recipients = header.recipients.len(),
        "Backup written"
    );

    Ok(BackupRecord {
        path,
        created_at: now,
        chunk_checksums: digests.iter().map(hex::encode).collect(),
        rows,
        recipients: header.recipients.into_iter().map(|r| r.serial).collect(),
    })
}

/// Wraps a new data key for each user certificate able to receive it.
async fn recipients(
    store: &dyn CertificateStore,
    now: u64,
) -> Result<(BackupHeader, Zeroizing<[u8; KEY_SIZE]>), BackupError> {
    let data_key = random::generate_key();
    let mut recipients = Vec::new();

    for issued in store.list_issued(Hierarchy::User).await? {
        if issued.not_before > now || issued.not_after <= now {
            continue;
        }
        if store.is_revoked(Hierarchy::User, &issued.serial).await? {
            continue;
        }
        let Ok(certificate) = ParsedCertificate::from_pem(&issued.certificate_pem) else {
            warn!(serial = %issued.serial, "Unparseable user certificate skipped");
            continue;
        };
        if !envelope::can_receive(certificate.public_key()) {
            debug!(serial = %issued.serial, "Key type cannot receive a backup key");
            continue;
        }
        let wrapped = envelope::wrap_key(certificate.public_key(), &data_key)?;
        recipients.push(Recipient::new(&issued.serial, &wrapped));
    }

    if recipients.is_empty() {
        return Err(BackupError::NoRecipients);
    }
    Ok((BackupHeader { recipients }, data_key))
}

async fn write_frames(
    store: &dyn CertificateStore,
    path: &Path,
    header: &BackupHeader,
    data_key: Zeroizing<[u8; KEY_SIZE]>,
    chunk_bytes: usize,
) -> Result<(Vec<Digest>, u64), BackupError> {
    let file = create_private(path).await?;
    let mut writer = BackupWriter::new(BufWriter::new(file), header, data_key).await?;
    let mut reader = store.dump_iterator(&Hierarchy::ALL, None).await?;

    let mut chunk = Zeroizing::new(Vec::with_capacity(chunk_bytes));
    let mut rows = 0u64;
    loop {
        let page = reader.next_page(PAGE_ROWS).await?;
        if page.is_empty() {
            break;
        }
        for row in &page {
            format::append_row(&mut chunk, row)?;
            rows += 1;
            if chunk.len() >= chunk_bytes {
                writer.write_rows(&chunk).await?;
                chunk.clear();
            }
        }
    }
    drop(reader);
    writer.write_rows(&chunk).await?;

    let (mut out, digests) = writer.finish().await?;
    out.flush().await?;
    out.into_inner().sync_all().await?;
    Ok((digests, rows))
}

/// Creates `path` readable by the owner only.
async fn create_private(path: &Path) -> Result<File, BackupError> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    Ok(options.open(path).await?)
}
