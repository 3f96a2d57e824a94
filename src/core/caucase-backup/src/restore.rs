//! Disaster recovery from a backup file.
//!
//! Restore runs in two passes over the file. The first unwraps the data key
//! with the caller's key, verifies and decrypts every frame and finds the user
//! certificate(s) proven by that key; nothing is written until it succeeds. The second loads the rows into a temporary
//! database, issues a bridging certificate for the caller's new key through
//! the user authority, revokes the proving certificate(s) and moves the
//! database into place.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::{self, File};
use tokio::io::BufReader;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use caucase_ca::{Authorities, AuthorityConfig};
use caucase_crypto::aead::KEY_SIZE;
use caucase_crypto::{envelope, unix_now, CertificateRequest, ParsedCertificate, PrivateKey};
use caucase_storage::{CertificateStore, DumpRow, Hierarchy, StorageError};
use caucase_storage_sqlite::SqliteStore;

use crate::error::BackupError;
use crate::format::{self, BackupReader};

/// Revocation reason recorded for certificates replaced by a restore.
pub const RESTORED_REASON: &str = "restored";

/// Where and how the restored store is created.
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Directory of the live store.
    pub data_dir: PathBuf,
    /// Store file stem.
    pub store_name: String,
    /// Service authority settings.
    pub service: AuthorityConfig,
    /// User authority settings, used for the bridging issuance.
    pub user: AuthorityConfig,
}

/// What a restore produced.
#[derive(Debug, Clone)]
pub struct RestoreOutcome {
    /// Location of the restored database.
    pub database_path: PathBuf,
    /// Bridging certificate for the caller's new key.
    pub certificate_pem: String,
    /// User certificates revoked because their key proved the restore.
    pub revoked_serials: Vec<String>,
    /// Rows loaded from the backup.
    pub rows: u64,
}

struct BackupScan {
    rows: u64,
    proving_serials: Vec<String>,
    data_key: Zeroizing<[u8; KEY_SIZE]>,
}

/// Rebuilds the store described by `options` from `backup`.
///
/// `proving_key` must match a user certificate present in the backup.
/// `csr_pem` requests the bridging certificate.
///
/// # Errors
///
/// - [`BackupError::Conflict`] if a store already exists
/// - [`BackupError::Corrupt`] on any checksum or framing failure
/// - [`BackupError::Unauthorized`] if the proving key unwraps no data key or
///   matches no user certificate
pub async fn restore(
    options: &RestoreOptions,
    backup: &Path,
    proving_key: &PrivateKey,
    csr_pem: &str,
) -> Result<RestoreOutcome, BackupError> {
    let target = SqliteStore::database_path(&options.data_dir, &options.store_name);
    ensure_absent(&target).await?;
    CertificateRequest::from_pem(csr_pem)?;

    let scan = scan_backup(backup, proving_key).await?;
    if scan.proving_serials.is_empty() {
        return Err(BackupError::Unauthorized(
            "proving key matches no user certificate in the backup".into(),
        ));
    }
    info!(path = %backup.display(), rows = scan.rows, "Backup verified");

    fs::create_dir_all(&options.data_dir).await?;
    let temp_name = format!("{}-restoring", options.store_name);
    remove_database_files(&options.data_dir, &temp_name).await?;

    let certificate_pem =
        match stage(options, &temp_name, backup, &scan, csr_pem, &target).await {
            Ok(pem) => pem,
            Err(e) => {
                warn!(error = %e, "Restore failed, discarding staged database");
                let _ = remove_database_files(&options.data_dir, &temp_name).await;
                return Err(e);
            },
        };
    remove_database_files(&options.data_dir, &temp_name).await?;

    info!(
        path = %target.display(),
        rows = scan.rows,
        revoked = scan.proving_serials.len(),
        "Store restored"
    );

    Ok(RestoreOutcome {
        database_path: target,
        certificate_pem,
        revoked_serials: scan.proving_serials,
        rows: scan.rows,
    })
}

async fn open_backup(path: &Path) -> Result<BackupReader<BufReader<File>>, BackupError> {
    let file = File::open(path).await?;
    BackupReader::new(BufReader::new(file)).await
}

/// The data key, from the first header entry `proving_key` unwraps.
fn unlock(
    reader: &BackupReader<BufReader<File>>,
    proving_key: &PrivateKey,
) -> Result<Zeroizing<[u8; KEY_SIZE]>, BackupError> {
    for recipient in &reader.header().recipients {
        let Some(wrapped) = recipient.wrapped() else {
            continue;
        };
        if let Ok(data_key) = envelope::unwrap_key(proving_key, &wrapped) {
            debug!(serial = %recipient.serial, "Backup key unwrapped");
            return Ok(data_key);
        }
    }
    Err(BackupError::Unauthorized(
        "proving key is not a recipient of this backup".into(),
    ))
}

/// Pass 1: verify everything and locate the proving certificates.
async fn scan_backup(path: &Path, proving_key: &PrivateKey) -> Result<BackupScan, BackupError> {
    let mut reader = open_backup(path).await?;
    let data_key = unlock(&reader, proving_key)?;
    let mut rows = 0u64;
    let mut proving_serials = Vec::new();

    while let Some(chunk) = reader.next_rows(&data_key).await? {
        for row in format::decode_rows(&chunk)? {
            rows += 1;
            let DumpRow::Certificate(certificate) = row else {
                continue;
            };
            if certificate.hierarchy != Hierarchy::User {
                continue;
            }
            let proven = ParsedCertificate::from_pem(&certificate.certificate_pem)
                .map(|parsed| parsed.matches_key(proving_key))
                .unwrap_or(false);
            if proven {
                debug!(serial = %certificate.serial, "Proving certificate found");
                proving_serials.push(certificate.serial);
            }
        }
    }

    Ok(BackupScan {
        rows,
        proving_serials,
        data_key,
    })
}

/// Pass 2, into a temporary database that is renamed to `target` on success.
async fn stage(
    options: &RestoreOptions,
    temp_name: &str,
    backup: &Path,
    scan: &BackupScan,
    csr_pem: &str,
    target: &Path,
) -> Result<String, BackupError> {
    let store = SqliteStore::open(&options.data_dir, temp_name).await?;
    let staged = store.path().to_path_buf();
    let result = load_and_bridge(&store, options, backup, scan, csr_pem).await;
    // Only the .db file is moved; the journal must be folded into it first.
    let closed = store.close().await;
    let certificate_pem = result?;
    closed?;

    ensure_absent(target).await?;
    fs::rename(&staged, target).await?;
    Ok(certificate_pem)
}

async fn load_and_bridge(
    store: &SqliteStore,
    options: &RestoreOptions,
    backup: &Path,
    scan: &BackupScan,
    csr_pem: &str,
) -> Result<String, BackupError> {
    // Frames are verified again: the file is re-read, not trusted from pass 1.
    let mut reader = open_backup(backup).await?;
    while let Some(chunk) = reader.next_rows(&scan.data_key).await? {
        store.bulk_load(&format::decode_rows(&chunk)?).await?;
    }

    let shared: Arc<dyn CertificateStore> = Arc::new(store.clone());
    let authorities =
        Authorities::new(Arc::clone(&shared), options.service.clone(), options.user.clone())?;
    let user = authorities.user();
    let now = unix_now();

    user.maintain_ca_keys(now).await?;
    let bridged = user.issue_internal(csr_pem, true).await?;
    info!(serial = %bridged.serial, "Bridging certificate issued");

    for serial in &scan.proving_serials {
        match shared
            .insert_revocation(Hierarchy::User, serial, RESTORED_REASON, now)
            .await
        {
            Ok(_) => info!(serial = %serial, "Proving certificate revoked"),
            Err(StorageError::Conflict(_)) => debug!(serial = %serial, "Proving certificate already revoked"),
            Err(e) => return Err(e.into()),
        }
    }

    Ok(bridged.certificate_pem)
}

async fn ensure_absent(path: &Path) -> Result<(), BackupError> {
    if fs::try_exists(path).await? {
        return Err(BackupError::Conflict(format!(
            "store already exists at {}",
            path.display()
        )));
    }
    Ok(())
}

/// Removes a database file and its journal side files, if present.
async fn remove_database_files(dir: &Path, name: &str) -> Result<(), BackupError> {
    let database = SqliteStore::database_path(dir, name);
    for suffix in ["", "-wal", "-shm"] {
        let mut path = OsString::from(database.as_os_str());
        path.push(suffix);
        match fs::remove_file(PathBuf::from(path)).await {
            Ok(()) => {},
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
