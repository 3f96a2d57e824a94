//! The authority's own TLS serving certificate.
//!
//! The key and certificate are kept on disk for the TLS terminator in front
//! of the server. They are issued by the service hierarchy outside the
//! request queue, so a lost identity can always be replaced.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use caucase_ca::{IssuanceAuthority, TrustSet};
use caucase_crypto::{CertificateRequest, ParsedCertificate, PrivateKey};

use crate::error::MaintenanceError;

/// Default renewal margin in days.
pub const DEFAULT_RENEW_THRESHOLD_DAYS: u64 = 21;

/// Serving certificate and key files.
#[derive(Debug, Clone)]
pub struct ServingIdentity {
    hostnames: Vec<String>,
    cert_path: PathBuf,
    key_path: PathBuf,
    renew_threshold: Duration,
}

impl ServingIdentity {
    /// The first hostname becomes the common name; all of them become DNS
    /// subject alternative names.
    pub fn new(
        hostnames: Vec<String>,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
        renew_threshold: Duration,
    ) -> Result<Self, MaintenanceError> {
        if hostnames.is_empty() {
            return Err(MaintenanceError::InvalidInput(
                "serving identity needs at least one hostname".into(),
            ));
        }
        Ok(Self {
            hostnames,
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            renew_threshold,
        })
    }

    /// Certificate file.
    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    /// Private key file.
    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    /// The certificate on disk, if both files are readable, belong together
    /// and verify against `trust` at `now`.
    pub async fn current(&self, trust: &TrustSet, now: u64) -> Option<ParsedCertificate> {
        let cert_pem = fs::read_to_string(&self.cert_path).await.ok()?;
        let key_pem = fs::read_to_string(&self.key_path).await.ok()?;
        let key = PrivateKey::from_pem(&key_pem).ok()?;
        let certificate = trust.verify(&cert_pem, now).await.ok()?;
        certificate.matches_key(&key).then_some(certificate)
    }

    /// When the identity must be replaced; `now` if it already must.
    pub async fn deadline(&self, trust: &TrustSet, now: u64) -> u64 {
        match self.current(trust, now).await {
            Some(certificate) => certificate
                .not_after()
                .saturating_sub(self.renew_threshold.as_secs())
                .max(now),
            None => now,
        }
    }

    /// Issues a new identity through `authority` when due.
    ///
    /// Returns whether new files were written.
    pub async fn ensure(
        &self,
        authority: &IssuanceAuthority,
        now: u64,
    ) -> Result<bool, MaintenanceError> {
        if self.deadline(authority.trust_set(), now).await > now {
            debug!(path = %self.cert_path.display(), "Serving identity current");
            return Ok(false);
        }

        let key = PrivateKey::generate()?;
        let csr = CertificateRequest::generate(&key, &self.hostnames[0], &self.hostnames)?;
        let issued = authority.issue_internal(&csr, false).await?;

        self.install(key.to_pem().as_bytes(), issued.certificate_pem.as_bytes())
            .await?;

        info!(
            serial = %issued.serial,
            path = %self.cert_path.display(),
            not_after = issued.not_after,
            "Serving identity issued"
        );
        Ok(true)
    }

    /// Replaces both files as a pair.
    ///
    /// Both are fully written and synced under temporary names before either
    /// is moved into place, so a failure while writing leaves the previous
    /// pair untouched.
    async fn install(&self, key_pem: &[u8], cert_pem: &[u8]) -> Result<(), MaintenanceError> {
        let key_temp = stage(&self.key_path, key_pem, 0o600).await?;
        let cert_temp = match stage(&self.cert_path, cert_pem, 0o644).await {
            Ok(path) => path,
            Err(e) => {
                let _ = fs::remove_file(&key_temp).await;
                return Err(e);
            },
        };

        if let Err(e) = fs::rename(&cert_temp, &self.cert_path).await {
            let _ = fs::remove_file(&cert_temp).await;
            let _ = fs::remove_file(&key_temp).await;
            return Err(e.into());
        }
        fs::rename(&key_temp, &self.key_path).await?;
        Ok(())
    }
}

/// `{path}.tmp`, distinct for files sharing a stem.
fn temp_sibling(path: &Path) -> PathBuf {
    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    PathBuf::from(temp)
}

/// Writes `contents` next to `path` and returns the temporary file.
async fn stage(path: &Path, contents: &[u8], mode: u32) -> Result<PathBuf, MaintenanceError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let temp_path = temp_sibling(path);
    // The mode only applies on creation.
    let _ = fs::remove_file(&temp_path).await;

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(mode);
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = options.open(&temp_path).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    Ok(temp_path)
}
