//! Certificate verification against a hierarchy's CA generations.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use caucase_crypto::{unix_now, ParsedCertificate};
use caucase_storage::{CertificateStore, Hierarchy};

use crate::error::CaError;
use crate::policy::AUTO_SIGNED_POLICY;
use crate::rollover;

/// Who an authorizing certificate belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedIdentity {
    /// Hierarchy that issued the certificate.
    pub hierarchy: Hierarchy,
    /// Certificate serial.
    pub serial: String,
    /// Rendered subject.
    pub subject: String,
    /// Whether the certificate came from auto-approval.
    pub auto_signed: bool,
}

/// Decides whether a certificate may perform privileged operations.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Verifies `certificate_pem` and returns the identity it proves.
    async fn authorize(&self, certificate_pem: &str) -> Result<AuthorizedIdentity, CaError>;
}

/// The CA generations of one hierarchy, as a verifier.
#[derive(Clone)]
pub struct TrustSet {
    hierarchy: Hierarchy,
    store: Arc<dyn CertificateStore>,
}

impl TrustSet {
    /// Trust set over `hierarchy`.
    pub fn new(hierarchy: Hierarchy, store: Arc<dyn CertificateStore>) -> Self {
        Self { hierarchy, store }
    }

    /// Hierarchy this set verifies.
    pub fn hierarchy(&self) -> Hierarchy {
        self.hierarchy
    }

    /// CA certificates trusted at `now`, oldest first.
    pub async fn ca_certificates(&self, now: u64) -> Result<Vec<ParsedCertificate>, CaError> {
        let pairs = self.store.list_ca_key_pairs(self.hierarchy).await?;
        rollover::trusted(&pairs, now)
            .into_iter()
            .map(|pair| ParsedCertificate::from_pem(&pair.certificate_pem).map_err(CaError::from))
            .collect()
    }

    /// Checks that a trusted CA generation signed `certificate`.
    ///
    /// Validity window and revocation are not looked at.
    pub async fn verify_chain(&self, certificate: &ParsedCertificate, now: u64) -> Result<(), CaError> {
        for ca in self.ca_certificates(now).await? {
            if certificate.verify_issued_by(&ca).is_ok() {
                return Ok(());
            }
        }
        debug!(hierarchy = %self.hierarchy, serial = certificate.serial(), "No trusted issuer");
        Err(CaError::Unauthorized("certificate not issued by this authority".into()))
    }

    /// Full verification: chain, validity window and revocation status.
    pub async fn verify(&self, certificate_pem: &str, now: u64) -> Result<ParsedCertificate, CaError> {
        let certificate = ParsedCertificate::from_pem(certificate_pem)
            .map_err(|_| CaError::Unauthorized("unreadable certificate".into()))?;

        self.verify_chain(&certificate, now).await?;

        if !certificate.is_valid_at(now) {
            return Err(CaError::Unauthorized("certificate outside its validity window".into()));
        }
        if self.store.is_revoked(self.hierarchy, certificate.serial()).await? {
            return Err(CaError::Unauthorized("certificate revoked".into()));
        }
        Ok(certificate)
    }
}

#[async_trait]
impl Authorizer for TrustSet {
    async fn authorize(&self, certificate_pem: &str) -> Result<AuthorizedIdentity, CaError> {
        let certificate = self.verify(certificate_pem, unix_now()).await?;
        Ok(AuthorizedIdentity {
            hierarchy: self.hierarchy,
            serial: certificate.serial().to_string(),
            subject: certificate.subject().to_string(),
            auto_signed: certificate.has_policy(&AUTO_SIGNED_POLICY),
        })
    }
}
