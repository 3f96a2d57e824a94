//! Revocation set and per-generation CRL cache for one hierarchy.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use caucase_crypto::signer::crl_pem;
use caucase_crypto::{CaSigner, CrlEntry, ParsedCertificate};
use caucase_storage::{CaKeyPair, CertificateStore, Hierarchy, RevokedEntry};

use crate::error::CaError;

/// A signed CRL and when it was produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedCrl {
    /// Serial of the CA that signed it.
    pub issuer_serial: String,
    /// CRL number.
    pub number: u64,
    /// Unix seconds.
    pub this_update: u64,
    /// Unix seconds.
    pub next_update: u64,
    /// Revoked serials listed, in revocation order.
    pub serials: Vec<String>,
    /// DER encoding.
    pub der: Vec<u8>,
}

impl CachedCrl {
    /// PEM encoding.
    pub fn pem(&self) -> String {
        crl_pem(&self.der)
    }
}

/// One CRL per trusted CA generation, oldest generation first.
///
/// Each generation signs for the certificates it issued, so a relying party
/// holding any trusted CA finds a CRL it can verify for every certificate
/// that CA could have signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrlSet {
    /// The CRLs.
    pub crls: Vec<CachedCrl>,
}

impl CrlSet {
    /// Every CRL as one PEM bundle.
    pub fn pem(&self) -> String {
        self.crls.iter().map(CachedCrl::pem).collect()
    }

    /// The CRL signed by the CA with `serial`.
    pub fn for_issuer(&self, serial: &str) -> Option<&CachedCrl> {
        self.crls.iter().find(|crl| crl.issuer_serial == serial)
    }

    fn is_fresh(&self, generations: &[&CaKeyPair], now: u64) -> bool {
        self.crls.len() == generations.len()
            && self
                .crls
                .iter()
                .zip(generations)
                .all(|(crl, pair)| crl.issuer_serial == pair.serial && now < crl.next_update)
    }
}

/// Appends revocations and keeps up to date CRLs.
///
/// Readers clone an `Arc` out of the cache, so CRLs being regenerated are
/// never observed half written.
pub struct RevocationManager {
    hierarchy: Hierarchy,
    store: Arc<dyn CertificateStore>,
    crl_life: Duration,
    cache: RwLock<Option<Arc<CrlSet>>>,
}

impl RevocationManager {
    /// Manager for `hierarchy`.
    pub fn new(hierarchy: Hierarchy, store: Arc<dyn CertificateStore>, crl_life: Duration) -> Self {
        Self {
            hierarchy,
            store,
            crl_life,
            cache: RwLock::new(None),
        }
    }

    /// Records a revocation and drops the cached CRLs.
    pub async fn revoke(&self, serial: &str, reason: &str, now: u64) -> Result<RevokedEntry, CaError> {
        let entry = self
            .store
            .insert_revocation(self.hierarchy, serial, reason, now)
            .await?;
        self.invalidate().await;

        info!(hierarchy = %self.hierarchy, serial = serial, reason = reason, "Certificate revoked");
        Ok(entry)
    }

    /// Whether `serial` is revoked.
    pub async fn is_revoked(&self, serial: &str) -> Result<bool, CaError> {
        Ok(self.store.is_revoked(self.hierarchy, serial).await?)
    }

    /// Forgets the cached CRLs.
    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }

    /// Returns the CRLs of `generations`, regenerating them when stale.
    ///
    /// `generations` are the trusted CA key pairs, oldest first.
    pub async fn crls(
        &self,
        generations: &[&CaKeyPair],
        now: u64,
    ) -> Result<Arc<CrlSet>, CaError> {
        if let Some(cached) = self.cache.read().await.as_ref() {
            if cached.is_fresh(generations, now) {
                return Ok(Arc::clone(cached));
            }
        }

        let mut cache = self.cache.write().await;
        // Another task may have regenerated them while we waited.
        if let Some(cached) = cache.as_ref() {
            if cached.is_fresh(generations, now) {
                return Ok(Arc::clone(cached));
            }
        }

        let signers = generations
            .iter()
            .map(|pair| CaSigner::from_pem(&pair.certificate_pem, &pair.key_pem))
            .collect::<Result<Vec<_>, _>>()?;
        let entries = self.entries_by_issuer(&signers, now).await?;

        let next_update = now + self.crl_life.as_secs();
        let mut crls = Vec::with_capacity(signers.len());
        for (signer, entries) in signers.iter().zip(entries) {
            let number = self.store.next_crl_number(self.hierarchy).await?;
            let der = signer.sign_crl(number, now, next_update, &entries)?;
            debug!(
                hierarchy = %self.hierarchy,
                issuer = %signer.certificate().serial(),
                number,
                entries = entries.len(),
                "CRL regenerated"
            );
            crls.push(CachedCrl {
                issuer_serial: signer.certificate().serial().to_string(),
                number,
                this_update: now,
                next_update,
                serials: entries.into_iter().map(|entry| entry.serial).collect(),
                der,
            });
        }

        let fresh = Arc::new(CrlSet { crls });
        *cache = Some(Arc::clone(&fresh));
        Ok(fresh)
    }

    /// Unexpired revocations grouped by the generation that issued them.
    async fn entries_by_issuer(
        &self,
        signers: &[CaSigner],
        now: u64,
    ) -> Result<Vec<Vec<CrlEntry>>, CaError> {
        let mut grouped = vec![Vec::new(); signers.len()];

        for revoked in self.store.list_revocations(self.hierarchy).await? {
            if revoked.not_after <= now {
                continue;
            }
            let Some(issued) = self
                .store
                .get_issued_certificate(self.hierarchy, &revoked.serial)
                .await?
            else {
                warn!(hierarchy = %self.hierarchy, serial = %revoked.serial, "Revoked serial was never issued");
                continue;
            };
            let certificate = ParsedCertificate::from_pem(&issued.certificate_pem)?;
            let issuer = signers
                .iter()
                .position(|signer| certificate.verify_issued_by(signer.certificate()).is_ok());

            match issuer {
                Some(index) => grouped[index].push(CrlEntry {
                    serial: revoked.serial,
                    revoked_at: revoked.revoked_at,
                }),
                // Its CA is no longer trusted, so the certificate verifies nowhere.
                None => debug!(hierarchy = %self.hierarchy, serial = %revoked.serial, "Issuer retired, left off CRLs"),
            }
        }
        Ok(grouped)
    }
}
