//! Issuance authority for one hierarchy.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use caucase_crypto::{
    unix_now, CaSigner, CertificateRequest, ParsedCertificate, PrivateKey, RequestedExtensions,
};
use caucase_storage::{
    CaKeyPair, CertificateStore, CsrRecord, CsrStatus, Hierarchy, IssuedCertificate,
    NewCertificate, NewCsr,
};

use crate::config::{ca_common_name, AuthorityConfig};
use crate::error::CaError;
use crate::policy::{self, IssuanceTerms, AUTO_SIGNED_POLICY};
use crate::revocation::{CrlSet, RevocationManager};
use crate::rollover;
use crate::trust::{AuthorizedIdentity, Authorizer, TrustSet};

/// What a request id currently resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateStatus {
    /// Issued certificate PEM.
    Signed(String),
    /// Waiting for a decision.
    Pending,
    /// Refused.
    Rejected,
}

/// Result of an in-process renewal.
#[derive(Debug)]
pub enum RenewOutcome {
    /// The current certificate has enough validity left.
    Unchanged,
    /// A fresh key and certificate.
    Renewed {
        /// New certificate PEM.
        certificate_pem: String,
        /// Key certified by `certificate_pem`.
        key: PrivateKey,
    },
}

/// Enforces the request state machine, extension filtering, auto-approval
/// and issuance for one hierarchy.
pub struct IssuanceAuthority {
    hierarchy: Hierarchy,
    config: AuthorityConfig,
    store: Arc<dyn CertificateStore>,
    authorizer: Arc<dyn Authorizer>,
    trust: TrustSet,
    revocation: RevocationManager,
    signer: RwLock<Option<Arc<CaSigner>>>,
}

impl IssuanceAuthority {
    /// Builds an authority. Privileged operations are checked by `authorizer`.
    pub fn new(
        hierarchy: Hierarchy,
        config: AuthorityConfig,
        store: Arc<dyn CertificateStore>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Result<Self, CaError> {
        config.validate()?;
        Ok(Self {
            hierarchy,
            trust: TrustSet::new(hierarchy, Arc::clone(&store)),
            revocation: RevocationManager::new(hierarchy, Arc::clone(&store), config.crl_life),
            config,
            store,
            authorizer,
            signer: RwLock::new(None),
        })
    }

    /// Hierarchy served.
    pub fn hierarchy(&self) -> Hierarchy {
        self.hierarchy
    }

    /// Active settings.
    pub fn config(&self) -> &AuthorityConfig {
        &self.config
    }

    /// Verifier over this hierarchy's CA generations.
    pub fn trust_set(&self) -> &TrustSet {
        &self.trust
    }

    /// Applies the auto-approval budget and creates the first CA if needed.
    pub async fn initialize(&self) -> Result<(), CaError> {
        let counter = self
            .store
            .configure_auto_approval(
                self.hierarchy,
                self.config.auto_approve_count,
                self.config.lock_auto_approve_count,
            )
            .await?;
        debug!(
            hierarchy = %self.hierarchy,
            max = counter.max_count,
            used = counter.used_count,
            locked = counter.locked,
            "Auto-approval configured"
        );

        self.maintain_ca_keys(unix_now()).await?;
        info!(hierarchy = %self.hierarchy, "Issuance authority initialized");
        Ok(())
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Stores a request and returns its id.
    ///
    /// Identical pending content returns the existing id. While the
    /// auto-approval budget lasts a new request is signed immediately.
    pub async fn submit(&self, csr_pem: &str) -> Result<u64, CaError> {
        let csr = CertificateRequest::from_pem(csr_pem).map_err(CaError::invalid)?;
        let now = unix_now();

        let submission = self
            .store
            .insert_csr(
                self.hierarchy,
                NewCsr {
                    content_hash: csr.content_hash().to_string(),
                    csr_pem: csr_pem.to_string(),
                    submitted_at: now,
                },
                self.config.max_pending_csr,
            )
            .await?;

        if !submission.created {
            debug!(hierarchy = %self.hierarchy, csr_id = submission.id, "Duplicate pending request");
            return Ok(submission.id);
        }
        info!(hierarchy = %self.hierarchy, csr_id = submission.id, "Request submitted");

        let budget_left = self.config.auto_approve_count > 0
            && self.store.auto_approval(self.hierarchy).await?.has_remaining();
        if budget_left {
            match self.issue_for_request(submission.id, &csr, None, true).await {
                Ok(issued) => {
                    info!(
                        hierarchy = %self.hierarchy,
                        csr_id = submission.id,
                        serial = %issued.serial,
                        "Request auto-approved"
                    );
                },
                // Budget used up by a concurrent submission.
                Err(CaError::ResourceExhausted(_)) => {
                    debug!(hierarchy = %self.hierarchy, csr_id = submission.id, "Auto-approval budget exhausted");
                },
                Err(e) => return Err(e),
            }
        }

        Ok(submission.id)
    }

    /// Request PEM as submitted.
    pub async fn get_csr(&self, id: u64) -> Result<String, CaError> {
        Ok(self.fetch_csr(id).await?.csr_pem)
    }

    /// Pending requests, oldest first.
    pub async fn list_pending(&self, authorizing_pem: &str) -> Result<Vec<CsrRecord>, CaError> {
        self.authorizer.authorize(authorizing_pem).await?;
        Ok(self.store.list_pending(self.hierarchy).await?)
    }

    /// Signs a pending request.
    ///
    /// Subject and key always come from the stored request; `template_pem`
    /// only replaces the requested extensions.
    pub async fn sign(
        &self,
        id: u64,
        authorizing_pem: &str,
        template_pem: Option<&str>,
    ) -> Result<String, CaError> {
        let operator = self.authorizer.authorize(authorizing_pem).await?;
        let record = self.fetch_csr(id).await?;
        if record.status != CsrStatus::Pending {
            return Err(CaError::Conflict(format!("request {id} is {}", record.status.as_str())));
        }

        let csr = CertificateRequest::from_pem(&record.csr_pem)?;
        let template = template_pem
            .map(CertificateRequest::from_pem)
            .transpose()
            .map_err(CaError::invalid)?;

        let issued = self
            .issue_for_request(id, &csr, template.as_ref().map(|t| t.extensions()), false)
            .await?;
        info!(
            hierarchy = %self.hierarchy,
            csr_id = id,
            serial = %issued.serial,
            operator = %operator.subject,
            "Request signed"
        );
        Ok(issued.certificate_pem)
    }

    /// Refuses a pending request.
    pub async fn reject(&self, id: u64, authorizing_pem: &str, reason: &str) -> Result<(), CaError> {
        let operator = self.authorizer.authorize(authorizing_pem).await?;
        self.store.mark_rejected(self.hierarchy, id, reason).await?;
        info!(
            hierarchy = %self.hierarchy,
            csr_id = id,
            operator = %operator.subject,
            reason = reason,
            "Request rejected"
        );
        Ok(())
    }

    /// What request `id` resolves to.
    pub async fn get_certificate(&self, id: u64) -> Result<CertificateStatus, CaError> {
        let record = self.fetch_csr(id).await?;
        match record.status {
            CsrStatus::Pending => Ok(CertificateStatus::Pending),
            CsrStatus::Rejected => Ok(CertificateStatus::Rejected),
            CsrStatus::Signed => {
                let serial = record
                    .certificate_serial
                    .ok_or_else(|| CaError::Internal(format!("signed request {id} has no serial")))?;
                let issued = self
                    .store
                    .get_issued_certificate(self.hierarchy, &serial)
                    .await?
                    .ok_or_else(|| CaError::Internal(format!("certificate {serial} missing")))?;
                Ok(CertificateStatus::Signed(issued.certificate_pem))
            },
        }
    }

    // =========================================================================
    // Renewal
    // =========================================================================

    /// Replaces `current_pem` with a fresh key and certificate when less than
    /// `threshold_secs` of validity remain.
    pub async fn renew(
        &self,
        current_pem: &str,
        current_key: &PrivateKey,
        threshold_secs: u64,
    ) -> Result<RenewOutcome, CaError> {
        let now = unix_now();
        let current = self.trust.verify(current_pem, now).await?;
        if !current.matches_key(current_key) {
            return Err(CaError::Unauthorized("key does not match certificate".into()));
        }
        if current.not_after().saturating_sub(now) >= threshold_secs {
            return Ok(RenewOutcome::Unchanged);
        }

        let key = PrivateKey::generate()?;
        let csr_pem = CertificateRequest::for_subject(&key, current.subject())?;
        let certificate_pem = self.renew_with_csr(current_pem, &csr_pem).await?;
        Ok(RenewOutcome::Renewed {
            certificate_pem,
            key,
        })
    }

    /// Issues a replacement for `current_pem` to the key in `csr_pem`.
    ///
    /// The caller has proven possession of the current key. The subject must
    /// not change; extensions are taken from the current certificate and its
    /// auto-signed marker carries over.
    pub async fn renew_with_csr(&self, current_pem: &str, csr_pem: &str) -> Result<String, CaError> {
        let now = unix_now();
        let current = self.trust.verify(current_pem, now).await?;
        let csr = CertificateRequest::from_pem(csr_pem).map_err(CaError::invalid)?;
        if csr.subject() != current.subject() {
            return Err(CaError::Validation("renewal must keep the subject".into()));
        }

        let auto_signed = current.has_policy(&AUTO_SIGNED_POLICY);
        let issued = self
            .issue_recorded(&csr, csr_pem, current.extensions(), auto_signed, now)
            .await?;
        info!(
            hierarchy = %self.hierarchy,
            old_serial = current.serial(),
            serial = %issued.serial,
            "Certificate renewed"
        );
        Ok(issued.certificate_pem)
    }

    // =========================================================================
    // Revocation
    // =========================================================================

    /// Revokes a certificate whose private key the caller holds.
    pub async fn revoke_self(
        &self,
        certificate_pem: &str,
        key: &PrivateKey,
        reason: &str,
    ) -> Result<(), CaError> {
        let certificate = ParsedCertificate::from_pem(certificate_pem).map_err(CaError::invalid)?;
        if !certificate.matches_key(key) {
            return Err(CaError::Unauthorized("key does not match certificate".into()));
        }
        self.revoke_certificate(certificate_pem, reason).await
    }

    /// Revokes a certificate whose key possession was proven elsewhere, for
    /// example by a signed request.
    pub async fn revoke_certificate(&self, certificate_pem: &str, reason: &str) -> Result<(), CaError> {
        let now = unix_now();
        let certificate = ParsedCertificate::from_pem(certificate_pem).map_err(CaError::invalid)?;
        self.trust.verify_chain(&certificate, now).await?;
        self.revocation.revoke(certificate.serial(), reason, now).await?;
        Ok(())
    }

    /// Revokes any certificate of this hierarchy by serial.
    pub async fn revoke_other(
        &self,
        serial: &str,
        authorizing_pem: &str,
        reason: &str,
    ) -> Result<AuthorizedIdentity, CaError> {
        let operator = self.authorizer.authorize(authorizing_pem).await?;
        let serial = serial.to_ascii_lowercase();
        if self
            .store
            .get_issued_certificate(self.hierarchy, &serial)
            .await?
            .is_none()
        {
            return Err(CaError::NotFound(format!("certificate {serial}")));
        }
        self.revocation.revoke(&serial, reason, unix_now()).await?;
        Ok(operator)
    }

    /// Current CRLs, one per trusted CA generation.
    pub async fn crls(&self) -> Result<Arc<CrlSet>, CaError> {
        let now = unix_now();
        let pairs = self.store.list_ca_key_pairs(self.hierarchy).await?;
        let generations = rollover::trusted(&pairs, now);
        if generations.is_empty() {
            return Err(CaError::Internal(format!("{} has no valid CA", self.hierarchy)));
        }
        self.revocation.crls(&generations, now).await
    }

    // =========================================================================
    // CA certificates
    // =========================================================================

    /// Trusted CA certificates, oldest first.
    pub async fn ca_chain(&self) -> Result<Vec<String>, CaError> {
        let pairs = self.store.list_ca_key_pairs(self.hierarchy).await?;
        Ok(rollover::trusted(&pairs, unix_now())
            .into_iter()
            .map(|pair| pair.certificate_pem.clone())
            .collect())
    }

    /// Certificate of the active signer.
    pub async fn ca_certificate(&self) -> Result<String, CaError> {
        let signer = self.active_signer(unix_now()).await?;
        Ok(signer.certificate().pem().to_string())
    }

    /// Creates the first CA or publishes a successor when due.
    ///
    /// Returns whether a generation was added.
    pub async fn maintain_ca_keys(&self, now: u64) -> Result<bool, CaError> {
        let pairs = self.store.list_ca_key_pairs(self.hierarchy).await?;
        if !rollover::needs_new_pair(&pairs, now, self.config.publish_lead.as_secs()) {
            return Ok(false);
        }

        let genesis = rollover::trusted(&pairs, now).is_empty();
        let not_after = now + self.config.ca_life.as_secs();
        let signer = CaSigner::generate(ca_common_name(self.hierarchy), now, not_after)?;
        let pair = CaKeyPair {
            hierarchy: self.hierarchy,
            serial: signer.certificate().serial().to_string(),
            key_pem: signer.key_pem().to_string(),
            certificate_pem: signer.certificate().pem().to_string(),
            not_before: now,
            not_after,
            created_at: now,
        };
        self.store.insert_ca_key_pair(&pair).await?;

        if genesis {
            info!(hierarchy = %self.hierarchy, serial = %pair.serial, not_after, "CA created");
        } else {
            info!(hierarchy = %self.hierarchy, serial = %pair.serial, not_after, "CA successor published");
        }
        Ok(true)
    }

    /// Next moment [`maintain_ca_keys`](Self::maintain_ca_keys) or a signer
    /// promotion is due.
    pub async fn next_rollover_deadline(&self, now: u64) -> Result<u64, CaError> {
        let pairs = self.store.list_ca_key_pairs(self.hierarchy).await?;
        Ok(rollover::next_deadline(
            &pairs,
            now,
            self.config.publish_lead.as_secs(),
            self.config.activate_lead.as_secs(),
        ))
    }

    // =========================================================================
    // Internal issuance
    // =========================================================================

    /// Issues a certificate outside the request queue (serving identity,
    /// restore bridging). Filtering and serial allocation are unchanged;
    /// authorization and the auto-approval budget are bypassed.
    pub async fn issue_internal(
        &self,
        csr_pem: &str,
        auto_signed: bool,
    ) -> Result<IssuedCertificate, CaError> {
        let csr = CertificateRequest::from_pem(csr_pem).map_err(CaError::invalid)?;
        let issued = self
            .issue_recorded(&csr, csr_pem, csr.extensions(), auto_signed, unix_now())
            .await?;
        info!(hierarchy = %self.hierarchy, serial = %issued.serial, auto_signed, "Certificate issued internally");
        Ok(issued)
    }

    async fn fetch_csr(&self, id: u64) -> Result<CsrRecord, CaError> {
        self.store
            .get_csr(self.hierarchy, id)
            .await?
            .ok_or_else(|| CaError::NotFound(format!("request {id}")))
    }

    async fn active_signer(&self, now: u64) -> Result<Arc<CaSigner>, CaError> {
        let pairs = self.store.list_ca_key_pairs(self.hierarchy).await?;
        let active = rollover::active_signer(&pairs, now, self.config.activate_lead.as_secs())
            .ok_or_else(|| CaError::Internal(format!("{} has no valid CA", self.hierarchy)))?;

        if let Some(signer) = self.signer.read().await.as_ref() {
            if signer.certificate().serial() == active.serial {
                return Ok(Arc::clone(signer));
            }
        }

        let signer = Arc::new(CaSigner::from_pem(&active.certificate_pem, &active.key_pem)?);
        *self.signer.write().await = Some(Arc::clone(&signer));
        debug!(hierarchy = %self.hierarchy, serial = %active.serial, "Active signer loaded");
        Ok(signer)
    }

    /// Signs `csr` with the active CA.
    async fn build_certificate(
        &self,
        csr: &CertificateRequest,
        template: &RequestedExtensions,
        auto_signed: bool,
        now: u64,
    ) -> Result<NewCertificate, CaError> {
        let signer = self.active_signer(now).await?;
        let not_after = (now + self.config.crt_life.as_secs()).min(signer.certificate().not_after());

        let spec = policy::leaf_spec(
            IssuanceTerms {
                subject: csr.subject().clone(),
                public_key: csr.public_key().clone(),
                not_before: now,
                not_after,
                auto_signed,
            },
            template,
        )?;
        let certificate_pem = signer.sign_leaf(&spec)?;
        let parsed = ParsedCertificate::from_pem(&certificate_pem)?;

        Ok(NewCertificate {
            serial: parsed.serial().to_string(),
            certificate_pem,
            issued_at: now,
            not_before: parsed.not_before(),
            not_after: parsed.not_after(),
            auto_signed,
        })
    }

    async fn issue_for_request(
        &self,
        id: u64,
        csr: &CertificateRequest,
        template: Option<&RequestedExtensions>,
        auto_signed: bool,
    ) -> Result<IssuedCertificate, CaError> {
        let now = unix_now();
        let certificate = self
            .build_certificate(csr, template.unwrap_or(csr.extensions()), auto_signed, now)
            .await?;
        match self
            .store
            .mark_signed(self.hierarchy, id, certificate, auto_signed)
            .await
        {
            Ok(issued) => Ok(issued),
            Err(e) => {
                let e = CaError::from(e);
                if !matches!(e, CaError::ResourceExhausted(_)) {
                    warn!(hierarchy = %self.hierarchy, csr_id = id, error = %e, "Could not record issuance");
                }
                Err(e)
            },
        }
    }

    async fn issue_recorded(
        &self,
        csr: &CertificateRequest,
        csr_pem: &str,
        template: &RequestedExtensions,
        auto_signed: bool,
        now: u64,
    ) -> Result<IssuedCertificate, CaError> {
        let certificate = self.build_certificate(csr, template, auto_signed, now).await?;
        let issued = self
            .store
            .record_internal_issuance(
                self.hierarchy,
                NewCsr {
                    content_hash: csr.content_hash().to_string(),
                    csr_pem: csr_pem.to_string(),
                    submitted_at: now,
                },
                certificate,
            )
            .await?;
        Ok(issued)
    }
}
