//! Per-hierarchy authority settings.

use std::time::Duration;

use caucase_storage::Hierarchy;

use crate::error::CaError;

const DAY: u64 = 24 * 60 * 60;
const HOUR: u64 = 60 * 60;

/// Default certificate lifetime in days.
pub const DEFAULT_CRT_LIFE_DAYS: u64 = 93;

/// Default pending request ceiling.
pub const DEFAULT_MAX_PENDING_CSR: u64 = 50;

/// Settings for one issuance authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorityConfig {
    /// Most requests allowed to wait for a decision at once.
    pub max_pending_csr: u64,
    /// Requests signed without an operator while the budget lasts.
    pub auto_approve_count: u64,
    /// Freezes `auto_approve_count` in the store.
    pub lock_auto_approve_count: bool,
    /// Lifetime of issued certificates.
    pub crt_life: Duration,
    /// Lifetime of each CA generation.
    pub ca_life: Duration,
    /// Remaining validity of the newest CA below which a successor is published.
    pub publish_lead: Duration,
    /// Remaining validity a CA needs to stay the active signer.
    pub activate_lead: Duration,
    /// Interval between CRL this_update and next_update.
    pub crl_life: Duration,
}

impl AuthorityConfig {
    /// Defaults for `hierarchy`: only the user hierarchy auto-approves, once.
    pub fn for_hierarchy(hierarchy: Hierarchy) -> Self {
        let auto_approve_count = match hierarchy {
            Hierarchy::Service => 0,
            Hierarchy::User => 1,
        };
        Self {
            max_pending_csr: DEFAULT_MAX_PENDING_CSR,
            auto_approve_count,
            lock_auto_approve_count: false,
            crl_life: Duration::from_secs(24 * HOUR),
            ..Self::from_crt_life(Duration::from_secs(DEFAULT_CRT_LIFE_DAYS * DAY))
        }
    }

    /// Derives the CA timings from a certificate lifetime: CAs live four
    /// certificate lifetimes, successors are published two lifetimes ahead and
    /// promoted one lifetime ahead.
    pub fn from_crt_life(crt_life: Duration) -> Self {
        Self {
            max_pending_csr: DEFAULT_MAX_PENDING_CSR,
            auto_approve_count: 0,
            lock_auto_approve_count: false,
            crt_life,
            ca_life: crt_life * 4,
            publish_lead: crt_life * 2,
            activate_lead: crt_life,
            crl_life: Duration::from_secs(24 * HOUR),
        }
    }

    /// Checks `ca_life > publish_lead > activate_lead >= crt_life > 0`.
    pub fn validate(&self) -> Result<(), CaError> {
        if self.crt_life.is_zero() {
            return Err(CaError::Validation("crt_life must be positive".into()));
        }
        if self.activate_lead < self.crt_life {
            return Err(CaError::Validation(
                "activate_lead must be at least crt_life".into(),
            ));
        }
        if self.publish_lead <= self.activate_lead {
            return Err(CaError::Validation(
                "publish_lead must exceed activate_lead".into(),
            ));
        }
        if self.ca_life <= self.publish_lead {
            return Err(CaError::Validation("ca_life must exceed publish_lead".into()));
        }
        if self.max_pending_csr == 0 {
            return Err(CaError::Validation("max_pending_csr must be positive".into()));
        }
        if self.crl_life.is_zero() {
            return Err(CaError::Validation("crl_life must be positive".into()));
        }
        Ok(())
    }
}

/// Common name given to generated CA certificates.
pub fn ca_common_name(hierarchy: Hierarchy) -> &'static str {
    match hierarchy {
        Hierarchy::Service => "caucase service CA",
        Hierarchy::User => "caucase user CA",
    }
}
