//! # Caucase CA
//!
//! The two issuance authorities and everything they share.
//!
//! ## Features
//!
//! - Signing request state machine with pending ceiling and deduplication
//! - Auto-approval budget for bootstrapping the first operators
//! - Deterministic extension filtering with an auto-signed policy marker
//! - Two-phase CA rollover
//! - Revocation and cached CRLs
//! - User hierarchy trust set acting as the authorizer of both hierarchies

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod authority;
pub mod config;
pub mod error;
pub mod policy;
pub mod revocation;
pub mod rollover;
pub mod trust;

use std::sync::Arc;

use caucase_storage::{CertificateStore, Hierarchy};

pub use authority::{CertificateStatus, IssuanceAuthority, RenewOutcome};
pub use config::AuthorityConfig;
pub use error::CaError;
pub use revocation::{CachedCrl, CrlSet};
pub use trust::{AuthorizedIdentity, Authorizer, TrustSet};

/// Both authorities over one store.
///
/// Privileged operations on either hierarchy are authorized by certificates
/// of the user hierarchy.
#[derive(Clone)]
pub struct Authorities {
    service: Arc<IssuanceAuthority>,
    user: Arc<IssuanceAuthority>,
}

impl Authorities {
    /// Builds both authorities. Configurations are validated here.
    pub fn new(
        store: Arc<dyn CertificateStore>,
        service: AuthorityConfig,
        user: AuthorityConfig,
    ) -> Result<Self, CaError> {
        let operators: Arc<dyn Authorizer> =
            Arc::new(TrustSet::new(Hierarchy::User, Arc::clone(&store)));

        Ok(Self {
            service: Arc::new(IssuanceAuthority::new(
                Hierarchy::Service,
                service,
                Arc::clone(&store),
                Arc::clone(&operators),
            )?),
            user: Arc::new(IssuanceAuthority::new(Hierarchy::User, user, store, operators)?),
        })
    }

    /// Runs [`IssuanceAuthority::initialize`] on both hierarchies.
    pub async fn initialize(&self) -> Result<(), CaError> {
        self.service.initialize().await?;
        self.user.initialize().await
    }

    /// Authority for `hierarchy`.
    pub fn get(&self, hierarchy: Hierarchy) -> &Arc<IssuanceAuthority> {
        match hierarchy {
            Hierarchy::Service => &self.service,
            Hierarchy::User => &self.user,
        }
    }

    /// Service hierarchy authority.
    pub fn service(&self) -> &Arc<IssuanceAuthority> {
        &self.service
    }

    /// User hierarchy authority.
    pub fn user(&self) -> &Arc<IssuanceAuthority> {
        &self.user
    }
}
