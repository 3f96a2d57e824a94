//! # Caucase Crypto
//!
//! X.509 building blocks used by the certificate authority.
//!
//! This crate provides:
//! - Key generation and PEM handling
//! - Certificate signing request parsing, verification and construction
//! - Certificate parsing and chain verification
//! - Leaf, CA and CRL signing
//! - Detached request signatures
//! - Authenticated encryption and key wrapping to certificate holders
//! - DER values of the policy and extended key usage extensions

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aead;
pub mod asn1;
pub mod certificate;
pub mod csr;
pub mod envelope;
pub mod error;
pub mod extensions;
pub mod keys;
pub mod name;
pub mod random;
pub mod signature;
pub mod signer;

pub use certificate::ParsedCertificate;
pub use csr::{CertificateRequest, RequestPublicKey};
pub use envelope::WrappedKey;
pub use error::CryptoError;
pub use extensions::{RawExtension, RequestedExtensions};
pub use keys::{KeyAlgorithm, PrivateKey};
pub use name::SubjectName;
pub use signer::{CaSigner, CrlEntry, LeafSpec};

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
