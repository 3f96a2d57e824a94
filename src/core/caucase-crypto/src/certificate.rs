//! Parsed certificates.
//!
//! x509-parser borrows from its input, so the fields the authority needs are
//! copied out once and the DER is kept for signature checks.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use x509_parser::certificate::X509Certificate;
use x509_parser::pem::{parse_x509_pem, Pem};
use x509_parser::prelude::FromDer;

use crate::asn1::Oid;
use crate::csr::RequestPublicKey;
use crate::error::CryptoError;
use crate::extensions::RequestedExtensions;
use crate::keys::{KeyAlgorithm, PrivateKey};
use crate::name::SubjectName;
use crate::random::serial_hex;

/// A certificate with its commonly used fields extracted.
#[derive(Debug, Clone)]
pub struct ParsedCertificate {
    pem: String,
    der: Vec<u8>,
    serial: String,
    not_before: u64,
    not_after: u64,
    subject: SubjectName,
    subject_raw: Vec<u8>,
    issuer_raw: Vec<u8>,
    public_key: RequestPublicKey,
    extensions: RequestedExtensions,
    is_ca: bool,
}

impl ParsedCertificate {
    /// Parses the first certificate of a PEM document.
    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        let (_, block) = parse_x509_pem(pem.as_bytes())
            .map_err(|e| CryptoError::InvalidPem(e.to_string()))?;
        if block.label != "CERTIFICATE" {
            return Err(CryptoError::InvalidPem(format!(
                "expected a certificate, found {}",
                block.label
            )));
        }
        Self::from_der(&block.contents)
    }

    /// Parses every certificate of a PEM bundle, in order.
    pub fn parse_bundle(pem: &str) -> Result<Vec<Self>, CryptoError> {
        let mut out = Vec::new();
        for block in Pem::iter_from_buffer(pem.as_bytes()) {
            let block = block.map_err(|e| CryptoError::InvalidPem(e.to_string()))?;
            if block.label == "CERTIFICATE" {
                out.push(Self::from_der(&block.contents)?);
            }
        }
        Ok(out)
    }

    /// Parses a DER certificate.
    pub fn from_der(der: &[u8]) -> Result<Self, CryptoError> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| CryptoError::InvalidCertificate(e.to_string()))?;

        let validity = cert.validity();
        Ok(Self {
            pem: der_to_pem("CERTIFICATE", der),
            der: der.to_vec(),
            serial: serial_hex(cert.raw_serial()),
            not_before: validity.not_before.timestamp().max(0) as u64,
            not_after: validity.not_after.timestamp().max(0) as u64,
            subject: SubjectName::from_x509(cert.subject())?,
            subject_raw: cert.subject().as_raw().to_vec(),
            issuer_raw: cert.issuer().as_raw().to_vec(),
            public_key: RequestPublicKey::from_spki(cert.public_key())?,
            extensions: RequestedExtensions::from_x509(cert.extensions())?,
            is_ca: cert.is_ca(),
        })
    }

    /// PEM encoding.
    pub fn pem(&self) -> &str {
        &self.pem
    }

    /// DER encoding.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Serial as lowercase hex.
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Start of validity, Unix seconds.
    pub fn not_before(&self) -> u64 {
        self.not_before
    }

    /// End of validity, Unix seconds.
    pub fn not_after(&self) -> u64 {
        self.not_after
    }

    /// Subject name.
    pub fn subject(&self) -> &SubjectName {
        &self.subject
    }

    /// Certified public key.
    pub fn public_key(&self) -> &RequestPublicKey {
        &self.public_key
    }

    /// Key family of the certified key.
    pub fn key_algorithm(&self) -> KeyAlgorithm {
        self.public_key.key_algorithm()
    }

    /// Extensions the certificate carries.
    pub fn extensions(&self) -> &RequestedExtensions {
        &self.extensions
    }

    /// Whether basic constraints mark this as a CA.
    pub fn is_ca(&self) -> bool {
        self.is_ca
    }

    /// Whether `now` falls inside the validity window.
    pub fn is_valid_at(&self, now: u64) -> bool {
        self.not_before <= now && now < self.not_after
    }

    /// Whether `key` is the private half of the certified key.
    pub fn matches_key(&self, key: &PrivateKey) -> bool {
        self.public_key.raw() == key.public_key_raw()
    }

    /// Whether the certificate policies list `oid`.
    pub fn has_policy(&self, oid: &Oid<'_>) -> bool {
        self.extensions
            .policy_oids()
            .map(|oids| oids.iter().any(|o| o.as_bytes() == oid.as_bytes()))
            .unwrap_or(false)
    }

    /// Checks that `issuer` names and signed this certificate.
    pub fn verify_issued_by(&self, issuer: &ParsedCertificate) -> Result<(), CryptoError> {
        if self.issuer_raw != issuer.subject_raw {
            return Err(CryptoError::VerificationFailed);
        }

        let (_, cert) = X509Certificate::from_der(&self.der)
            .map_err(|e| CryptoError::InvalidCertificate(e.to_string()))?;
        let (_, ca) = X509Certificate::from_der(&issuer.der)
            .map_err(|e| CryptoError::InvalidCertificate(e.to_string()))?;

        cert.verify_signature(Some(ca.public_key()))
            .map_err(|_| CryptoError::VerificationFailed)
    }
}

/// Encodes DER as a PEM block with 64-column lines.
pub fn der_to_pem(label: &str, der: &[u8]) -> String {
    let encoded = STANDARD.encode(der);
    let mut out = format!("-----BEGIN {label}-----\n");
    for line in encoded.as_bytes().chunks(64) {
        out.push_str(&String::from_utf8_lossy(line));
        out.push('\n');
    }
    out.push_str(&format!("-----END {label}-----\n"));
    out
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::signer::{CaSigner, LeafSpec};
    use crate::CertificateRequest;

    fn issue(ca: &CaSigner, cn: &str) -> (PrivateKey, ParsedCertificate) {
        let key = PrivateKey::generate().unwrap();
        let csr = CertificateRequest::from_pem(
            &CertificateRequest::generate(&key, cn, &[]).unwrap(),
        )
        .unwrap();
        let now = crate::unix_now();
        let pem = ca
            .sign_leaf(&LeafSpec::from_request(&csr, now, now + 3600))
            .unwrap();
        (key, ParsedCertificate::from_pem(&pem).unwrap())
    }

    #[test]
    fn test_fields_extracted() {
        let now = crate::unix_now();
        let ca = CaSigner::generate("test CA", now, now + 86_400).unwrap();
        let (key, cert) = issue(&ca, "leaf");

        assert_eq!(cert.subject().get_common_name(), Some("leaf"));
        assert!(cert.matches_key(&key));
        assert!(!cert.is_ca());
        assert!(cert.is_valid_at(now + 10));
        assert!(!cert.is_valid_at(now + 7200));
        assert!(ca.certificate().is_ca());
    }

    #[test]
    fn test_chain_verification() {
        let now = crate::unix_now();
        let ca = CaSigner::generate("test CA", now, now + 86_400).unwrap();
        let other = CaSigner::generate("test CA", now, now + 86_400).unwrap();
        let (_, cert) = issue(&ca, "leaf");

        cert.verify_issued_by(ca.certificate()).unwrap();
        // Same subject, different key.
        assert!(cert.verify_issued_by(other.certificate()).is_err());
    }

    #[test]
    fn test_pem_reencoding_round_trips() {
        let now = crate::unix_now();
        let ca = CaSigner::generate("test CA", now, now + 86_400).unwrap();
        let reparsed = ParsedCertificate::from_pem(ca.certificate().pem()).unwrap();
        assert_eq!(reparsed.der(), ca.certificate().der());
        assert_eq!(reparsed.serial(), ca.certificate().serial());
    }

    #[test]
    fn test_bundle_parsing() {
        let now = crate::unix_now();
        let a = CaSigner::generate("a", now, now + 86_400).unwrap();
        let b = CaSigner::generate("b", now, now + 86_400).unwrap();
        let bundle = format!("{}{}", a.certificate().pem(), b.certificate().pem());

        let parsed = ParsedCertificate::parse_bundle(&bundle).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].subject().get_common_name(), Some("b"));
    }
}
