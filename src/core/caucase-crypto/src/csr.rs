//! Certificate signing requests.

use rcgen::{
    CertificateParams, ExtendedKeyUsagePurpose, KeyUsagePurpose, PublicKeyData, SignatureAlgorithm,
};
use sha2::{Digest, Sha256};
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::cri_attributes::ParsedCriAttribute;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::FromDer;
use x509_parser::x509::SubjectPublicKeyInfo;

use crate::error::CryptoError;
use crate::extensions::RequestedExtensions;
use crate::keys::{KeyAlgorithm, PrivateKey};
use crate::name::SubjectName;

const PEM_LABELS: [&str; 2] = ["CERTIFICATE REQUEST", "NEW CERTIFICATE REQUEST"];

/// Subject public key taken from a request or certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPublicKey {
    raw: Vec<u8>,
    algorithm: KeyAlgorithm,
}

impl RequestPublicKey {
    pub(crate) fn from_spki(spki: &SubjectPublicKeyInfo<'_>) -> Result<Self, CryptoError> {
        Ok(Self {
            raw: spki.subject_public_key.data.to_vec(),
            algorithm: KeyAlgorithm::detect(&spki.algorithm)?,
        })
    }

    /// Raw key bits.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Key family.
    pub fn key_algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }
}

impl PublicKeyData for RequestPublicKey {
    fn der_bytes(&self) -> &[u8] {
        &self.raw
    }

    fn algorithm(&self) -> &'static SignatureAlgorithm {
        self.algorithm.signature_algorithm()
    }
}

/// A parsed request whose self-signature has been checked.
#[derive(Debug, Clone)]
pub struct CertificateRequest {
    pem: String,
    content_hash: String,
    subject: SubjectName,
    public_key: RequestPublicKey,
    extensions: RequestedExtensions,
}

impl CertificateRequest {
    /// Parses a PEM request and verifies its proof of possession.
    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        let (_, block) = parse_x509_pem(pem.as_bytes())
            .map_err(|e| CryptoError::InvalidPem(e.to_string()))?;
        if !PEM_LABELS.contains(&block.label.as_str()) {
            return Err(CryptoError::InvalidPem(format!(
                "expected a certificate request, found {}",
                block.label
            )));
        }

        let (_, csr) = X509CertificationRequest::from_der(&block.contents)
            .map_err(|e| CryptoError::InvalidRequest(e.to_string()))?;
        csr.verify_signature()
            .map_err(|_| CryptoError::VerificationFailed)?;

        let info = &csr.certification_request_info;
        let subject = SubjectName::from_x509(&info.subject)?;
        let public_key = RequestPublicKey::from_spki(&info.subject_pki)?;

        let mut extensions = RequestedExtensions::default();
        for attribute in info.iter_attributes() {
            if let ParsedCriAttribute::ExtensionRequest(request) = attribute.parsed_attribute() {
                extensions = RequestedExtensions::from_x509(&request.extensions)?;
            }
        }

        Ok(Self {
            pem: pem.to_string(),
            content_hash: hex::encode(Sha256::digest(&block.contents)),
            subject,
            public_key,
            extensions,
        })
    }

    /// The PEM as submitted.
    pub fn pem(&self) -> &str {
        &self.pem
    }

    /// Hex SHA-256 of the DER encoding; identical requests share it.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Requested subject.
    pub fn subject(&self) -> &SubjectName {
        &self.subject
    }

    /// Key to be certified.
    pub fn public_key(&self) -> &RequestPublicKey {
        &self.public_key
    }

    /// Requested extensions.
    pub fn extensions(&self) -> &RequestedExtensions {
        &self.extensions
    }

    /// Builds a request for `common_name`, usable for TLS client and server
    /// authentication. DNS names become subject alternative names.
    pub fn generate(
        key: &PrivateKey,
        common_name: &str,
        dns_names: &[String],
    ) -> Result<String, CryptoError> {
        let mut params = CertificateParams::new(dns_names.to_vec())
            .map_err(|e| CryptoError::InvalidInput(e.to_string()))?;
        params.distinguished_name = SubjectName::common_name(common_name).to_distinguished_name()?;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = if dns_names.is_empty() {
            vec![ExtendedKeyUsagePurpose::ClientAuth]
        } else {
            vec![
                ExtendedKeyUsagePurpose::ServerAuth,
                ExtendedKeyUsagePurpose::ClientAuth,
            ]
        };
        serialize(&params, key)
    }

    /// Builds a bare request carrying only `subject`.
    pub fn for_subject(key: &PrivateKey, subject: &SubjectName) -> Result<String, CryptoError> {
        let mut params = CertificateParams::default();
        params.distinguished_name = subject.to_distinguished_name()?;
        serialize(&params, key)
    }
}

fn serialize(params: &CertificateParams, key: &PrivateKey) -> Result<String, CryptoError> {
    params
        .serialize_request(key.key_pair())
        .and_then(|csr| csr.pem())
        .map_err(|e| CryptoError::SigningFailed(e.to_string()))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_request_parses() {
        let key = PrivateKey::generate().unwrap();
        let pem = CertificateRequest::generate(&key, "web", &["web.example.com".to_string()]).unwrap();

        let csr = CertificateRequest::from_pem(&pem).unwrap();
        assert_eq!(csr.subject().get_common_name(), Some("web"));
        assert_eq!(csr.public_key().raw(), key.public_key_raw());
        assert_eq!(csr.public_key().key_algorithm(), KeyAlgorithm::EcdsaP256);

        let ext = csr.extensions();
        assert!(ext.subject_alt_name.is_some());
        assert_eq!(
            ext.extended_key_usage.as_deref(),
            Some(&["1.3.6.1.5.5.7.3.1".to_string(), "1.3.6.1.5.5.7.3.2".to_string()][..])
        );
        assert!(ext
            .key_usage
            .as_ref()
            .unwrap()
            .contains(&KeyUsagePurpose::DigitalSignature));
    }

    #[test]
    fn test_content_hash_is_stable() {
        let key = PrivateKey::generate().unwrap();
        let pem = CertificateRequest::for_subject(&key, &SubjectName::common_name("a")).unwrap();
        let first = CertificateRequest::from_pem(&pem).unwrap();
        let second = CertificateRequest::from_pem(&pem).unwrap();
        assert_eq!(first.content_hash(), second.content_hash());
        assert_eq!(first.content_hash().len(), 64);
    }

    #[test]
    fn test_tampered_request_rejected() {
        let key = PrivateKey::generate().unwrap();
        let pem = CertificateRequest::for_subject(&key, &SubjectName::common_name("a")).unwrap();

        let (_, block) = parse_x509_pem(pem.as_bytes()).unwrap();
        let mut der = block.contents.clone();
        // commonName OID, then tag and length, then the value.
        let pos = der.windows(3).position(|w| w == [0x55, 0x04, 0x03]).unwrap() + 5;
        assert_eq!(der[pos], b'a');
        der[pos] = b'b';

        use base64::Engine as _;
        let body = base64::engine::general_purpose::STANDARD.encode(&der);
        let tampered = format!(
            "-----BEGIN CERTIFICATE REQUEST-----\n{body}\n-----END CERTIFICATE REQUEST-----\n"
        );
        assert!(matches!(
            CertificateRequest::from_pem(&tampered),
            Err(CryptoError::VerificationFailed)
        ));
    }

    #[test]
    fn test_wrong_label_rejected() {
        let pem = "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n";
        assert!(matches!(
            CertificateRequest::from_pem(pem),
            Err(CryptoError::InvalidPem(_))
        ));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(CertificateRequest::from_pem("not a request").is_err());
    }
}
