//! CA certificates and everything a CA key signs.

use rcgen::{
    BasicConstraints, CertificateParams, CertificateRevocationListParams, CustomExtension, IsCa,
    Issuer, KeyIdMethod, KeyPair, KeyUsagePurpose, PublicKeyData, RevokedCertParams, SerialNumber,
};
use time::OffsetDateTime;
use zeroize::Zeroizing;

use crate::certificate::{der_to_pem, ParsedCertificate};
use crate::csr::{CertificateRequest, RequestPublicKey};
use crate::asn1;
use crate::error::CryptoError;
use crate::extensions::{
    RawExtension, OID_CERTIFICATE_POLICIES, OID_EXTENDED_KEY_USAGE, OID_SUBJECT_ALT_NAME,
};
use crate::keys::PrivateKey;
use crate::name::SubjectName;
use crate::random::generate_serial;

/// Everything that goes into an end-entity certificate.
#[derive(Debug, Clone)]
pub struct LeafSpec {
    /// Subject name.
    pub subject: SubjectName,
    /// Key being certified.
    pub public_key: RequestPublicKey,
    /// Start of validity, Unix seconds.
    pub not_before: u64,
    /// End of validity, Unix seconds.
    pub not_after: u64,
    /// Key usage bits, emitted critical when non-empty.
    pub key_usage: Vec<KeyUsagePurpose>,
    /// Extended key usages as dotted OIDs, emitted critical when non-empty.
    pub extended_key_usage: Vec<String>,
    /// Subject alternative names, copied as given.
    pub subject_alt_name: Option<RawExtension>,
    /// Certificate policies, copied as given.
    pub certificate_policies: Option<RawExtension>,
}

impl LeafSpec {
    /// Takes subject, key and extensions from `csr` unchanged.
    pub fn from_request(csr: &CertificateRequest, not_before: u64, not_after: u64) -> Self {
        let ext = csr.extensions();
        Self {
            subject: csr.subject().clone(),
            public_key: csr.public_key().clone(),
            not_before,
            not_after,
            key_usage: ext.key_usage.clone().unwrap_or_default(),
            extended_key_usage: ext.extended_key_usage.clone().unwrap_or_default(),
            subject_alt_name: ext.subject_alt_name.clone(),
            certificate_policies: ext.certificate_policies.clone(),
        }
    }
}

/// One line of a revocation list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrlEntry {
    /// Serial as hex.
    pub serial: String,
    /// Revocation time, Unix seconds.
    pub revoked_at: u64,
}

/// A CA certificate together with its private key.
pub struct CaSigner {
    issuer: Issuer<'static, KeyPair>,
    certificate: ParsedCertificate,
    key_pem: Zeroizing<String>,
}

impl CaSigner {
    /// Creates a self-signed CA that may only sign end-entity certificates.
    pub fn generate(common_name: &str, not_before: u64, not_after: u64) -> Result<Self, CryptoError> {
        let key = PrivateKey::generate()?;

        let mut params = CertificateParams::default();
        params.distinguished_name = SubjectName::common_name(common_name).to_distinguished_name()?;
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.serial_number = Some(SerialNumber::from_slice(&generate_serial()));
        params.not_before = to_datetime(not_before)?;
        params.not_after = to_datetime(not_after)?;

        let cert = params
            .self_signed(key.key_pair())
            .map_err(|e| CryptoError::SigningFailed(e.to_string()))?;

        Self::from_pem(&cert.pem(), &key.to_pem())
    }

    /// Loads a stored CA pair, checking the key belongs to the certificate.
    pub fn from_pem(certificate_pem: &str, key_pem: &str) -> Result<Self, CryptoError> {
        let certificate = ParsedCertificate::from_pem(certificate_pem)?;
        let key = KeyPair::from_pem(key_pem).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        if key.der_bytes() != certificate.public_key().raw() {
            return Err(CryptoError::InvalidKey(
                "key does not match CA certificate".to_string(),
            ));
        }

        let issuer = Issuer::from_ca_cert_pem(certificate.pem(), key)
            .map_err(|e| CryptoError::InvalidCertificate(e.to_string()))?;

        Ok(Self {
            issuer,
            certificate,
            key_pem: Zeroizing::new(key_pem.to_string()),
        })
    }

    /// The CA certificate.
    pub fn certificate(&self) -> &ParsedCertificate {
        &self.certificate
    }

    /// PKCS#8 PEM of the CA key.
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// Issues an end-entity certificate and returns its PEM.
    pub fn sign_leaf(&self, spec: &LeafSpec) -> Result<String, CryptoError> {
        let mut params = CertificateParams::default();
        params.distinguished_name = spec.subject.to_distinguished_name()?;
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = spec.key_usage.clone();
        params.serial_number = Some(SerialNumber::from_slice(&generate_serial()));
        params.not_before = to_datetime(spec.not_before)?;
        params.not_after = to_datetime(spec.not_after)?;
        params.use_authority_key_identifier_extension = true;

        if !spec.extended_key_usage.is_empty() {
            let oids = spec
                .extended_key_usage
                .iter()
                .map(|oid| asn1::parse_oid(oid))
                .collect::<Result<Vec<_>, _>>()?;
            let value = asn1::encode_sequence(&oids)?;
            let mut ext = CustomExtension::from_oid_content(OID_EXTENDED_KEY_USAGE, value);
            ext.set_criticality(true);
            params.custom_extensions.push(ext);
        }

        for (oid, raw) in [
            (OID_SUBJECT_ALT_NAME, &spec.subject_alt_name),
            (OID_CERTIFICATE_POLICIES, &spec.certificate_policies),
        ] {
            if let Some(raw) = raw {
                let mut ext = CustomExtension::from_oid_content(oid, raw.value.clone());
                ext.set_criticality(raw.critical);
                params.custom_extensions.push(ext);
            }
        }

        let cert = params
            .signed_by(&spec.public_key, &self.issuer)
            .map_err(|e| CryptoError::SigningFailed(e.to_string()))?;
        Ok(cert.pem())
    }

    /// Signs a revocation list and returns its DER.
    pub fn sign_crl(
        &self,
        number: u64,
        this_update: u64,
        next_update: u64,
        entries: &[CrlEntry],
    ) -> Result<Vec<u8>, CryptoError> {
        let revoked_certs = entries
            .iter()
            .map(|entry| {
                let serial = hex::decode(&entry.serial)
                    .map_err(|e| CryptoError::InvalidInput(format!("serial {}: {e}", entry.serial)))?;
                Ok(RevokedCertParams {
                    serial_number: SerialNumber::from_slice(&serial),
                    revocation_time: to_datetime(entry.revoked_at)?,
                    reason_code: None,
                    invalidity_date: None,
                })
            })
            .collect::<Result<Vec<_>, CryptoError>>()?;

        let params = CertificateRevocationListParams {
            this_update: to_datetime(this_update)?,
            next_update: to_datetime(next_update)?,
            crl_number: SerialNumber::from(number),
            issuing_distribution_point: None,
            revoked_certs,
            key_identifier_method: KeyIdMethod::Sha256,
        };

        let crl = params
            .signed_by(&self.issuer)
            .map_err(|e| CryptoError::SigningFailed(e.to_string()))?;
        Ok(crl.der().to_vec())
    }
}

impl std::fmt::Debug for CaSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaSigner")
            .field("serial", &self.certificate.serial())
            .field("not_after", &self.certificate.not_after())
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// PEM encoding of a DER CRL.
pub fn crl_pem(der: &[u8]) -> String {
    der_to_pem("X509 CRL", der)
}

fn to_datetime(unix: u64) -> Result<OffsetDateTime, CryptoError> {
    OffsetDateTime::from_unix_timestamp(unix as i64)
        .map_err(|e| CryptoError::InvalidInput(format!("timestamp {unix}: {e}")))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use x509_parser::prelude::{FromDer, X509Certificate};
    use x509_parser::revocation_list::CertificateRevocationList;

    fn leaf_request(cn: &str, dns: &[&str]) -> CertificateRequest {
        let key = PrivateKey::generate().unwrap();
        let dns: Vec<String> = dns.iter().map(|s| s.to_string()).collect();
        CertificateRequest::from_pem(&CertificateRequest::generate(&key, cn, &dns).unwrap()).unwrap()
    }

    #[test]
    fn test_generated_ca_is_constrained() {
        let now = crate::unix_now();
        let ca = CaSigner::generate("caucase service CA", now, now + 1000).unwrap();

        let (_, cert) = X509Certificate::from_der(ca.certificate().der()).unwrap();
        let bc = cert.basic_constraints().unwrap().unwrap();
        assert!(bc.value.ca);
        assert_eq!(bc.value.path_len_constraint, Some(0));
        assert_eq!(ca.certificate().not_after(), now + 1000);
        ca.certificate().verify_issued_by(ca.certificate()).unwrap();
    }

    #[test]
    fn test_reload_from_pem() {
        let now = crate::unix_now();
        let ca = CaSigner::generate("ca", now, now + 1000).unwrap();
        let reloaded = CaSigner::from_pem(ca.certificate().pem(), ca.key_pem()).unwrap();
        assert_eq!(reloaded.certificate().serial(), ca.certificate().serial());
    }

    #[test]
    fn test_mismatched_key_rejected() {
        let now = crate::unix_now();
        let a = CaSigner::generate("a", now, now + 1000).unwrap();
        let b = CaSigner::generate("b", now, now + 1000).unwrap();
        assert!(matches!(
            CaSigner::from_pem(a.certificate().pem(), b.key_pem()),
            Err(CryptoError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_leaf_extensions() {
        let now = crate::unix_now();
        let ca = CaSigner::generate("ca", now, now + 10_000).unwrap();
        let csr = leaf_request("web", &["web.example.com"]);

        let pem = ca.sign_leaf(&LeafSpec::from_request(&csr, now, now + 600)).unwrap();
        let leaf = ParsedCertificate::from_pem(&pem).unwrap();
        leaf.verify_issued_by(ca.certificate()).unwrap();
        assert_eq!(leaf.not_after(), now + 600);
        assert!(!leaf.is_ca());

        let der = leaf.der().to_vec();
        let (_, cert) = X509Certificate::from_der(&der).unwrap();
        let eku = cert.extended_key_usage().unwrap().unwrap();
        assert!(eku.critical);
        assert!(eku.value.server_auth);
        assert!(eku.value.client_auth);
        let san = cert.subject_alternative_name().unwrap().unwrap();
        assert_eq!(san.value.general_names.len(), 1);
    }

    #[test]
    fn test_leaf_serials_differ() {
        let now = crate::unix_now();
        let ca = CaSigner::generate("ca", now, now + 10_000).unwrap();
        let csr = leaf_request("a", &[]);
        let spec = LeafSpec::from_request(&csr, now, now + 600);
        let first = ParsedCertificate::from_pem(&ca.sign_leaf(&spec).unwrap()).unwrap();
        let second = ParsedCertificate::from_pem(&ca.sign_leaf(&spec).unwrap()).unwrap();
        assert_ne!(first.serial(), second.serial());
    }

    #[test]
    fn test_crl_lists_entries() {
        let now = crate::unix_now();
        let ca = CaSigner::generate("ca", now, now + 10_000).unwrap();
        let entries = vec![
            CrlEntry {
                serial: "0a0b0c".to_string(),
                revoked_at: now,
            },
            CrlEntry {
                serial: "7f01".to_string(),
                revoked_at: now,
            },
        ];

        let der = ca.sign_crl(3, now, now + 3600, &entries).unwrap();
        let (_, crl) = CertificateRevocationList::from_der(&der).unwrap();
        let serials: Vec<String> = crl
            .iter_revoked_certificates()
            .map(|r| crate::random::serial_hex(r.raw_serial()))
            .collect();
        assert_eq!(serials, vec!["0a0b0c", "7f01"]);

        let (_, ca_cert) = X509Certificate::from_der(ca.certificate().der()).unwrap();
        assert_eq!(crl.issuer().as_raw(), ca_cert.subject().as_raw());
        assert!(crl_pem(&der).starts_with("-----BEGIN X509 CRL-----\n"));
    }

    #[test]
    fn test_bad_crl_serial() {
        let now = crate::unix_now();
        let ca = CaSigner::generate("ca", now, now + 10_000).unwrap();
        let entries = vec![CrlEntry {
            serial: "zz".to_string(),
            revoked_at: now,
        }];
        assert!(ca.sign_crl(1, now, now + 60, &entries).is_err());
    }
}
