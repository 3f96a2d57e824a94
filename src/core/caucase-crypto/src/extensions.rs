//! Extensions read from signing requests and certificates.
//!
//! Key usage and extended key usage are decoded so the authority can
//! re-emit a filtered form. Subject alternative names and certificate
//! policies are kept as raw DER so they can be copied verbatim.

use rcgen::KeyUsagePurpose;
use x509_parser::extensions::{ExtendedKeyUsage, KeyUsage, ParsedExtension, X509Extension};
use x509_parser::oid_registry::asn1_rs::oid;

use crate::asn1::{self, Oid};
use crate::error::CryptoError;

/// OID of the extended key usage extension.
pub const OID_EXTENDED_KEY_USAGE: &[u64] = &[2, 5, 29, 37];
/// OID of the certificate policies extension.
pub const OID_CERTIFICATE_POLICIES: &[u64] = &[2, 5, 29, 32];
/// OID of the subject alternative name extension.
pub const OID_SUBJECT_ALT_NAME: &[u64] = &[2, 5, 29, 17];

/// An extension value kept as it was encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawExtension {
    /// Criticality flag as requested.
    pub critical: bool,
    /// DER of the extension value (inside the OCTET STRING).
    pub value: Vec<u8>,
}

/// Extensions a requester asked for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestedExtensions {
    /// Decoded key usage bits.
    pub key_usage: Option<Vec<KeyUsagePurpose>>,
    /// Extended key usage purposes as dotted OIDs.
    pub extended_key_usage: Option<Vec<String>>,
    /// Subject alternative names, verbatim.
    pub subject_alt_name: Option<RawExtension>,
    /// Certificate policies, verbatim.
    pub certificate_policies: Option<RawExtension>,
}

impl RequestedExtensions {
    /// Collects the extensions of interest, ignoring the rest.
    pub fn from_x509(extensions: &[X509Extension<'_>]) -> Result<Self, CryptoError> {
        let san_oid = oid!(2.5.29 .17);
        let policies_oid = oid!(2.5.29 .32);
        let mut out = Self::default();

        for ext in extensions {
            match ext.parsed_extension() {
                ParsedExtension::KeyUsage(ku) => {
                    out.key_usage = Some(key_usage_purposes(ku));
                },
                ParsedExtension::ExtendedKeyUsage(eku) => {
                    out.extended_key_usage = Some(extended_key_usage_oids(eku));
                },
                ParsedExtension::UnsupportedExtension { .. }
                | ParsedExtension::ParseError { .. } => {
                    if ext.oid == san_oid || ext.oid == policies_oid {
                        return Err(CryptoError::InvalidInput(format!(
                            "malformed extension {}",
                            ext.oid.to_id_string()
                        )));
                    }
                },
                _ => {},
            }

            if ext.oid == san_oid {
                out.subject_alt_name = Some(RawExtension {
                    critical: ext.critical,
                    value: ext.value.to_vec(),
                });
            } else if ext.oid == policies_oid {
                out.certificate_policies = Some(RawExtension {
                    critical: ext.critical,
                    value: ext.value.to_vec(),
                });
            }
        }

        Ok(out)
    }

    /// Identifiers of every policy in the certificate policies extension.
    pub fn policy_oids(&self) -> Result<Vec<Oid<'_>>, CryptoError> {
        let Some(policies) = &self.certificate_policies else {
            return Ok(Vec::new());
        };
        asn1::sequence_elements(&policies.value)?
            .iter()
            .map(asn1::policy_identifier)
            .collect()
    }
}

fn key_usage_purposes(ku: &KeyUsage) -> Vec<KeyUsagePurpose> {
    let mut out = Vec::new();
    if ku.digital_signature() {
        out.push(KeyUsagePurpose::DigitalSignature);
    }
    if ku.non_repudiation() {
        out.push(KeyUsagePurpose::ContentCommitment);
    }
    if ku.key_encipherment() {
        out.push(KeyUsagePurpose::KeyEncipherment);
    }
    if ku.data_encipherment() {
        out.push(KeyUsagePurpose::DataEncipherment);
    }
    if ku.key_agreement() {
        out.push(KeyUsagePurpose::KeyAgreement);
    }
    if ku.key_cert_sign() {
        out.push(KeyUsagePurpose::KeyCertSign);
    }
    if ku.crl_sign() {
        out.push(KeyUsagePurpose::CrlSign);
    }
    if ku.encipher_only() {
        out.push(KeyUsagePurpose::EncipherOnly);
    }
    if ku.decipher_only() {
        out.push(KeyUsagePurpose::DecipherOnly);
    }
    out
}

fn extended_key_usage_oids(eku: &ExtendedKeyUsage<'_>) -> Vec<String> {
    let flags = [
        (eku.any, "2.5.29.37.0"),
        (eku.server_auth, "1.3.6.1.5.5.7.3.1"),
        (eku.client_auth, "1.3.6.1.5.5.7.3.2"),
        (eku.code_signing, "1.3.6.1.5.5.7.3.3"),
        (eku.email_protection, "1.3.6.1.5.5.7.3.4"),
        (eku.time_stamping, "1.3.6.1.5.5.7.3.8"),
        (eku.ocsp_signing, "1.3.6.1.5.5.7.3.9"),
    ];
    flags
        .into_iter()
        .filter(|(set, _)| *set)
        .map(|(_, oid)| oid.to_string())
        .chain(eku.other.iter().map(|oid| oid.to_id_string()))
        .collect()
}
