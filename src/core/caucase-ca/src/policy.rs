//! Extension filtering applied to every issued certificate.
//!
//! The issued extension set is computed from the request, never copied:
//! CA-only key usages are dropped, extended key usages are intersected with
//! an allow-list, basic constraints always say "not a CA", and policies under
//! the authority's reserved arc are stripped before the auto-signed marker
//! is (optionally) appended.

use std::borrow::Cow;

use rcgen::KeyUsagePurpose;

use caucase_crypto::asn1::{self, Oid};
use caucase_crypto::{LeafSpec, RawExtension, RequestPublicKey, RequestedExtensions, SubjectName};

use crate::error::CaError;

/// `2.25.285541874270823339875695650038637483517.0`, the policy arc owned by
/// the authority; requesters may not claim anything under it.
///
/// The UUID arc does not fit 64 bits, so the identifier is spelled out in
/// its encoded form.
pub const RESERVED_POLICY_ARC: Oid<'static> = Oid::new(Cow::Borrowed(&[
    0x69, 0x83, 0xad, 0xd1, 0xae, 0xd5, 0xd4, 0xf0, 0xfa, 0x8d, 0x91, 0xbd, 0xc3, 0xb4, 0xbe, 0xef,
    0xc5, 0x95, 0xab, 0x7d, 0x00,
]));

/// `2.25.285541874270823339875695650038637483517.0.1`, appended to
/// certificates issued through auto-approval.
pub const AUTO_SIGNED_POLICY: Oid<'static> = Oid::new(Cow::Borrowed(&[
    0x69, 0x83, 0xad, 0xd1, 0xae, 0xd5, 0xd4, 0xf0, 0xfa, 0x8d, 0x91, 0xbd, 0xc3, 0xb4, 0xbe, 0xef,
    0xc5, 0x95, 0xab, 0x7d, 0x00, 0x01,
]));

/// serverAuth.
pub const SERVER_AUTH: &str = "1.3.6.1.5.5.7.3.1";
/// clientAuth.
pub const CLIENT_AUTH: &str = "1.3.6.1.5.5.7.3.2";

/// Extended key usages that survive filtering.
pub const ALLOWED_EXTENDED_KEY_USAGES: [&str; 2] = [SERVER_AUTH, CLIENT_AUTH];

const CA_ONLY_KEY_USAGES: [KeyUsagePurpose; 2] =
    [KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

/// Subject, key and validity of a certificate about to be issued.
#[derive(Debug, Clone)]
pub struct IssuanceTerms {
    /// Subject name.
    pub subject: SubjectName,
    /// Key to certify.
    pub public_key: RequestPublicKey,
    /// Start of validity.
    pub not_before: u64,
    /// End of validity.
    pub not_after: u64,
    /// Whether the auto-signed marker is appended.
    pub auto_signed: bool,
}

/// Computes the leaf to sign from `terms` and the requested `template`.
pub fn leaf_spec(terms: IssuanceTerms, template: &RequestedExtensions) -> Result<LeafSpec, CaError> {
    let key_usage = template
        .key_usage
        .iter()
        .flatten()
        .filter(|purpose| !CA_ONLY_KEY_USAGES.contains(purpose))
        .cloned()
        .collect();

    let extended_key_usage = template
        .extended_key_usage
        .iter()
        .flatten()
        .filter(|oid| ALLOWED_EXTENDED_KEY_USAGES.contains(&oid.as_str()))
        .cloned()
        .collect();

    let certificate_policies =
        filter_policies(template.certificate_policies.as_ref(), terms.auto_signed)?;

    Ok(LeafSpec {
        subject: terms.subject,
        public_key: terms.public_key,
        not_before: terms.not_before,
        not_after: terms.not_after,
        key_usage,
        extended_key_usage,
        subject_alt_name: template.subject_alt_name.clone(),
        certificate_policies,
    })
}

/// Strips reserved policies and appends the marker for auto-signed issuance.
///
/// Keeps the requested criticality while requested entries remain; a
/// policies extension carrying only the marker is non-critical.
pub fn filter_policies(
    requested: Option<&RawExtension>,
    auto_signed: bool,
) -> Result<Option<RawExtension>, CaError> {
    let marker = asn1::policy_information(&AUTO_SIGNED_POLICY)?;
    let mut kept = Vec::new();
    let mut critical = false;
    if let Some(raw) = requested {
        for element in asn1::sequence_elements(&raw.value).map_err(CaError::invalid)? {
            let oid = asn1::policy_identifier(&element).map_err(CaError::invalid)?;
            if !oid.starts_with(&RESERVED_POLICY_ARC) {
                kept.push(element);
            }
        }
        critical = raw.critical && !kept.is_empty();
    }

    if auto_signed {
        kept.push(asn1::first_element(&marker)?);
    }

    if kept.is_empty() {
        return Ok(None);
    }
    Ok(Some(RawExtension {
        critical,
        value: asn1::encode_sequence(&kept)?,
    }))
}
