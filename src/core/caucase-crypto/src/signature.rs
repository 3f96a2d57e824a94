//! Detached signatures over HTTP requests.
//!
//! The signed message is `METHOD\nPATH\nTIMESTAMP\nhex(sha256(body))`. The
//! signer proves possession of the key certified by the certificate it sends
//! alongside.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use ring::signature::UnparsedPublicKey;
use sha2::{Digest, Sha256};

use crate::certificate::ParsedCertificate;
use crate::error::CryptoError;
use crate::keys::PrivateKey;

/// Largest accepted distance between a request timestamp and the clock, in seconds.
pub const TIMESTAMP_SKEW: u64 = 300;

/// Message covered by a request signature.
pub fn canonical_request(method: &str, path: &str, timestamp: u64, body: &[u8]) -> String {
    format!(
        "{}\n{}\n{}\n{}",
        method.to_ascii_uppercase(),
        path,
        timestamp,
        hex::encode(Sha256::digest(body))
    )
}

/// Signs a request, returning the base64 signature.
pub fn sign_request(
    key: &PrivateKey,
    method: &str,
    path: &str,
    timestamp: u64,
    body: &[u8],
) -> Result<String, CryptoError> {
    let message = canonical_request(method, path, timestamp, body);
    Ok(STANDARD.encode(key.sign(message.as_bytes())?))
}

/// Checks a request signature against the key in `certificate`.
pub fn verify_request(
    certificate: &ParsedCertificate,
    method: &str,
    path: &str,
    timestamp: u64,
    body: &[u8],
    signature_b64: &str,
) -> Result<(), CryptoError> {
    let signature = STANDARD
        .decode(signature_b64.trim())
        .map_err(|_| CryptoError::VerificationFailed)?;
    let message = canonical_request(method, path, timestamp, body);

    UnparsedPublicKey::new(
        certificate.key_algorithm().verification(),
        certificate.public_key().raw(),
    )
    .verify(message.as_bytes(), &signature)
    .map_err(|_| CryptoError::VerificationFailed)
}

/// Whether `timestamp` is within [`TIMESTAMP_SKEW`] of `now`.
pub fn timestamp_is_fresh(timestamp: u64, now: u64) -> bool {
    timestamp.abs_diff(now) <= TIMESTAMP_SKEW
}
