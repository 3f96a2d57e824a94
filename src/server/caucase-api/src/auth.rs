//! Signed request authentication.
//!
//! A signed request carries the caller's certificate and a signature by its
//! key over method, path, timestamp and body. Verifying it proves possession
//! of the key; whether the certificate is trusted for the operation is left
//! to the issuance authority.

use axum::http::HeaderMap;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::debug;

use caucase_crypto::signature::{sign_request, timestamp_is_fresh, verify_request};
use caucase_crypto::{CryptoError, ParsedCertificate, PrivateKey};

use crate::error::ApiError;

/// Base64 of the caller's certificate PEM.
pub const CERTIFICATE_HEADER: &str = "x-caucase-certificate";

/// Unix seconds at signing time.
pub const TIMESTAMP_HEADER: &str = "x-caucase-timestamp";

/// Base64 request signature.
pub const SIGNATURE_HEADER: &str = "x-caucase-signature";

/// A request whose signature checked out.
#[derive(Debug, Clone)]
pub struct SignedRequest {
    /// Certificate presented by the caller.
    pub certificate_pem: String,
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, ApiError> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized(format!("missing {name}")))
}

/// Verifies the signature headers of a request.
pub fn verify_signed_request(
    headers: &HeaderMap,
    method: &str,
    path: &str,
    body: &[u8],
    now: u64,
) -> Result<SignedRequest, ApiError> {
    let certificate_pem = STANDARD
        .decode(header(headers, CERTIFICATE_HEADER)?)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or_else(|| ApiError::Unauthorized("unreadable certificate header".into()))?;
    let certificate = ParsedCertificate::from_pem(&certificate_pem)
        .map_err(|_| ApiError::Unauthorized("unreadable certificate".into()))?;

    let timestamp = header(headers, TIMESTAMP_HEADER)?
        .parse::<u64>()
        .map_err(|_| ApiError::Unauthorized("bad timestamp".into()))?;
    if !timestamp_is_fresh(timestamp, now) {
        return Err(ApiError::Unauthorized("stale request".into()));
    }

    let signature = header(headers, SIGNATURE_HEADER)?;
    verify_request(&certificate, method, path, timestamp, body, signature).map_err(|_| {
        debug!(serial = certificate.serial(), path = path, "Request signature rejected");
        ApiError::Unauthorized("bad signature".into())
    })?;

    Ok(SignedRequest { certificate_pem })
}

/// Header name and value pairs signing a request as the holder of `key`.
pub fn signed_headers(
    certificate_pem: &str,
    key: &PrivateKey,
    method: &str,
    path: &str,
    body: &[u8],
    now: u64,
) -> Result<[(&'static str, String); 3], CryptoError> {
    Ok([
        (CERTIFICATE_HEADER, STANDARD.encode(certificate_pem)),
        (TIMESTAMP_HEADER, now.to_string()),
        (SIGNATURE_HEADER, sign_request(key, method, path, now, body)?),
    ])
}
