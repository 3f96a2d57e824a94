//! Route handlers.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use caucase_ca::{CertificateStatus, IssuanceAuthority};
use caucase_crypto::unix_now;
use caucase_storage::Hierarchy;

use crate::auth::{verify_signed_request, SignedRequest};
use crate::error::ApiError;
use crate::router::ApiState;

const PEM_CONTENT_TYPE: &str = "application/x-pem-file";

/// Pending request as listed to operators.
#[derive(Debug, Serialize, Deserialize)]
pub struct PendingCsr {
    /// Request id.
    pub id: u64,
    /// Request PEM.
    pub csr: String,
    /// Unix seconds.
    pub submitted_at: u64,
}

/// Body of a revocation.
#[derive(Debug, Serialize, Deserialize)]
pub struct RevokeBody {
    /// Certificate to revoke; absent to revoke the signing certificate.
    #[serde(default)]
    pub serial: Option<String>,
    /// Free-form reason recorded with the revocation.
    #[serde(default)]
    pub reason: String,
}

fn authority<'a>(state: &'a ApiState, name: &str) -> Result<&'a IssuanceAuthority, ApiError> {
    let hierarchy: Hierarchy = name
        .parse()
        .map_err(|_| ApiError::NotFound(format!("hierarchy {name}")))?;
    Ok(state.authorities().get(hierarchy).as_ref())
}

fn parse_id(raw: &str) -> Result<u64, ApiError> {
    raw.parse().map_err(|_| ApiError::NotFound(format!("request {raw}")))
}

fn utf8(body: &[u8]) -> Result<&str, ApiError> {
    std::str::from_utf8(body).map_err(|_| ApiError::BadRequest("body is not UTF-8".into()))
}

fn signed(headers: &HeaderMap, method: &Method, uri: &Uri, body: &[u8]) -> Result<SignedRequest, ApiError> {
    verify_signed_request(headers, method.as_str(), uri.path(), body, unix_now())
}

fn pem(body: String) -> Response {
    ([(header::CONTENT_TYPE, PEM_CONTENT_TYPE)], body).into_response()
}

/// `PUT /{h}/csr`
pub async fn submit_csr(
    State(state): State<ApiState>,
    Path(h): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let authority = authority(&state, &h)?;
    let id = authority.submit(utf8(&body)?).await?;
    let location = format!("/{}/csr/{id}", authority.hierarchy());
    Ok((StatusCode::CREATED, [(header::LOCATION, location)], id.to_string()).into_response())
}

/// `GET /{h}/csr`
pub async fn list_pending(
    State(state): State<ApiState>,
    Path(h): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Json<Vec<PendingCsr>>, ApiError> {
    let authority = authority(&state, &h)?;
    let caller = signed(&headers, &method, &uri, &[])?;
    let pending = authority
        .list_pending(&caller.certificate_pem)
        .await?
        .into_iter()
        .map(|record| PendingCsr {
            id: record.id,
            csr: record.csr_pem,
            submitted_at: record.submitted_at,
        })
        .collect();
    Ok(Json(pending))
}

/// `GET /{h}/csr/{id}`
pub async fn get_csr(
    State(state): State<ApiState>,
    Path((h, id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let authority = authority(&state, &h)?;
    Ok(pem(authority.get_csr(parse_id(&id)?).await?))
}

/// `DELETE /{h}/csr/{id}`, body is the reason.
pub async fn reject_csr(
    State(state): State<ApiState>,
    Path((h, id)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let authority = authority(&state, &h)?;
    let id = parse_id(&id)?;
    let caller = signed(&headers, &method, &uri, &body)?;
    authority
        .reject(id, &caller.certificate_pem, utf8(&body)?.trim())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /{h}/crt/{id}`
pub async fn get_certificate(
    State(state): State<ApiState>,
    Path((h, id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let authority = authority(&state, &h)?;
    Ok(match authority.get_certificate(parse_id(&id)?).await? {
        CertificateStatus::Signed(certificate) => pem(certificate),
        CertificateStatus::Pending => "pending".into_response(),
        CertificateStatus::Rejected => "rejected".into_response(),
    })
}

/// `PUT /{h}/crt/{id}`, optional body is a template request.
pub async fn sign_csr(
    State(state): State<ApiState>,
    Path((h, id)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let authority = authority(&state, &h)?;
    let id = parse_id(&id)?;
    let caller = signed(&headers, &method, &uri, &body)?;
    let template = utf8(&body)?.trim();
    let template = (!template.is_empty()).then_some(template);

    let certificate = authority.sign(id, &caller.certificate_pem, template).await?;
    Ok(pem(certificate))
}

/// `PUT /{h}/crt/renew`, signed with the certificate being renewed.
pub async fn renew(
    State(state): State<ApiState>,
    Path(h): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let authority = authority(&state, &h)?;
    let caller = signed(&headers, &method, &uri, &body)?;
    let certificate = authority
        .renew_with_csr(&caller.certificate_pem, utf8(&body)?)
        .await?;
    Ok(pem(certificate))
}

/// `PUT /{h}/crt/revoke`
///
/// Without a serial the signing certificate revokes itself; with one, the
/// signer must be an operator.
pub async fn revoke(
    State(state): State<ApiState>,
    Path(h): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let authority = authority(&state, &h)?;
    let caller = signed(&headers, &method, &uri, &body)?;
    let request: RevokeBody = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("revocation body: {e}")))?;

    match request.serial {
        Some(serial) => {
            let operator = authority
                .revoke_other(&serial, &caller.certificate_pem, &request.reason)
                .await?;
            info!(
                hierarchy = %authority.hierarchy(),
                serial = %serial,
                operator = %operator.subject,
                "Revocation by operator"
            );
        },
        None => {
            authority
                .revoke_certificate(&caller.certificate_pem, &request.reason)
                .await?;
        },
    }
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /{h}/crt/ca.crt.pem`
pub async fn ca_certificate(
    State(state): State<ApiState>,
    Path(h): Path<String>,
) -> Result<Response, ApiError> {
    Ok(pem(authority(&state, &h)?.ca_certificate().await?))
}

/// `GET /{h}/crt/ca.crt.json`
pub async fn ca_chain(
    State(state): State<ApiState>,
    Path(h): Path<String>,
) -> Result<Json<Vec<String>>, ApiError> {
    Ok(Json(authority(&state, &h)?.ca_chain().await?))
}

/// `GET /{h}/crl`: one CRL per trusted CA, as a PEM bundle.
pub async fn crl(State(state): State<ApiState>, Path(h): Path<String>) -> Result<Response, ApiError> {
    let crls = authority(&state, &h)?.crls().await?;
    Ok(pem(crls.pem()))
}
