//! HTTP error mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use caucase_ca::CaError;

/// Errors returned by handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Failure reported by an issuance authority.
    #[error(transparent)]
    Authority(#[from] CaError),

    /// Malformed path, headers or body.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Unknown hierarchy or id.
    #[error("not found: {0}")]
    NotFound(String),

    /// Missing, stale or invalid request signature.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

impl ApiError {
    /// Error kind exposed to clients.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authority(e) => e.kind(),
            Self::BadRequest(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Unauthorized(_) => "unauthorized",
        }
    }

    /// Fixed status for each kind.
    pub fn status_code(&self) -> StatusCode {
        match self.kind() {
            "validation" => StatusCode::BAD_REQUEST,
            "resource_exhausted" => StatusCode::TOO_MANY_REQUESTS,
            "unauthorized" => StatusCode::UNAUTHORIZED,
            "not_found" => StatusCode::NOT_FOUND,
            "conflict" => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self, "Request failed");
        }
        // Only the kind crosses the trust boundary.
        (status, Json(json!({ "error": self.kind() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let cases = [
            (ApiError::from(CaError::Validation("x".into())), StatusCode::BAD_REQUEST),
            (ApiError::from(CaError::ResourceExhausted("x".into())), StatusCode::TOO_MANY_REQUESTS),
            (ApiError::from(CaError::Unauthorized("x".into())), StatusCode::UNAUTHORIZED),
            (ApiError::from(CaError::NotFound("x".into())), StatusCode::NOT_FOUND),
            (ApiError::from(CaError::Conflict("x".into())), StatusCode::CONFLICT),
            (ApiError::from(CaError::Internal("x".into())), StatusCode::INTERNAL_SERVER_ERROR),
            (ApiError::BadRequest("x".into()), StatusCode::BAD_REQUEST),
            (ApiError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (ApiError::Unauthorized("x".into()), StatusCode::UNAUTHORIZED),
        ];
        for (error, status) in cases {
            assert_eq!(error.status_code(), status, "{error}");
        }
    }

    #[tokio::test]
    async fn test_internal_details_not_exposed() {
        let response = ApiError::from(CaError::Internal("disk /var/lib full".into())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], br#"{"error":"internal"}"#);
    }
}
