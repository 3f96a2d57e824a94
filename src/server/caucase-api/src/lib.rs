//! # Caucase API
//!
//! HTTP interface of both issuance authorities.
//!
//! ## Endpoints
//!
//! Every route is mounted under `/cas` (service hierarchy) and `/cau`
//! (user hierarchy):
//!
//! - `/csr` - Submit and list signing requests
//! - `/csr/{id}` - Fetch or reject one request
//! - `/crt/{id}` - Fetch or sign a certificate
//! - `/crt/renew`, `/crt/revoke` - Certificate lifecycle
//! - `/crt/ca.crt.pem`, `/crt/ca.crt.json`, `/crl` - Trust material
//!
//! Privileged routes require a signed request, see [`auth`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod error;
pub mod handlers;
pub mod router;

pub use auth::{signed_headers, verify_signed_request, SignedRequest};
pub use error::ApiError;
pub use handlers::{PendingCsr, RevokeBody};
pub use router::{build_router, ApiState, DEFAULT_MAX_BODY_BYTES};

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use axum::Router;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use caucase_ca::{Authorities, AuthorityConfig};
    use caucase_crypto::{unix_now, CaSigner, CertificateRequest, ParsedCertificate, PrivateKey};
    use caucase_storage::{CaKeyPair, CertificateStore, Hierarchy};
    use caucase_storage_sqlite::SqliteStore;

    use super::*;

    struct Fixture {
        _tmp: TempDir,
        store: Arc<dyn CertificateStore>,
        app: Router,
    }

    async fn setup() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let store: Arc<dyn CertificateStore> =
            Arc::new(SqliteStore::open(tmp.path(), "caucase").await.unwrap());
        let authorities = Authorities::new(
            Arc::clone(&store),
            AuthorityConfig::for_hierarchy(Hierarchy::Service),
            AuthorityConfig::for_hierarchy(Hierarchy::User),
        )
        .unwrap();
        authorities.initialize().await.unwrap();
        Fixture {
            _tmp: tmp,
            store,
            app: build_router(ApiState::new(authorities), DEFAULT_MAX_BODY_BYTES),
        }
    }

    fn request(cn: &str) -> (PrivateKey, String) {
        let key = PrivateKey::generate().unwrap();
        let pem = CertificateRequest::generate(&key, cn, &[format!("{cn}.example.com")]).unwrap();
        (key, pem)
    }

    struct Reply {
        status: StatusCode,
        location: Option<String>,
        body: String,
    }

    async fn send(app: &Router, request: Request<Body>) -> Reply {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let location = response
            .headers()
            .get(header::LOCATION)
            .map(|value| value.to_str().unwrap().to_string());
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        Reply {
            status,
            location,
            body: String::from_utf8(bytes.to_vec()).unwrap(),
        }
    }

    async fn plain(app: &Router, method: &str, uri: &str, body: &str) -> Reply {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::from(body.to_string()))
            .unwrap();
        send(app, request).await
    }

    async fn signed_at(
        app: &Router,
        method: &str,
        uri: &str,
        body: &str,
        identity: &(PrivateKey, String),
        now: u64,
    ) -> Reply {
        let (key, pem) = identity;
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in signed_headers(pem, key, method, uri, body.as_bytes(), now).unwrap() {
            builder = builder.header(name, value);
        }
        send(app, builder.body(Body::from(body.to_string())).unwrap()).await
    }

    async fn signed(app: &Router, method: &str, uri: &str, body: &str, identity: &(PrivateKey, String)) -> Reply {
        signed_at(app, method, uri, body, identity, unix_now()).await
    }

    /// First user request, auto-approved by the default budget.
    async fn admin(app: &Router) -> (PrivateKey, String) {
        let (key, csr) = request("admin");
        let submitted = plain(app, "PUT", "/cau/csr", &csr).await;
        assert_eq!(submitted.status, StatusCode::CREATED);
        let fetched = plain(app, "GET", &submitted.location.unwrap().replace("/csr/", "/crt/"), "").await;
        assert_eq!(fetched.status, StatusCode::OK);
        (key, fetched.body)
    }

    async fn issue_service(app: &Router, admin: &(PrivateKey, String), cn: &str) -> (PrivateKey, String) {
        let (key, csr) = request(cn);
        let id = plain(app, "PUT", "/cas/csr", &csr).await.body;
        let signed = signed(app, "PUT", &format!("/cas/crt/{id}"), "", admin).await;
        assert_eq!(signed.status, StatusCode::OK);
        (key, signed.body)
    }

    fn error_kind(reply: &Reply) -> String {
        let value: serde_json::Value = serde_json::from_str(&reply.body).unwrap();
        value["error"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_submit_returns_location() {
        let fx = setup().await;
        let (_, csr) = request("web");

        let reply = plain(&fx.app, "PUT", "/cas/csr", &csr).await;
        assert_eq!(reply.status, StatusCode::CREATED);
        assert_eq!(reply.location.as_deref(), Some(format!("/cas/csr/{}", reply.body).as_str()));

        let fetched = plain(&fx.app, "GET", &format!("/cas/csr/{}", reply.body), "").await;
        assert_eq!(fetched.status, StatusCode::OK);
        assert_eq!(fetched.body.trim(), csr.trim());

        let status = plain(&fx.app, "GET", &format!("/cas/crt/{}", reply.body), "").await;
        assert_eq!(status.status, StatusCode::OK);
        assert_eq!(status.body, "pending");
    }

    #[tokio::test]
    async fn test_first_user_certificate_is_auto_approved() {
        let fx = setup().await;
        let (key, pem) = admin(&fx.app).await;

        let certificate = ParsedCertificate::from_pem(&pem).unwrap();
        assert!(certificate.matches_key(&key));
    }

    #[tokio::test]
    async fn test_listing_requires_signature() {
        let fx = setup().await;
        let reply = plain(&fx.app, "GET", "/cas/csr", "").await;
        assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
        assert_eq!(error_kind(&reply), "unauthorized");
    }

    #[tokio::test]
    async fn test_operator_lists_and_signs() {
        let fx = setup().await;
        let admin = admin(&fx.app).await;
        let (_, csr) = request("web");
        let id = plain(&fx.app, "PUT", "/cas/csr", &csr).await.body;

        let listed = signed(&fx.app, "GET", "/cas/csr", "", &admin).await;
        assert_eq!(listed.status, StatusCode::OK);
        let pending: Vec<PendingCsr> = serde_json::from_str(&listed.body).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id.to_string(), id);

        let uri = format!("/cas/crt/{id}");
        let first = signed(&fx.app, "PUT", &uri, "", &admin).await;
        assert_eq!(first.status, StatusCode::OK);
        ParsedCertificate::from_pem(&first.body).unwrap();

        let fetched = plain(&fx.app, "GET", &uri, "").await;
        assert_eq!(fetched.body, first.body);

        let second = signed(&fx.app, "PUT", &uri, "", &admin).await;
        assert_eq!(second.status, StatusCode::CONFLICT);
        assert_eq!(error_kind(&second), "conflict");
    }

    #[tokio::test]
    async fn test_reject() {
        let fx = setup().await;
        let admin = admin(&fx.app).await;
        let (_, csr) = request("web");
        let id = plain(&fx.app, "PUT", "/cas/csr", &csr).await.body;

        let reply = signed(&fx.app, "DELETE", &format!("/cas/csr/{id}"), "unknown host", &admin).await;
        assert_eq!(reply.status, StatusCode::NO_CONTENT);

        let status = plain(&fx.app, "GET", &format!("/cas/crt/{id}"), "").await;
        assert_eq!(status.body, "rejected");
    }

    #[tokio::test]
    async fn test_stale_or_tampered_signatures_refused() {
        let fx = setup().await;
        let admin = admin(&fx.app).await;

        let stale = signed_at(&fx.app, "GET", "/cas/csr", "", &admin, unix_now() - 3600).await;
        assert_eq!(stale.status, StatusCode::UNAUTHORIZED);

        // Signed for another path.
        let (key, pem) = &admin;
        let mut builder = Request::builder().method("GET").uri("/cau/csr");
        for (name, value) in signed_headers(pem, key, "GET", "/cas/csr", b"", unix_now()).unwrap() {
            builder = builder.header(name, value);
        }
        let tampered = send(&fx.app, builder.body(Body::empty()).unwrap()).await;
        assert_eq!(tampered.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_service_certificate_cannot_operate() {
        let fx = setup().await;
        let admin = admin(&fx.app).await;
        let service = issue_service(&fx.app, &admin, "web").await;

        let reply = signed(&fx.app, "GET", "/cas/csr", "", &service).await;
        assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_revoke_self_twice_conflicts() {
        let fx = setup().await;
        let admin = admin(&fx.app).await;
        let service = issue_service(&fx.app, &admin, "web").await;
        let body = r#"{"reason":"decommissioned"}"#;

        let first = signed(&fx.app, "PUT", "/cas/crt/revoke", body, &service).await;
        assert_eq!(first.status, StatusCode::NO_CONTENT);
        let second = signed(&fx.app, "PUT", "/cas/crt/revoke", body, &service).await;
        assert_eq!(second.status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_revoke_other() {
        let fx = setup().await;
        let admin = admin(&fx.app).await;
        let (_, service_pem) = issue_service(&fx.app, &admin, "web").await;
        let serial = ParsedCertificate::from_pem(&service_pem).unwrap().serial().to_string();

        let body = serde_json::to_string(&RevokeBody {
            serial: Some(serial),
            reason: "compromised".into(),
        })
        .unwrap();
        let reply = signed(&fx.app, "PUT", "/cas/crt/revoke", &body, &admin).await;
        assert_eq!(reply.status, StatusCode::NO_CONTENT);

        let unknown = r#"{"serial":"0badc0de","reason":"x"}"#;
        let reply = signed(&fx.app, "PUT", "/cas/crt/revoke", unknown, &admin).await;
        assert_eq!(reply.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_renew_keeps_subject() {
        let fx = setup().await;
        let admin = admin(&fx.app).await;
        let service = issue_service(&fx.app, &admin, "web").await;

        let key = PrivateKey::generate().unwrap();
        let same = CertificateRequest::generate(&key, "web", &["web.example.com".into()]).unwrap();
        let renewed = signed(&fx.app, "PUT", "/cas/crt/renew", &same, &service).await;
        assert_eq!(renewed.status, StatusCode::OK);
        let certificate = ParsedCertificate::from_pem(&renewed.body).unwrap();
        assert!(certificate.matches_key(&key));

        let (_, other) = request("db");
        let refused = signed(&fx.app, "PUT", "/cas/crt/renew", &other, &service).await;
        assert_eq!(refused.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_trust_material() {
        let fx = setup().await;

        for h in ["cas", "cau"] {
            let ca = plain(&fx.app, "GET", &format!("/{h}/crt/ca.crt.pem"), "").await;
            assert_eq!(ca.status, StatusCode::OK);
            assert!(ParsedCertificate::from_pem(&ca.body).unwrap().is_ca());

            let chain = plain(&fx.app, "GET", &format!("/{h}/crt/ca.crt.json"), "").await;
            let chain: Vec<String> = serde_json::from_str(&chain.body).unwrap();
            assert_eq!(chain.len(), 1);

            let crl = plain(&fx.app, "GET", &format!("/{h}/crl"), "").await;
            assert_eq!(crl.status, StatusCode::OK);
            assert!(crl.body.starts_with("-----BEGIN X509 CRL-----"));
        }
    }

    #[tokio::test]
    async fn test_crl_bundle_covers_every_trusted_ca() {
        let fx = setup().await;
        let now = unix_now();
        let signer = CaSigner::generate("caucase service CA", now, now + 86_400).unwrap();
        fx.store
            .insert_ca_key_pair(&CaKeyPair {
                hierarchy: Hierarchy::Service,
                serial: signer.certificate().serial().to_string(),
                key_pem: signer.key_pem().to_string(),
                certificate_pem: signer.certificate().pem().to_string(),
                not_before: now,
                not_after: now + 86_400,
                created_at: now,
            })
            .await
            .unwrap();

        let chain = plain(&fx.app, "GET", "/cas/crt/ca.crt.json", "").await;
        let chain: Vec<String> = serde_json::from_str(&chain.body).unwrap();
        assert_eq!(chain.len(), 2);

        let crl = plain(&fx.app, "GET", "/cas/crl", "").await;
        assert_eq!(crl.status, StatusCode::OK);
        assert_eq!(crl.body.matches("-----BEGIN X509 CRL-----").count(), 2);

        let crl = plain(&fx.app, "GET", "/cau/crl", "").await;
        assert_eq!(crl.body.matches("-----BEGIN X509 CRL-----").count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_routes() {
        let fx = setup().await;

        let reply = plain(&fx.app, "GET", "/xyz/crt/ca.crt.pem", "").await;
        assert_eq!(reply.status, StatusCode::NOT_FOUND);

        let reply = plain(&fx.app, "GET", "/cas/csr/abc", "").await;
        assert_eq!(reply.status, StatusCode::NOT_FOUND);

        let reply = plain(&fx.app, "GET", "/cas/csr/42", "").await;
        assert_eq!(reply.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_garbage_request_refused() {
        let fx = setup().await;
        let reply = plain(&fx.app, "PUT", "/cas/csr", "not a request").await;
        assert_eq!(reply.status, StatusCode::BAD_REQUEST);
        assert_eq!(error_kind(&reply), "validation");
    }

    #[tokio::test]
    async fn test_oversized_body_refused() {
        let fx = setup().await;
        let body = "A".repeat(DEFAULT_MAX_BODY_BYTES + 1);
        let reply = plain(&fx.app, "PUT", "/cas/csr", &body).await;
        assert_eq!(reply.status, StatusCode::PAYLOAD_TOO_LARGE);
    }
}
