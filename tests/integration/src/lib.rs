//! End-to-end tests of caucased over HTTP.
//!
//! Each [`TestServer`] serves the real router from an in-process listener on
//! an ephemeral port, backed by its own SQLite store.

// Allow unwrap() in tests - panics are acceptable for test assertions
#![allow(clippy::disallowed_methods)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::{Client, Method, StatusCode};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use caucase_api::{build_router, signed_headers, ApiState, PendingCsr, RevokeBody, DEFAULT_MAX_BODY_BYTES};
use caucase_ca::{Authorities, AuthorityConfig};
use caucase_crypto::{unix_now, CertificateRequest, PrivateKey};
use caucase_storage::{CertificateStore, Hierarchy};
use caucase_storage_sqlite::SqliteStore;

/// Database file stem used by every test server.
pub const STORE_NAME: &str = "caucase";

// ============================================================================
// Test Server
// ============================================================================

/// A caucased instance serving from its own data directory.
pub struct TestServer {
    pub base_url: String,
    pub store: Arc<dyn CertificateStore>,
    data_dir: PathBuf,
    task: JoinHandle<()>,
    _tmp: Option<TempDir>,
}

impl TestServer {
    /// Fresh server with default settings.
    pub async fn start() -> Result<Self> {
        let tmp = TempDir::new().context("Failed to create temp dir")?;
        let mut server = Self::start_in(&tmp.path().join("data")).await?;
        server._tmp = Some(tmp);
        Ok(server)
    }

    /// Server over the store found in (or created in) `data_dir`.
    pub async fn start_in(data_dir: &Path) -> Result<Self> {
        let store: Arc<dyn CertificateStore> = Arc::new(SqliteStore::open(data_dir, STORE_NAME).await?);
        let authorities = Authorities::new(
            Arc::clone(&store),
            AuthorityConfig::for_hierarchy(Hierarchy::Service),
            AuthorityConfig::for_hierarchy(Hierarchy::User),
        )?;
        authorities.initialize().await?;

        let app = build_router(ApiState::new(authorities), DEFAULT_MAX_BODY_BYTES);
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?;
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Ok(Self {
            base_url: format!("http://{address}"),
            store,
            data_dir: data_dir.to_path_buf(),
            task,
            _tmp: None,
        })
    }

    /// Directory holding the database.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Client for one hierarchy of this server.
    pub fn client(&self, hierarchy: Hierarchy) -> TestClient {
        TestClient::new(&self.base_url, hierarchy)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ============================================================================
// Test Client
// ============================================================================

/// Key and certificate of a caller.
pub struct Identity {
    pub key: PrivateKey,
    pub certificate_pem: String,
}

/// HTTP client bound to one hierarchy.
pub struct TestClient {
    client: Client,
    base_url: String,
    prefix: String,
}

/// Status and body of a response.
pub struct Reply {
    pub status: StatusCode,
    pub body: String,
}

impl TestClient {
    pub fn new(base_url: &str, hierarchy: Hierarchy) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap(),
            base_url: base_url.to_string(),
            prefix: format!("/{hierarchy}"),
        }
    }

    async fn call(&self, method: Method, route: &str, body: &str, signer: Option<&Identity>) -> Result<Reply> {
        let path = format!("{}{}", self.prefix, route);
        let mut request = self
            .client
            .request(method.clone(), format!("{}{}", self.base_url, path))
            .body(body.to_string());
        if let Some(signer) = signer {
            let headers = signed_headers(
                &signer.certificate_pem,
                &signer.key,
                method.as_str(),
                &path,
                body.as_bytes(),
                unix_now(),
            )?;
            for (name, value) in headers {
                request = request.header(name, value);
            }
        }

        let resp = request.send().await.context("Failed to connect to server")?;
        Ok(Reply {
            status: resp.status(),
            body: resp.text().await?,
        })
    }

    async fn expect(&self, method: Method, route: &str, body: &str, signer: Option<&Identity>) -> Result<String> {
        let reply = self.call(method, route, body, signer).await?;
        if !reply.status.is_success() {
            bail!("{route} failed with {}: {}", reply.status, reply.body);
        }
        Ok(reply.body)
    }

    pub async fn submit(&self, csr_pem: &str) -> Result<u64> {
        Ok(self.expect(Method::PUT, "/csr", csr_pem, None).await?.parse()?)
    }

    pub async fn fetch(&self, id: u64) -> Result<String> {
        self.expect(Method::GET, &format!("/crt/{id}"), "", None).await
    }

    pub async fn ca_chain(&self) -> Result<Vec<String>> {
        Ok(serde_json::from_str(&self.expect(Method::GET, "/crt/ca.crt.json", "", None).await?)?)
    }

    pub async fn crl(&self) -> Result<String> {
        self.expect(Method::GET, "/crl", "", None).await
    }

    pub async fn list_pending(&self, operator: &Identity) -> Result<Reply> {
        self.call(Method::GET, "/csr", "", Some(operator)).await
    }

    pub async fn sign(&self, id: u64, operator: &Identity) -> Result<Reply> {
        self.call(Method::PUT, &format!("/crt/{id}"), "", Some(operator)).await
    }

    pub async fn revoke(&self, serial: Option<String>, signer: &Identity) -> Result<Reply> {
        let body = serde_json::to_string(&RevokeBody {
            serial,
            reason: "test".into(),
        })?;
        self.call(Method::PUT, "/crt/revoke", &body, Some(signer)).await
    }

    pub async fn renew(&self, csr_pem: &str, signer: &Identity) -> Result<Reply> {
        self.call(Method::PUT, "/crt/renew", csr_pem, Some(signer)).await
    }
}

/// New key and a request for `cn` with a matching DNS name.
pub fn new_request(cn: &str) -> (PrivateKey, String) {
    let key = PrivateKey::generate().unwrap();
    let csr = CertificateRequest::generate(&key, cn, &[format!("{cn}.example.com")]).unwrap();
    (key, csr)
}

/// Requests a user certificate and expects it to be auto-approved.
pub async fn bootstrap_operator(server: &TestServer) -> Identity {
    let users = server.client(Hierarchy::User);
    let (key, csr) = new_request("admin");
    let id = users.submit(&csr).await.unwrap();
    Identity {
        key,
        certificate_pem: users.fetch(id).await.unwrap(),
    }
}

/// Pending requests listed by `operator`.
pub fn parse_pending(reply: &Reply) -> Vec<PendingCsr> {
    serde_json::from_str(&reply.body).unwrap()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use caucase_backup::{restore, write_backup, RestoreOptions, RESTORED_REASON};
    use caucase_crypto::ParsedCertificate;

    use super::*;

    fn verify_against_chain(certificate_pem: &str, chain: &[String]) {
        let certificate = ParsedCertificate::from_pem(certificate_pem).unwrap();
        let trusted = chain
            .iter()
            .map(|pem| ParsedCertificate::from_pem(pem).unwrap())
            .any(|ca| certificate.verify_issued_by(&ca).is_ok());
        assert!(trusted, "certificate does not chain to the published CA");
    }

    #[tokio::test]
    async fn test_service_certificate_lifecycle() {
        let server = TestServer::start().await.unwrap();
        let admin = bootstrap_operator(&server).await;
        let services = server.client(Hierarchy::Service);

        let (key, csr) = new_request("web");
        let id = services.submit(&csr).await.unwrap();
        assert_eq!(services.fetch(id).await.unwrap(), "pending");

        let pending = parse_pending(&services.list_pending(&admin).await.unwrap());
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);

        let signed = services.sign(id, &admin).await.unwrap();
        assert_eq!(signed.status, StatusCode::OK);
        let certificate_pem = services.fetch(id).await.unwrap();
        assert_eq!(certificate_pem, signed.body);
        verify_against_chain(&certificate_pem, &services.ca_chain().await.unwrap());

        let web = Identity {
            key,
            certificate_pem,
        };
        let crl_before = services.crl().await.unwrap();
        let revoked = services.revoke(None, &web).await.unwrap();
        assert_eq!(revoked.status, StatusCode::NO_CONTENT);
        assert_ne!(services.crl().await.unwrap(), crl_before);

        // A revoked certificate can no longer renew.
        let (_, renewal) = new_request("web");
        let refused = services.renew(&renewal, &web).await.unwrap();
        assert_eq!(refused.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_second_user_waits_for_operator() {
        let server = TestServer::start().await.unwrap();
        let admin = bootstrap_operator(&server).await;
        let users = server.client(Hierarchy::User);

        let (_, csr) = new_request("alice");
        let id = users.submit(&csr).await.unwrap();
        assert_eq!(users.fetch(id).await.unwrap(), "pending");

        assert_eq!(users.sign(id, &admin).await.unwrap().status, StatusCode::OK);
        ParsedCertificate::from_pem(&users.fetch(id).await.unwrap()).unwrap();
    }

    #[tokio::test]
    async fn test_service_certificate_is_not_an_operator() {
        let server = TestServer::start().await.unwrap();
        let admin = bootstrap_operator(&server).await;
        let services = server.client(Hierarchy::Service);

        let (key, csr) = new_request("web");
        let id = services.submit(&csr).await.unwrap();
        let web = Identity {
            key,
            certificate_pem: services.sign(id, &admin).await.unwrap().body,
        };

        let reply = services.list_pending(&web).await.unwrap();
        assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_renewal_over_http() {
        let server = TestServer::start().await.unwrap();
        let admin = bootstrap_operator(&server).await;
        let services = server.client(Hierarchy::Service);

        let (key, csr) = new_request("web");
        let id = services.submit(&csr).await.unwrap();
        let web = Identity {
            key,
            certificate_pem: services.sign(id, &admin).await.unwrap().body,
        };
        let old = ParsedCertificate::from_pem(&web.certificate_pem).unwrap();

        let (new_key, renewal) = new_request("web");
        let renewed = services.renew(&renewal, &web).await.unwrap();
        assert_eq!(renewed.status, StatusCode::OK);

        let new = ParsedCertificate::from_pem(&renewed.body).unwrap();
        assert!(new.matches_key(&new_key));
        assert_ne!(new.serial(), old.serial());
        assert_eq!(new.subject(), old.subject());
    }

    #[tokio::test]
    async fn test_restore_bridges_operator() {
        let server = TestServer::start().await.unwrap();
        let admin = bootstrap_operator(&server).await;
        let services = server.client(Hierarchy::Service);
        let (_, csr) = new_request("web");
        let pending_id = services.submit(&csr).await.unwrap();

        let backups = TempDir::new().unwrap();
        let record = write_backup(server.store.as_ref(), backups.path(), 4096, unix_now())
            .await
            .unwrap();

        let target = TempDir::new().unwrap();
        let (new_key, new_csr) = new_request("admin");
        let options = RestoreOptions {
            data_dir: target.path().to_path_buf(),
            store_name: STORE_NAME.to_string(),
            service: AuthorityConfig::for_hierarchy(Hierarchy::Service),
            user: AuthorityConfig::for_hierarchy(Hierarchy::User),
        };
        let outcome = restore(&options, &record.path, &admin.key, &new_csr).await.unwrap();
        assert_eq!(outcome.revoked_serials.len(), 1);

        let restored = TestServer::start_in(target.path()).await.unwrap();
        let services = restored.client(Hierarchy::Service);

        let old_admin = services.list_pending(&admin).await.unwrap();
        assert_eq!(old_admin.status, StatusCode::UNAUTHORIZED);

        let new_admin = Identity {
            key: new_key,
            certificate_pem: outcome.certificate_pem,
        };
        let pending = parse_pending(&services.list_pending(&new_admin).await.unwrap());
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, pending_id);
        assert_eq!(services.sign(pending_id, &new_admin).await.unwrap().status, StatusCode::OK);

        let revocations = restored.store.list_revocations(Hierarchy::User).await.unwrap();
        assert!(revocations.iter().any(|r| r.reason == RESTORED_REASON));
    }
}
