//! caucase - command line client of caucased.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::Deserialize;

use caucase_api::{signed_headers, PendingCsr, RevokeBody};
use caucase_crypto::{unix_now, CertificateRequest, ParsedCertificate, PrivateKey};

// ============================================================================
// CLI Structure
// ============================================================================

#[derive(Parser)]
#[command(name = "caucase")]
#[command(about = "caucase client - request, sign and revoke certificates")]
#[command(version)]
struct Cli {
    /// caucased base URL
    #[arg(long, default_value = "http://localhost:8000", env = "CAUCASE_URL")]
    ca_url: String,

    /// Hierarchy to talk to
    #[arg(long, value_enum, default_value = "service")]
    mode: Mode,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Service,
    User,
}

impl Mode {
    fn prefix(self) -> &'static str {
        match self {
            Self::Service => "/cas",
            Self::User => "/cau",
        }
    }
}

/// Certificate and key used to sign requests.
#[derive(Args)]
struct Identity {
    /// Certificate PEM file
    #[arg(long, env = "CAUCASE_CRT")]
    crt: PathBuf,
    /// Private key PEM file
    #[arg(long, env = "CAUCASE_KEY")]
    key: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a private key and a signing request
    NewKey {
        /// Common name of the requested certificate
        #[arg(long)]
        cn: String,
        /// DNS subject alternative names
        #[arg(long = "dns")]
        dns_names: Vec<String>,
        /// Private key output file
        #[arg(long)]
        key_out: PathBuf,
        /// Signing request output file
        #[arg(long)]
        csr_out: PathBuf,
    },
    /// Submit a signing request, printing its id
    Submit {
        /// Signing request PEM file
        csr: PathBuf,
    },
    /// Fetch the certificate issued for a request
    Fetch {
        /// Request id
        id: u64,
        /// Write the certificate here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Print the active CA certificate
    Ca {
        /// Print every trusted CA certificate instead
        #[arg(long)]
        chain: bool,
    },
    /// Print the current CRL
    Crl,
    /// List pending requests (operator)
    ListPending {
        #[command(flatten)]
        identity: Identity,
    },
    /// Sign a pending request (operator)
    Sign {
        /// Request id
        id: u64,
        /// Signing request whose extensions replace the requested ones
        #[arg(long)]
        template: Option<PathBuf>,
        #[command(flatten)]
        identity: Identity,
    },
    /// Reject a pending request (operator)
    Reject {
        /// Request id
        id: u64,
        #[arg(long, default_value = "")]
        reason: String,
        #[command(flatten)]
        identity: Identity,
    },
    /// Revoke the identity certificate, or another one by serial (operator)
    Revoke {
        /// Serial of the certificate to revoke
        #[arg(long)]
        serial: Option<String>,
        #[arg(long, default_value = "")]
        reason: String,
        #[command(flatten)]
        identity: Identity,
    },
    /// Replace the identity certificate and key with fresh ones
    Renew {
        #[command(flatten)]
        identity: Identity,
        /// New private key output file, defaults to replacing --key
        #[arg(long)]
        key_out: Option<PathBuf>,
        /// New certificate output file, defaults to replacing --crt
        #[arg(long)]
        crt_out: Option<PathBuf>,
        /// Only renew when fewer days of validity remain
        #[arg(long, default_value = "0")]
        threshold_days: u64,
    },
}

// ============================================================================
// HTTP Client
// ============================================================================

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

struct Signer {
    certificate_pem: String,
    key: PrivateKey,
}

impl Signer {
    fn load(identity: &Identity) -> Result<Self> {
        let certificate_pem = read(&identity.crt)?;
        let key = PrivateKey::from_pem(&read(&identity.key)?).context("Failed to parse private key")?;
        Ok(Self { certificate_pem, key })
    }
}

struct CaucaseClient {
    client: Client,
    base_url: String,
    prefix: &'static str,
}

impl CaucaseClient {
    fn new(base_url: &str, mode: Mode) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            prefix: mode.prefix(),
        })
    }

    fn path(&self, route: &str) -> String {
        format!("{}{}", self.prefix, route)
    }

    fn request(&self, method: Method, path: &str, body: Vec<u8>) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .body(body)
    }

    fn signed(&self, method: Method, route: &str, body: Vec<u8>, signer: &Signer) -> Result<RequestBuilder> {
        let path = self.path(route);
        let headers = signed_headers(
            &signer.certificate_pem,
            &signer.key,
            method.as_str(),
            &path,
            &body,
            unix_now(),
        )
        .context("Failed to sign request")?;

        let mut request = self.request(method, &path, body);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        Ok(request)
    }

    async fn send(request: RequestBuilder, action: &str) -> Result<Response> {
        let resp = request.send().await.context("Failed to connect to server")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let error: ErrorResponse = resp.json().await.unwrap_or(ErrorResponse {
                error: "Unknown error".into(),
            });
            bail!("{action} failed ({status}): {}", error.error);
        }
        Ok(resp)
    }

    async fn text(request: RequestBuilder, action: &str) -> Result<String> {
        Self::send(request, action)
            .await?
            .text()
            .await
            .context("Failed to read response")
    }

    async fn submit(&self, csr_pem: String) -> Result<String> {
        let request = self.request(Method::PUT, &self.path("/csr"), csr_pem.into_bytes());
        Self::text(request, "Submit").await
    }

    async fn fetch(&self, id: u64) -> Result<String> {
        let request = self.request(Method::GET, &self.path(&format!("/crt/{id}")), Vec::new());
        Self::text(request, "Fetch").await
    }

    async fn ca(&self) -> Result<String> {
        let request = self.request(Method::GET, &self.path("/crt/ca.crt.pem"), Vec::new());
        Self::text(request, "CA fetch").await
    }

    async fn ca_chain(&self) -> Result<Vec<String>> {
        let request = self.request(Method::GET, &self.path("/crt/ca.crt.json"), Vec::new());
        Self::send(request, "CA chain fetch")
            .await?
            .json()
            .await
            .context("Failed to parse response")
    }

    async fn crl(&self) -> Result<String> {
        let request = self.request(Method::GET, &self.path("/crl"), Vec::new());
        Self::text(request, "CRL fetch").await
    }

    async fn list_pending(&self, signer: &Signer) -> Result<Vec<PendingCsr>> {
        let request = self.signed(Method::GET, "/csr", Vec::new(), signer)?;
        Self::send(request, "List")
            .await?
            .json()
            .await
            .context("Failed to parse response")
    }

    async fn sign(&self, id: u64, template: Option<String>, signer: &Signer) -> Result<String> {
        let body = template.map(String::into_bytes).unwrap_or_default();
        let request = self.signed(Method::PUT, &format!("/crt/{id}"), body, signer)?;
        Self::text(request, "Sign").await
    }

    async fn reject(&self, id: u64, reason: &str, signer: &Signer) -> Result<()> {
        let body = reason.as_bytes().to_vec();
        let request = self.signed(Method::DELETE, &format!("/csr/{id}"), body, signer)?;
        Self::send(request, "Reject").await?;
        Ok(())
    }

    async fn revoke(&self, body: &RevokeBody, signer: &Signer) -> Result<()> {
        let body = serde_json::to_vec(body)?;
        let request = self.signed(Method::PUT, "/crt/revoke", body, signer)?;
        Self::send(request, "Revoke").await?;
        Ok(())
    }

    async fn renew(&self, csr_pem: String, signer: &Signer) -> Result<String> {
        let request = self.signed(Method::PUT, "/crt/renew", csr_pem.into_bytes(), signer)?;
        Self::text(request, "Renew").await
    }
}

// ============================================================================
// Files
// ============================================================================

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn write_public(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))
}

/// Keys are created owner-only. Replacing goes through a temporary file so a
/// failed write never leaves a truncated key behind.
fn write_private(path: &Path, contents: &str) -> Result<()> {
    let temp = path.with_extension("tmp");
    let _ = fs::remove_file(&temp);

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(&temp)
        .with_context(|| format!("Failed to create {}", temp.display()))?;
    file.write_all(contents.as_bytes())?;
    file.sync_all()?;
    fs::rename(&temp, path).with_context(|| format!("Failed to write {}", path.display()))
}

// ============================================================================
// Command Handlers
// ============================================================================

fn cmd_new_key(cn: &str, dns_names: &[String], key_out: &Path, csr_out: &Path) -> Result<()> {
    let key = PrivateKey::generate().context("Failed to generate key")?;
    let csr = CertificateRequest::generate(&key, cn, dns_names).context("Failed to build request")?;

    write_private(key_out, &key.to_pem())?;
    write_public(csr_out, &csr)?;
    println!("Key written to {}", key_out.display());
    println!("Request written to {}", csr_out.display());
    Ok(())
}

async fn cmd_fetch(client: &CaucaseClient, id: u64, out: Option<&Path>) -> Result<()> {
    let body = client.fetch(id).await?;
    match (body.as_str(), out) {
        ("pending", _) => println!("Request {id} is still pending"),
        ("rejected", _) => bail!("Request {id} was rejected"),
        (_, Some(path)) => {
            write_public(path, &body)?;
            println!("Certificate written to {}", path.display());
        },
        (_, None) => print!("{body}"),
    }
    Ok(())
}

async fn cmd_list_pending(client: &CaucaseClient, signer: &Signer) -> Result<()> {
    let pending = client.list_pending(signer).await?;
    if pending.is_empty() {
        println!("No pending requests.");
        return Ok(());
    }

    for entry in pending {
        let subject = CertificateRequest::from_pem(&entry.csr)
            .map(|csr| csr.subject().to_string())
            .unwrap_or_else(|_| "<unreadable>".into());
        println!("{:>6}  {:>12}  {}", entry.id, entry.submitted_at, subject);
    }
    Ok(())
}

async fn cmd_revoke(
    client: &CaucaseClient,
    serial: Option<String>,
    reason: String,
    signer: &Signer,
) -> Result<()> {
    let target = match &serial {
        Some(serial) => serial.clone(),
        None => ParsedCertificate::from_pem(&signer.certificate_pem)
            .context("Failed to parse certificate")?
            .serial()
            .to_string(),
    };
    client.revoke(&RevokeBody { serial, reason }, signer).await?;
    println!("Certificate {target} revoked.");
    Ok(())
}

async fn cmd_renew(
    client: &CaucaseClient,
    identity: &Identity,
    key_out: Option<&Path>,
    crt_out: Option<&Path>,
    threshold_days: u64,
) -> Result<()> {
    let signer = Signer::load(identity)?;
    let current = ParsedCertificate::from_pem(&signer.certificate_pem).context("Failed to parse certificate")?;
    if threshold_days > 0 && current.not_after().saturating_sub(unix_now()) >= threshold_days * 24 * 60 * 60 {
        println!("Certificate still valid beyond {threshold_days} days, unchanged.");
        return Ok(());
    }

    let key = PrivateKey::generate().context("Failed to generate key")?;
    let csr = CertificateRequest::for_subject(&key, current.subject()).context("Failed to build request")?;
    let certificate = client.renew(csr, &signer).await?;

    let key_out = key_out.unwrap_or(&identity.key);
    let crt_out = crt_out.unwrap_or(&identity.crt);
    write_private(key_out, &key.to_pem())?;
    write_public(crt_out, &certificate)?;
    println!("Renewed certificate written to {}", crt_out.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = CaucaseClient::new(&cli.ca_url, cli.mode)?;

    match cli.command {
        Commands::NewKey {
            cn,
            dns_names,
            key_out,
            csr_out,
        } => cmd_new_key(&cn, &dns_names, &key_out, &csr_out),
        Commands::Submit { csr } => {
            let id = client.submit(read(&csr)?).await?;
            println!("{id}");
            Ok(())
        },
        Commands::Fetch { id, out } => cmd_fetch(&client, id, out.as_deref()).await,
        Commands::Ca { chain: false } => {
            print!("{}", client.ca().await?);
            Ok(())
        },
        Commands::Ca { chain: true } => {
            for certificate in client.ca_chain().await? {
                print!("{certificate}");
            }
            Ok(())
        },
        Commands::Crl => {
            print!("{}", client.crl().await?);
            Ok(())
        },
        Commands::ListPending { identity } => cmd_list_pending(&client, &Signer::load(&identity)?).await,
        Commands::Sign {
            id,
            template,
            identity,
        } => {
            let template = template.as_deref().map(read).transpose()?;
            print!("{}", client.sign(id, template, &Signer::load(&identity)?).await?);
            Ok(())
        },
        Commands::Reject {
            id,
            reason,
            identity,
        } => {
            client.reject(id, &reason, &Signer::load(&identity)?).await?;
            println!("Request {id} rejected.");
            Ok(())
        },
        Commands::Revoke {
            serial,
            reason,
            identity,
        } => cmd_revoke(&client, serial, reason, &Signer::load(&identity)?).await,
        Commands::Renew {
            identity,
            key_out,
            crt_out,
            threshold_days,
        } => {
            cmd_renew(
                &client,
                &identity,
                key_out.as_deref(),
                crt_out.as_deref(),
                threshold_days,
            )
            .await
        },
    }
}
