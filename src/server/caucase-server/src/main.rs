//! caucased - certificate authority server.

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use caucase_api::{build_router, ApiState};
use caucase_backup::{restore, write_backup, RestoreOptions};
use caucase_ca::Authorities;
use caucase_crypto::{unix_now, PrivateKey};
use caucase_maintenance::{MaintenanceScheduler, SchedulerHandle};
use caucase_storage::CertificateStore;
use caucase_storage_sqlite::SqliteStore;

use crate::config::{ServerConfig, DEFAULT_CONFIG_PATH};

/// Database file stem under the data directory.
const STORE_NAME: &str = "caucase";

#[derive(Parser)]
#[command(name = "caucased")]
#[command(about = "caucase - certificate authority with automated rollover")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "CAUCASE_CONFIG")]
    config: Option<PathBuf>,

    /// Database directory, overrides the configuration file
    #[arg(long, env = "CAUCASE_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Server bind address, overrides the configuration file
    #[arg(long, env = "CAUCASE_BIND", global = true)]
    bind: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve both hierarchies over HTTP (default)
    Serve,

    /// Write one backup and exit
    Backup {
        /// Target directory, defaults to the configured backup directory
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    /// Rebuild the database from a backup
    Restore {
        /// Backup file
        #[arg(long)]
        backup: PathBuf,

        /// Key of a user certificate contained in the backup
        #[arg(long)]
        proving_key: PathBuf,

        /// Signing request for the new user certificate
        #[arg(long)]
        csr: PathBuf,

        /// Where the new user certificate is written
        #[arg(long)]
        crt_out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let (config_path, explicit) = match &cli.config {
        Some(path) => (path.clone(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
    };
    let mut config = ServerConfig::load(&config_path, explicit)
        .with_context(|| format!("loading {}", config_path.display()))?;
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Backup { dir } => backup(config, dir).await,
        Command::Restore {
            backup,
            proving_key,
            csr,
            crt_out,
        } => restore_backup(config, &backup, &proving_key, &csr, &crt_out).await,
    }
}

async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let (service, user) = config.authority_configs()?;
    let backup = config.backup.schedule()?;
    let identity = config.serving.as_ref().map(|s| s.identity()).transpose()?;

    info!(data_dir = %config.data_dir.display(), "Starting caucased");
    let store: Arc<dyn CertificateStore> = Arc::new(
        SqliteStore::open(&config.data_dir, STORE_NAME)
            .await
            .context("opening database")?,
    );
    let authorities = Authorities::new(Arc::clone(&store), service, user)?;
    authorities
        .initialize()
        .await
        .context("initializing certificate authorities")?;

    let mut scheduler = MaintenanceScheduler::new(authorities.clone(), store);
    if let Some(identity) = identity {
        scheduler = scheduler.with_identity(identity);
    }
    if let Some(schedule) = backup {
        scheduler = scheduler.with_backup(schedule);
    }
    let (handle, task) = scheduler.spawn();
    wake_on_hangup(handle.clone());

    let app = build_router(ApiState::new(authorities), config.max_body_bytes);
    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    info!(address = %listener.local_addr()?, "caucased listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    info!("Shutting down...");
    handle.shutdown();
    task.await.context("maintenance task")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

/// SIGHUP makes the scheduler recompute its deadlines, for instance after the
/// serving identity files were removed by hand.
#[cfg(unix)]
fn wake_on_hangup(handle: SchedulerHandle) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGHUP");
                return;
            },
        };
        while hangup.recv().await.is_some() {
            info!("SIGHUP received, waking maintenance");
            handle.wake();
        }
    });
}

#[cfg(not(unix))]
fn wake_on_hangup(_handle: SchedulerHandle) {}

async fn backup(config: ServerConfig, dir: Option<PathBuf>) -> anyhow::Result<()> {
    let dir = dir
        .or_else(|| config.backup.dir.clone())
        .context("no backup directory given or configured")?;

    let store = SqliteStore::open(&config.data_dir, STORE_NAME)
        .await
        .context("opening database")?;
    let record = write_backup(&store, &dir, config.backup.chunk_bytes, unix_now()).await;
    if let Err(e) = store.close().await {
        warn!(error = %e, "Closing database");
    }
    let record = record.context("writing backup")?;

    println!("{}", record.path.display());
    Ok(())
}

async fn restore_backup(
    config: ServerConfig,
    backup: &Path,
    proving_key: &Path,
    csr: &Path,
    crt_out: &Path,
) -> anyhow::Result<()> {
    let (service, user) = config.authority_configs()?;
    let key_pem = tokio::fs::read_to_string(proving_key)
        .await
        .with_context(|| format!("reading {}", proving_key.display()))?;
    let key = PrivateKey::from_pem(&key_pem).context("parsing proving key")?;
    let csr_pem = tokio::fs::read_to_string(csr)
        .await
        .with_context(|| format!("reading {}", csr.display()))?;

    let options = RestoreOptions {
        data_dir: config.data_dir,
        store_name: STORE_NAME.to_string(),
        service,
        user,
    };
    let outcome = restore(&options, backup, &key, &csr_pem)
        .await
        .context("restoring backup")?;

    tokio::fs::write(crt_out, &outcome.certificate_pem)
        .await
        .with_context(|| format!("writing {}", crt_out.display()))?;
    info!(
        database = %outcome.database_path.display(),
        rows = outcome.rows,
        revoked = ?outcome.revoked_serials,
        "Restore complete"
    );
    Ok(())
}
