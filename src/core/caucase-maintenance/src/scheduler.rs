//! The maintenance loop.
//!
//! One task owns every time-based action: CA rollover for both hierarchies,
//! serving identity renewal and scheduled backups. It sleeps until the
//! earliest deadline, performs what is due, and recomputes. A wake signal
//! only recomputes deadlines.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use caucase_backup::{write_backup, BackupError, DEFAULT_CHUNK_BYTES};
use caucase_ca::Authorities;
use caucase_crypto::unix_now;
use caucase_storage::CertificateStore;

use crate::error::MaintenanceError;
use crate::identity::ServingIdentity;

/// Store setting holding the unix time of the last scheduled backup.
pub const LAST_BACKUP_SETTING: &str = "last_backup_at";

/// Delay before retrying a failed pass.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Longest single sleep; deadlines are recomputed at least this often.
const MAX_SLEEP: Duration = Duration::from_secs(24 * 60 * 60);

/// Where and how often backups are written.
#[derive(Debug, Clone)]
pub struct BackupSchedule {
    /// Target directory.
    pub dir: PathBuf,
    /// Interval between backups.
    pub period: Duration,
    /// Chunk size of the backup file.
    pub chunk_bytes: usize,
}

impl BackupSchedule {
    /// Daily backups into `dir` with the default chunk size.
    pub fn daily(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            period: Duration::from_secs(24 * 60 * 60),
            chunk_bytes: DEFAULT_CHUNK_BYTES,
        }
    }
}

/// Signals a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    wake: Arc<Notify>,
    shutdown: Arc<Notify>,
}

impl SchedulerHandle {
    /// Recompute deadlines now, for example after a configuration reload.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Stop the loop after the current pass.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

/// Drives rollover, identity renewal and backups.
pub struct MaintenanceScheduler {
    authorities: Authorities,
    store: Arc<dyn CertificateStore>,
    identity: Option<ServingIdentity>,
    backup: Option<BackupSchedule>,
    retry_delay: Duration,
    wake: Arc<Notify>,
    shutdown: Arc<Notify>,
}

impl MaintenanceScheduler {
    /// Scheduler handling CA rollover only.
    pub fn new(authorities: Authorities, store: Arc<dyn CertificateStore>) -> Self {
        Self {
            authorities,
            store,
            identity: None,
            backup: None,
            retry_delay: DEFAULT_RETRY_DELAY,
            wake: Arc::new(Notify::new()),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Also keeps a serving identity current.
    pub fn with_identity(mut self, identity: ServingIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Also writes scheduled backups.
    pub fn with_backup(mut self, schedule: BackupSchedule) -> Self {
        self.backup = Some(schedule);
        self
    }

    /// Delay before a failed pass is retried.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Handle for waking or stopping the loop.
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            wake: Arc::clone(&self.wake),
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    /// Starts the loop on the runtime.
    pub fn spawn(self) -> (SchedulerHandle, JoinHandle<()>) {
        let handle = self.handle();
        let task = tokio::spawn(self.run());
        (handle, task)
    }

    /// Performs every action due at `now` and returns the next deadline.
    pub async fn run_due(&self, now: u64) -> Result<u64, MaintenanceError> {
        for authority in [self.authorities.service(), self.authorities.user()] {
            authority.maintain_ca_keys(now).await?;
        }

        if let Some(identity) = &self.identity {
            identity.ensure(self.authorities.service(), now).await?;
        }

        if let Some(schedule) = &self.backup {
            if self.backup_deadline(schedule).await? <= now {
                match write_backup(self.store.as_ref(), &schedule.dir, schedule.chunk_bytes, now)
                    .await
                {
                    Ok(_) => {},
                    // Nobody could restore it yet; try again next period.
                    Err(BackupError::NoRecipients) => {
                        info!("No operator certificate to encrypt for, backup skipped");
                    },
                    Err(e) => return Err(e.into()),
                }
                self.store
                    .put_setting(LAST_BACKUP_SETTING, &now.to_string())
                    .await?;
            }
        }

        self.next_deadline(now).await
    }

    /// Earliest upcoming deadline, never before `now`.
    pub async fn next_deadline(&self, now: u64) -> Result<u64, MaintenanceError> {
        let mut next = u64::MAX;
        for authority in [self.authorities.service(), self.authorities.user()] {
            next = next.min(authority.next_rollover_deadline(now).await?);
        }
        if let Some(identity) = &self.identity {
            next = next.min(identity.deadline(self.authorities.service().trust_set(), now).await);
        }
        if let Some(schedule) = &self.backup {
            next = next.min(self.backup_deadline(schedule).await?);
        }
        Ok(next.max(now))
    }

    async fn backup_deadline(&self, schedule: &BackupSchedule) -> Result<u64, MaintenanceError> {
        let last = self
            .store
            .get_setting(LAST_BACKUP_SETTING)
            .await?
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(0);
        Ok(last.saturating_add(schedule.period.as_secs()))
    }

    async fn pass(&self) -> u64 {
        let now = unix_now();
        match self.run_due(now).await {
            Ok(next) => {
                debug!(next, "Maintenance pass complete");
                next
            },
            Err(e) => {
                warn!(error = %e, retry_in = self.retry_delay.as_secs(), "Maintenance pass failed");
                now + self.retry_delay.as_secs()
            },
        }
    }

    async fn recompute(&self) -> u64 {
        let now = unix_now();
        match self.next_deadline(now).await {
            Ok(next) => next,
            Err(e) => {
                warn!(error = %e, "Could not compute maintenance deadline");
                now + self.retry_delay.as_secs()
            },
        }
    }

    /// Runs until [`SchedulerHandle::shutdown`].
    pub async fn run(self) {
        info!(
            identity = self.identity.is_some(),
            backup = self.backup.is_some(),
            "Maintenance scheduler started"
        );

        let mut deadline = self.pass().await;
        loop {
            let wait = Duration::from_secs(deadline.saturating_sub(unix_now())).min(MAX_SLEEP);
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Maintenance scheduler stopped");
                    break;
                }
                _ = self.wake.notified() => {
                    debug!("Maintenance scheduler woken");
                    deadline = self.recompute().await;
                }
                _ = sleep_until(Instant::now() + wait) => {
                    deadline = self.pass().await;
                }
            }
        }
    }
}
