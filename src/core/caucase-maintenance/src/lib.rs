//! # Caucase Maintenance
//!
//! Time-driven upkeep of a running authority.
//!
//! ## Features
//!
//! - Two-phase CA rollover on both hierarchies
//! - Serving identity renewal, immediate when its files go missing
//! - Scheduled backups, tracked in the store across restarts
//! - Early wake for configuration reloads

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod identity;
pub mod scheduler;

pub use error::MaintenanceError;
pub use identity::{ServingIdentity, DEFAULT_RENEW_THRESHOLD_DAYS};
pub use scheduler::{
    BackupSchedule, MaintenanceScheduler, SchedulerHandle, DEFAULT_RETRY_DELAY, LAST_BACKUP_SETTING,
};
