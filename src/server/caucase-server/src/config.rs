//! `caucased` configuration file.
//!
//! Every key is optional. Timings left out of a hierarchy section are derived
//! from its certificate lifetime, the same way [`AuthorityConfig::from_crt_life`]
//! derives them.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use caucase_backup::DEFAULT_CHUNK_BYTES;
use caucase_ca::AuthorityConfig;
use caucase_maintenance::{BackupSchedule, MaintenanceError, ServingIdentity, DEFAULT_RENEW_THRESHOLD_DAYS};
use caucase_storage::Hierarchy;

const DAY: u64 = 24 * 60 * 60;
const HOUR: u64 = 60 * 60;

/// Configuration file used when none is given.
pub const DEFAULT_CONFIG_PATH: &str = "caucase.toml";

/// Configuration errors. All of them stop `caucased` before it serves.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read {}: {source}", path.display())]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },

    /// The file is not valid TOML or has unknown keys.
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// Values that cannot work together.
    #[error("invalid {section} settings: {reason}")]
    Invalid {
        /// Offending section.
        section: &'static str,
        /// What is wrong.
        reason: String,
    },
}

/// Whole `caucased` configuration.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Directory holding the database.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// HTTP listen address.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Request body limit.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Service hierarchy settings.
    #[serde(default)]
    pub service: HierarchySection,

    /// User hierarchy settings.
    #[serde(default)]
    pub user: HierarchySection,

    /// Scheduled backups.
    #[serde(default)]
    pub backup: BackupSection,

    /// Certificate of the HTTP front end, when caucased manages it.
    #[serde(default)]
    pub serving: Option<ServingSection>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_max_body_bytes() -> usize {
    caucase_api::DEFAULT_MAX_BODY_BYTES
}

/// `[service]` and `[user]`.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HierarchySection {
    pub max_pending_csr: Option<u64>,
    pub auto_approve_count: Option<u64>,
    pub lock_auto_approve_count: bool,
    pub crt_life_days: Option<u64>,
    pub ca_life_days: Option<u64>,
    pub publish_lead_days: Option<u64>,
    pub activate_lead_days: Option<u64>,
    pub crl_life_hours: Option<u64>,
}

impl HierarchySection {
    /// Resolves defaults for `hierarchy` and validates the result.
    pub fn authority_config(&self, hierarchy: Hierarchy) -> Result<AuthorityConfig, ConfigError> {
        let defaults = AuthorityConfig::for_hierarchy(hierarchy);
        let derived = match self.crt_life_days {
            Some(days) => AuthorityConfig::from_crt_life(Duration::from_secs(days * DAY)),
            None => defaults.clone(),
        };
        let days = |value: Option<u64>, fallback: Duration| {
            value.map_or(fallback, |d| Duration::from_secs(d * DAY))
        };

        let config = AuthorityConfig {
            max_pending_csr: self.max_pending_csr.unwrap_or(defaults.max_pending_csr),
            auto_approve_count: self.auto_approve_count.unwrap_or(defaults.auto_approve_count),
            lock_auto_approve_count: self.lock_auto_approve_count,
            crt_life: derived.crt_life,
            ca_life: days(self.ca_life_days, derived.ca_life),
            publish_lead: days(self.publish_lead_days, derived.publish_lead),
            activate_lead: days(self.activate_lead_days, derived.activate_lead),
            crl_life: self
                .crl_life_hours
                .map_or(defaults.crl_life, |h| Duration::from_secs(h * HOUR)),
        };
        config.validate().map_err(|e| ConfigError::Invalid {
            section: hierarchy_section(hierarchy),
            reason: e.to_string(),
        })?;
        Ok(config)
    }
}

fn hierarchy_section(hierarchy: Hierarchy) -> &'static str {
    match hierarchy {
        Hierarchy::Service => "service",
        Hierarchy::User => "user",
    }
}

/// `[backup]`
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackupSection {
    /// Scheduled backups are off without a directory.
    pub dir: Option<PathBuf>,
    pub period_hours: u64,
    pub chunk_bytes: usize,
}

impl Default for BackupSection {
    fn default() -> Self {
        Self {
            dir: None,
            period_hours: 24,
            chunk_bytes: DEFAULT_CHUNK_BYTES,
        }
    }
}

impl BackupSection {
    /// Schedule to hand to the maintenance scheduler, if backups are on.
    pub fn schedule(&self) -> Result<Option<BackupSchedule>, ConfigError> {
        let Some(dir) = &self.dir else {
            return Ok(None);
        };
        if self.period_hours == 0 || self.chunk_bytes == 0 {
            return Err(ConfigError::Invalid {
                section: "backup",
                reason: "period_hours and chunk_bytes must be positive".into(),
            });
        }
        Ok(Some(BackupSchedule {
            dir: dir.clone(),
            period: Duration::from_secs(self.period_hours * HOUR),
            chunk_bytes: self.chunk_bytes,
        }))
    }
}

/// `[serving]`
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServingSection {
    pub hostnames: Vec<String>,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    #[serde(default = "default_renew_threshold_days")]
    pub renew_threshold_days: u64,
}

fn default_renew_threshold_days() -> u64 {
    DEFAULT_RENEW_THRESHOLD_DAYS
}

impl ServingSection {
    /// Serving identity kept current by the scheduler.
    pub fn identity(&self) -> Result<ServingIdentity, ConfigError> {
        ServingIdentity::new(
            self.hostnames.clone(),
            self.cert_path.clone(),
            self.key_path.clone(),
            Duration::from_secs(self.renew_threshold_days * DAY),
        )
        .map_err(|e: MaintenanceError| ConfigError::Invalid {
            section: "serving",
            reason: e.to_string(),
        })
    }
}

impl ServerConfig {
    /// Reads `path`. A missing file is only an error when it was asked for
    /// explicitly.
    pub fn load(path: &Path, explicit: bool) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text),
            Err(e) if e.kind() == io::ErrorKind::NotFound && !explicit => Self::parse(""),
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Parses TOML text.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Both authority configurations, validated.
    pub fn authority_configs(&self) -> Result<(AuthorityConfig, AuthorityConfig), ConfigError> {
        Ok((
            self.service.authority_config(Hierarchy::Service)?,
            self.user.authority_config(Hierarchy::User)?,
        ))
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = ServerConfig::parse("").unwrap();
        assert_eq!(config.bind, "127.0.0.1:8000");
        assert_eq!(config.max_body_bytes, caucase_api::DEFAULT_MAX_BODY_BYTES);
        assert!(config.backup.schedule().unwrap().is_none());
        assert!(config.serving.is_none());

        let (service, user) = config.authority_configs().unwrap();
        assert_eq!(service, AuthorityConfig::for_hierarchy(Hierarchy::Service));
        assert_eq!(user, AuthorityConfig::for_hierarchy(Hierarchy::User));
    }

    #[test]
    fn test_timings_follow_crt_life() {
        let config = ServerConfig::parse(
            r#"
            [service]
            crt_life_days = 10
            publish_lead_days = 25
            crl_life_hours = 6
            "#,
        )
        .unwrap();
        let (service, _) = config.authority_configs().unwrap();
        assert_eq!(service.crt_life, Duration::from_secs(10 * DAY));
        assert_eq!(service.ca_life, Duration::from_secs(40 * DAY));
        assert_eq!(service.publish_lead, Duration::from_secs(25 * DAY));
        assert_eq!(service.activate_lead, Duration::from_secs(10 * DAY));
        assert_eq!(service.crl_life, Duration::from_secs(6 * HOUR));
        assert_eq!(service.auto_approve_count, 0);
    }

    #[test]
    fn test_inconsistent_timings_fail() {
        let config = ServerConfig::parse(
            r#"
            [user]
            crt_life_days = 30
            activate_lead_days = 10
            "#,
        )
        .unwrap();
        assert!(matches!(
            config.authority_configs(),
            Err(ConfigError::Invalid { section: "user", .. })
        ));
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(matches!(
            ServerConfig::parse("[service]\nmax_pending = 3\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_backup_and_serving_sections() {
        let config = ServerConfig::parse(
            r#"
            [backup]
            dir = "/var/backups/caucase"
            period_hours = 6

            [serving]
            hostnames = ["ca.example.com"]
            cert_path = "/etc/caucase/tls.crt"
            key_path = "/etc/caucase/tls.key"
            "#,
        )
        .unwrap();

        let schedule = config.backup.schedule().unwrap().unwrap();
        assert_eq!(schedule.period, Duration::from_secs(6 * HOUR));
        assert_eq!(schedule.chunk_bytes, DEFAULT_CHUNK_BYTES);

        let serving = config.serving.unwrap();
        assert_eq!(serving.renew_threshold_days, DEFAULT_RENEW_THRESHOLD_DAYS);
        assert_eq!(serving.identity().unwrap().key_path(), Path::new("/etc/caucase/tls.key"));
    }

    #[test]
    fn test_serving_needs_hostnames() {
        let config = ServerConfig::parse(
            "[serving]\nhostnames = []\ncert_path = \"a\"\nkey_path = \"b\"\n",
        )
        .unwrap();
        assert!(config.serving.unwrap().identity().is_err());
    }

    #[test]
    fn test_missing_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("caucase.toml");

        assert!(ServerConfig::load(&path, false).is_ok());
        assert!(matches!(ServerConfig::load(&path, true), Err(ConfigError::Read { .. })));

        std::fs::write(&path, "bind = \"0.0.0.0:9000\"\n").unwrap();
        assert_eq!(ServerConfig::load(&path, true).unwrap().bind, "0.0.0.0:9000");
    }
}
