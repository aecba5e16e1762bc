//! Configuration loading via `ortho-config`.

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::group::GroupTimings;
use crate::quota::QuotaLimits;

/// Service configuration derived from environment variables, configuration
/// files, and CLI flags.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "VOLBACK")]
pub struct ServiceConfig {
    /// Host name this process serves; volume and backup records are owned
    /// by host name. This value is required.
    pub host: String,
    /// Availability zone announced to the service registry. Defaults to
    /// `zone-a`.
    #[ortho_config(default = "zone-a".to_owned())]
    pub availability_zone: String,
    /// Backup driver service to run. Defaults to the metadata-only `sim`
    /// driver.
    #[ortho_config(default = "sim".to_owned())]
    pub backup_driver: String,
    /// Upper bound on concurrently running executor operations.
    #[ortho_config(default = 16)]
    pub max_concurrent_operations: usize,
    /// Seconds between instance-group completion polls.
    #[ortho_config(default = 5)]
    pub group_poll_interval_secs: u64,
    /// Number of group completion polls before pending members are failed.
    #[ortho_config(default = 720)]
    pub group_poll_max_attempts: u32,
    /// Seconds between polls while waiting for a restore target volume to
    /// settle.
    #[ortho_config(default = 1)]
    pub volume_poll_interval_secs: u64,
    /// Seconds to wait before retrying a timed-out filesystem thaw.
    #[ortho_config(default = 20)]
    pub thaw_retry_delay_secs: u64,
    /// Default per-project backup-count limit. Unset means unlimited.
    pub default_backup_limit: Option<u64>,
    /// Default per-project backup capacity limit in gigabytes. Unset means
    /// unlimited.
    pub default_backup_gigabytes: Option<u64>,
}

/// Metadata for a configuration field, used to generate actionable error
/// messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

impl ServiceConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to volback.toml",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }

    /// Loads configuration using the `ortho-config` derive. Values merge
    /// defaults, configuration files, environment variables, and CLI flags
    /// in that order of precedence.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the loader fails to merge
    /// sources.
    pub fn load_from_sources() -> Result<Self, ConfigError> {
        Self::load().map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Loads configuration without attempting to parse CLI arguments.
    /// Values still merge defaults, configuration files, and environment
    /// variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("volback")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages include guidance on how
    /// to provide missing values via environment variables or configuration
    /// files.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty
    /// and [`ConfigError::InvalidValue`] when a numeric knob is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(
            &self.host,
            &FieldMetadata::new("executor host name", "VOLBACK_HOST", "host"),
        )?;
        Self::require_field(
            &self.availability_zone,
            &FieldMetadata::new(
                "availability zone",
                "VOLBACK_AVAILABILITY_ZONE",
                "availability_zone",
            ),
        )?;
        Self::require_field(
            &self.backup_driver,
            &FieldMetadata::new("backup driver", "VOLBACK_BACKUP_DRIVER", "backup_driver"),
        )?;
        if self.max_concurrent_operations == 0 {
            return Err(ConfigError::InvalidValue(
                "VOLBACK_MAX_CONCURRENT_OPERATIONS must be greater than zero".to_owned(),
            ));
        }
        Self::require_nonzero(
            self.group_poll_interval_secs,
            "VOLBACK_GROUP_POLL_INTERVAL_SECS",
        )?;
        Self::require_nonzero(
            u64::from(self.group_poll_max_attempts),
            "VOLBACK_GROUP_POLL_MAX_ATTEMPTS",
        )?;
        Self::require_nonzero(
            self.volume_poll_interval_secs,
            "VOLBACK_VOLUME_POLL_INTERVAL_SECS",
        )?;
        Ok(())
    }

    fn require_nonzero(value: u64, env_var: &'static str) -> Result<(), ConfigError> {
        if value == 0 {
            return Err(ConfigError::InvalidValue(format!(
                "{env_var} must be greater than zero"
            )));
        }
        Ok(())
    }

    /// Default per-project quota limits taken from the configuration.
    #[must_use]
    pub const fn quota_limits(&self) -> QuotaLimits {
        QuotaLimits {
            backups: self.default_backup_limit,
            backup_gigabytes: self.default_backup_gigabytes,
        }
    }

    /// Timing knobs for the instance-group coordinator.
    #[must_use]
    pub const fn group_timings(&self) -> GroupTimings {
        GroupTimings {
            poll_interval: Duration::from_secs(self.group_poll_interval_secs),
            max_polls: self.group_poll_max_attempts,
            thaw_retry_delay: Duration::from_secs(self.thaw_retry_delay_secs),
        }
    }

    /// Interval of the restore-target settle poll.
    #[must_use]
    pub const fn volume_poll_interval(&self) -> Duration {
        Duration::from_secs(self.volume_poll_interval_secs)
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a field is present but holds an unusable value.
    #[error("invalid configuration value: {0}")]
    InvalidValue(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn config() -> ServiceConfig {
        ServiceConfig {
            host: "host-1".to_owned(),
            availability_zone: "zone-a".to_owned(),
            backup_driver: "sim".to_owned(),
            max_concurrent_operations: 16,
            group_poll_interval_secs: 5,
            group_poll_max_attempts: 720,
            volume_poll_interval_secs: 1,
            thaw_retry_delay_secs: 20,
            default_backup_limit: None,
            default_backup_gigabytes: None,
        }
    }

    #[rstest]
    fn defaults_pass_validation() {
        config().validate().expect("valid");
    }

    #[rstest]
    fn blank_host_is_rejected_with_guidance() {
        let cfg = ServiceConfig {
            host: "  ".to_owned(),
            ..config()
        };
        let err = cfg.validate().expect_err("blank host");
        match err {
            ConfigError::MissingField(message) => {
                assert!(message.contains("VOLBACK_HOST"));
                assert!(message.contains("volback.toml"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[rstest]
    fn zero_poll_interval_is_rejected() {
        let cfg = ServiceConfig {
            group_poll_interval_secs: 0,
            ..config()
        };
        let err = cfg.validate().expect_err("zero interval");
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[rstest]
    fn timings_reflect_the_configured_seconds() {
        let timings = config().group_timings();
        assert_eq!(timings.poll_interval, Duration::from_secs(5));
        assert_eq!(timings.max_polls, 720);
        assert_eq!(timings.thaw_retry_delay, Duration::from_secs(20));
    }
}
