//! YAML configuration parsing.

use chrono::{DateTime, Utc};
use std::path::Path;

use super::builder::build_definition;
use super::error::ConfigError;
use super::types::{EngineConfig, StorageConfig};
use crate::core::clock::{Clock, SystemClock};
use crate::core::recurrence::ScheduleRecurrence;

/// Loader for engine configuration files.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate configuration from a file against the system clock.
    pub fn load(path: impl AsRef<Path>) -> Result<EngineConfig, ConfigError> {
        Self::load_at(path, SystemClock.now())
    }

    /// Load and validate configuration, checking seeded jobs as of `now`.
    pub fn load_at(path: impl AsRef<Path>, now: DateTime<Utc>) -> Result<EngineConfig, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileReadError {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse_at(&content, now)
    }

    /// Parse and validate configuration against the system clock.
    pub fn parse(yaml: &str) -> Result<EngineConfig, ConfigError> {
        Self::parse_at(yaml, SystemClock.now())
    }

    /// Parse and validate configuration, checking seeded jobs as of `now`.
    pub fn parse_at(yaml: &str, now: DateTime<Utc>) -> Result<EngineConfig, ConfigError> {
        let config: EngineConfig = if yaml.trim().is_empty() {
            EngineConfig::default()
        } else {
            serde_yaml::from_str(yaml)?
        };
        Self::validate(&config, now)?;
        Ok(config)
    }

    /// Check value ranges and every seeded job.
    ///
    /// Seeded jobs without `run_at` start at `now`, and end conditions are
    /// checked against that.
    pub fn validate(config: &EngineConfig, now: DateTime<Utc>) -> Result<(), ConfigError> {
        if config.tick_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "tick_interval_secs must be greater than 0".into(),
            ));
        }
        if config.batch_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "batch_size must be greater than 0".into(),
            ));
        }
        if config.max_concurrent_jobs == 0 {
            return Err(ConfigError::InvalidConfig(
                "max_concurrent_jobs must be greater than 0".into(),
            ));
        }
        if config.claim_lease_secs == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "claim_lease_secs must be greater than 0".into(),
            ));
        }
        if config.default_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "default_timeout_secs must be greater than 0".into(),
            ));
        }
        if let Some((job_type, _)) = config.type_timeouts.iter().find(|(_, secs)| **secs == 0) {
            return Err(ConfigError::InvalidConfig(format!(
                "timeout for job type '{}' must be greater than 0",
                job_type
            )));
        }
        if let Some(lease) = config.claim_lease_secs
            && lease <= config.longest_timeout_secs()
        {
            return Err(ConfigError::InvalidConfig(format!(
                "claim_lease_secs ({}) must exceed the longest job timeout ({}s)",
                lease,
                config.longest_timeout_secs()
            )));
        }
        if config.retry.max_delay_secs < config.retry.base_delay_secs {
            return Err(ConfigError::InvalidConfig(
                "retry.max_delay_secs must not be less than retry.base_delay_secs".into(),
            ));
        }
        if let StorageConfig::Sqlite { path } = &config.storage
            && path.trim().is_empty()
        {
            return Err(ConfigError::InvalidConfig(
                "storage.path must not be empty".into(),
            ));
        }

        for (index, seed) in config.jobs.iter().enumerate() {
            if let Some(expression) = &seed.recurrence {
                ScheduleRecurrence::parse(expression).map_err(|e| {
                    ConfigError::InvalidConfig(format!("jobs[{}].recurrence: {}", index, e))
                })?;
            }
            build_definition(seed, config.default_max_retries, now)
                .map_err(|e| ConfigError::InvalidConfig(format!("jobs[{}]: {}", index, e)))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::retry::{BackoffStrategy, RetryPolicy};
    use crate::core::types::JobType;
    use chrono::TimeZone;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_parse_empty_config() {
        let config = ConfigLoader::parse("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.storage, StorageConfig::Memory);
        assert_eq!(config.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
worker_id: worker-a
tick_interval_secs: 5
batch_size: 50
max_concurrent_jobs: 8
claim_lease_secs: 1200
shutdown_timeout_secs: 10
default_timeout_secs: 120
type_timeouts:
  report_export: 900
  custom:log: 5
retry:
  backoff: fixed
  base_delay_secs: 60
  max_delay_secs: 60
default_max_retries: 5
storage:
  type: sqlite
  path: /var/lib/kairos/jobs.db
jobs:
  - job_type: reminder
    target: invoice-42
    run_at: "2024-03-01T09:00:00Z"
    recurrence: "@daily"
    timezone: Europe/Berlin
    priority: 10
    payload:
      channel: email
"#;
        let config = ConfigLoader::parse(yaml).unwrap();

        assert_eq!(config.worker_id().as_str(), "worker-a");
        assert_eq!(config.tick_interval(), Duration::from_secs(5));
        assert_eq!(config.claim_lease(), Some(Duration::from_secs(1200)));
        assert_eq!(config.longest_timeout_secs(), 900);
        assert_eq!(config.retry.backoff, BackoffStrategy::Fixed);
        assert_eq!(config.retry_policy().delay_for(3), Duration::from_secs(60));
        assert_eq!(
            config.type_timeouts.get(&JobType::ReportExport),
            Some(&900)
        );
        assert_eq!(
            config.type_timeouts.get(&JobType::Custom("log".into())),
            Some(&5)
        );
        assert_eq!(
            config.storage,
            StorageConfig::Sqlite {
                path: "/var/lib/kairos/jobs.db".into()
            }
        );
        assert_eq!(config.jobs.len(), 1);
        assert_eq!(config.jobs[0].job_type, JobType::Reminder);
    }

    #[test]
    fn test_validation_rejects_zero_concurrency() {
        let result = ConfigLoader::parse("max_concurrent_jobs: 0");
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_validation_rejects_inverted_retry_bounds() {
        let yaml = "retry:\n  base_delay_secs: 100\n  max_delay_secs: 10\n";
        let result = ConfigLoader::parse(yaml);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_validation_rejects_zero_type_timeout() {
        let yaml = "type_timeouts:\n  reminder: 0\n";
        let err = ConfigLoader::parse(yaml).unwrap_err();
        assert!(err.to_string().contains("reminder"));
    }

    #[test]
    fn test_validation_rejects_unknown_recurrence() {
        let yaml = "jobs:\n  - job_type: data_cleanup\n    recurrence: \"@hourly-ish\"\n";
        let err = ConfigLoader::parse(yaml).unwrap_err();
        assert!(err.to_string().contains("jobs[0].recurrence"));
    }

    #[test]
    fn test_validation_rejects_missing_target() {
        let yaml = "jobs:\n  - job_type: reminder\n";
        let err = ConfigLoader::parse(yaml).unwrap_err();
        assert!(err.to_string().contains("jobs[0]"));
    }

    #[test]
    fn test_validation_rejects_lease_within_timeout() {
        let err = ConfigLoader::parse("claim_lease_secs: 60\ndefault_timeout_secs: 200\n")
            .unwrap_err();
        assert!(err.to_string().contains("claim_lease_secs"));

        let yaml = "claim_lease_secs: 600\ndefault_timeout_secs: 60\ntype_timeouts:\n  report_export: 600\n";
        assert!(ConfigLoader::parse(yaml).is_err());

        let yaml = "claim_lease_secs: 601\ndefault_timeout_secs: 60\ntype_timeouts:\n  report_export: 600\n";
        assert!(ConfigLoader::parse(yaml).is_ok());
    }

    #[test]
    fn test_seeded_jobs_are_checked_against_reference_time() {
        let yaml = r#"
jobs:
  - job_type: data_cleanup
    recurrence: "@daily"
    until: "2024-06-01T00:00:00Z"
"#;
        let before = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap();

        assert!(ConfigLoader::parse_at(yaml, before).is_ok());
        assert!(ConfigLoader::parse_at(yaml, after).is_err());
    }

    #[test]
    fn test_validation_rejects_empty_sqlite_path() {
        let yaml = "storage:\n  type: sqlite\n  path: \"\"\n";
        assert!(ConfigLoader::parse(yaml).is_err());
    }

    #[test]
    fn test_parse_rejects_malformed_yaml() {
        let result = ConfigLoader::parse("batch_size: [");
        assert!(matches!(result, Err(ConfigError::YamlError(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_concurrent_jobs: 2").unwrap();

        let config = ConfigLoader::load(file.path()).unwrap();
        assert_eq!(config.max_concurrent_jobs, 2);
    }

    #[test]
    fn test_load_missing_file() {
        let result = ConfigLoader::load("/nonexistent/kairos.yaml");
        assert!(matches!(result, Err(ConfigError::FileReadError { .. })));
    }
}
