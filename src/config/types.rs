//! Configuration types.
//!
//! Every field carries a serde default, so an empty document is a valid
//! configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::core::job::DEFAULT_MAX_RETRIES;
use crate::core::retry::{BackoffStrategy, RetryPolicy};
use crate::core::types::{JobType, WorkerId};
use crate::execution::DEFAULT_TIMEOUT;
use crate::scheduler::DEFAULT_DUE_BATCH_SIZE;

/// Engine and worker configuration (kairos.yaml).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Identity recorded on claims. Generated when absent.
    pub worker_id: Option<String>,
    /// Seconds between polls for due jobs.
    pub tick_interval_secs: u64,
    /// Maximum jobs fetched per poll.
    pub batch_size: usize,
    /// Maximum jobs executing at once.
    pub max_concurrent_jobs: usize,
    /// Claims older than this are released. Recovery is off when absent.
    pub claim_lease_secs: Option<u64>,
    /// Seconds to wait for running jobs on shutdown.
    pub shutdown_timeout_secs: u64,
    /// Handler timeout when neither the type nor the handler sets one.
    pub default_timeout_secs: u64,
    /// Handler timeouts per job type, in seconds.
    pub type_timeouts: HashMap<JobType, u64>,
    /// Delay between retries.
    pub retry: RetryConfig,
    /// Retry budget for seeded jobs that do not set one.
    pub default_max_retries: u32,
    /// Job store backend.
    pub storage: StorageConfig,
    /// Jobs scheduled when the worker starts.
    pub jobs: Vec<JobSeedConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            tick_interval_secs: 1,
            batch_size: DEFAULT_DUE_BATCH_SIZE,
            max_concurrent_jobs: 4,
            claim_lease_secs: None,
            shutdown_timeout_secs: 30,
            default_timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            type_timeouts: HashMap::new(),
            retry: RetryConfig::default(),
            default_max_retries: DEFAULT_MAX_RETRIES,
            storage: StorageConfig::default(),
            jobs: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// The configured worker id, or a generated one.
    pub fn worker_id(&self) -> WorkerId {
        match &self.worker_id {
            Some(id) => WorkerId::new(id.clone()),
            None => WorkerId::generate(),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn claim_lease(&self) -> Option<Duration> {
        self.claim_lease_secs.map(Duration::from_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    /// Per-type handler timeouts.
    pub fn type_timeouts(&self) -> impl Iterator<Item = (JobType, Duration)> + '_ {
        self.type_timeouts
            .iter()
            .map(|(job_type, secs)| (job_type.clone(), Duration::from_secs(*secs)))
    }

    /// Longest configured attempt timeout, in seconds.
    pub fn longest_timeout_secs(&self) -> u64 {
        self.type_timeouts
            .values()
            .copied()
            .fold(self.default_timeout_secs, u64::max)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.to_policy()
    }
}

/// Retry delay configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub backoff: BackoffStrategy,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            backoff: policy.backoff,
            base_delay_secs: policy.base_delay.as_secs(),
            max_delay_secs: policy.max_delay.as_secs(),
        }
    }
}

impl RetryConfig {
    /// Convert to the engine's retry policy.
    pub fn to_policy(&self) -> RetryPolicy {
        let base = Duration::from_secs(self.base_delay_secs);
        match self.backoff {
            BackoffStrategy::Fixed => RetryPolicy::fixed(base),
            BackoffStrategy::Exponential => {
                RetryPolicy::exponential(base, Duration::from_secs(self.max_delay_secs))
            }
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    /// In-memory storage (default, non-persistent).
    #[serde(rename = "memory")]
    #[default]
    Memory,
    /// SQLite storage.
    #[serde(rename = "sqlite")]
    Sqlite {
        /// Path to the database file.
        path: String,
    },
}

/// A job scheduled at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSeedConfig {
    /// Job type name, e.g. `reminder` or `custom:log`.
    pub job_type: JobType,
    /// Target entity id.
    pub target: Option<String>,
    /// First run as RFC 3339. Defaults to startup time.
    pub run_at: Option<String>,
    /// Recurrence expression such as `@daily` or `@every 15m`.
    #[serde(default)]
    pub recurrence: Option<String>,
    /// IANA timezone the recurrence is evaluated in.
    pub timezone: Option<String>,
    /// Last instant an occurrence may run at, as RFC 3339.
    #[serde(default)]
    pub until: Option<String>,
    /// Total number of runs.
    #[serde(default)]
    pub occurrences: Option<u32>,
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub payload: HashMap<String, serde_json::Value>,
}
