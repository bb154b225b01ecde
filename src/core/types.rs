//! Core identifier types for the scheduler.
//!
//! These types provide type-safe identifiers for jobs, claims and workers,
//! plus the job type tag used to route a job to its handler.

use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a scheduled job.
///
/// Backed by a UUIDv7, so the hyphenated string form sorts in creation order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(String);

/// Token identifying one claim of a job by a worker.
///
/// A fresh token is minted for every execution attempt, so a worker can tell
/// whether the claim it holds is still the one recorded in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClaimId(Uuid);

/// Identifier of a worker process or task that claims jobs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(String);

impl JobId {
    /// Generate a new time-ordered JobId.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().hyphenated().to_string())
    }

    /// Create a JobId from an existing string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the underlying string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl ClaimId {
    /// Generate a new random ClaimId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a ClaimId from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ClaimId {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerId {
    /// Create a new WorkerId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a worker id unique to this process instance.
    pub fn generate() -> Self {
        Self(format!("worker-{}", Uuid::new_v4().simple()))
    }

    /// Get the underlying string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// The kind of work a job performs.
///
/// The known variants cover the domain packages that schedule work through
/// this engine. Host applications add their own kinds with [`JobType::Custom`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum JobType {
    /// Closing an accounting period.
    PeriodClose,
    /// Shredding documents whose retention period expired.
    DocumentRetention,
    /// Starting a planned production order.
    ProductionOrderStart,
    /// Sending a reminder notification.
    Reminder,
    /// Exporting a report.
    ReportExport,
    /// Purging obsolete data.
    DataCleanup,
    /// Host-defined job type.
    Custom(String),
}

impl JobType {
    /// Wire name of the job type.
    pub fn name(&self) -> &str {
        match self {
            JobType::PeriodClose => "period_close",
            JobType::DocumentRetention => "document_retention",
            JobType::ProductionOrderStart => "production_order_start",
            JobType::Reminder => "reminder",
            JobType::ReportExport => "report_export",
            JobType::DataCleanup => "data_cleanup",
            JobType::Custom(name) => name,
        }
    }

    /// Whether jobs of this type must reference a target entity.
    ///
    /// Cleanup runs sweep a whole data set and custom types validate their
    /// own payloads, so neither demands a target id.
    pub fn requires_target(&self) -> bool {
        !matches!(self, JobType::DataCleanup | JobType::Custom(_))
    }
}

impl FromStr for JobType {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "period_close" => JobType::PeriodClose,
            "document_retention" => JobType::DocumentRetention,
            "production_order_start" => JobType::ProductionOrderStart,
            "reminder" => JobType::Reminder,
            "report_export" => JobType::ReportExport,
            "data_cleanup" => JobType::DataCleanup,
            other => JobType::Custom(other.strip_prefix("custom:").unwrap_or(other).to_string()),
        })
    }
}

impl From<String> for JobType {
    fn from(s: String) -> Self {
        match s.parse() {
            Ok(job_type) => job_type,
            Err(never) => match never {},
        }
    }
}

impl From<JobType> for String {
    fn from(job_type: JobType) -> Self {
        job_type.to_string()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ClaimId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobType::Custom(name) => write!(f, "custom:{}", name),
            known => write!(f, "{}", known.name()),
        }
    }
}
