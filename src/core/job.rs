//! Scheduled job records and the definitions they are created from.
//!
//! A [`ScheduleDefinition`] is the caller's request; a [`ScheduledJob`] is the
//! persisted record the engine claims, executes and settles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use super::recurrence::{RecurrenceError, ScheduleRecurrence};
use super::types::{ClaimId, JobId, JobType, WorkerId};

/// Default number of retries for a new job.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Errors raised when building a schedule definition.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DefinitionError {
    /// The job type needs a target entity and none was given.
    #[error("job type {0} requires a target id")]
    MissingTarget(JobType),

    /// The recurrence is malformed.
    #[error("invalid recurrence: {0}")]
    InvalidRecurrence(#[from] RecurrenceError),
}

/// Lifecycle state of a scheduled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `run_at`, or waiting to be retried.
    Pending,
    /// Claimed by a worker and executing.
    Running,
    /// Finished for good.
    Completed,
    /// Failed with no retries left or a non-retryable error.
    FailedPermanent,
    /// Canceled by a caller.
    Canceled,
}

impl JobStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::FailedPermanent,
        JobStatus::Canceled,
    ];

    /// Terminal states have no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::FailedPermanent | JobStatus::Canceled
        )
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Canceled)
                | (Pending, Pending)
                | (Running, Running)
                | (Running, Pending)
                | (Running, Completed)
                | (Running, FailedPermanent)
                | (Running, Canceled)
        )
    }

    /// Storage name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::FailedPermanent => "failed_permanent",
            JobStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Marker recorded while a worker holds a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    /// Token minted for this attempt.
    pub token: ClaimId,
    /// Worker holding the claim.
    pub worker: WorkerId,
    /// When the claim was taken.
    pub claimed_at: DateTime<Utc>,
}

/// Outcome reported by a handler for one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    /// Whether the attempt succeeded.
    pub success: bool,
    /// Handler output.
    pub output: Option<Value>,
    /// Error description for failed attempts.
    pub error: Option<String>,
    /// Whether a failed attempt may be retried.
    pub should_retry: bool,
    /// Explicit delay before the retry, overriding the engine backoff.
    pub retry_after: Option<Duration>,
}

impl JobResult {
    /// A successful attempt with no output.
    pub fn success() -> Self {
        Self {
            success: true,
            output: None,
            error: None,
            should_retry: false,
            retry_after: None,
        }
    }

    /// A retryable failure.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
            should_retry: true,
            retry_after: None,
        }
    }

    /// A failure that must not be retried.
    pub fn permanent_failure(error: impl Into<String>) -> Self {
        Self {
            should_retry: false,
            ..Self::failure(error)
        }
    }

    /// Builder: attach output.
    pub fn with_output(mut self, output: impl Into<Value>) -> Self {
        self.output = Some(output.into());
        self
    }

    /// Builder: request a specific retry delay.
    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }
}

/// Validated request to schedule a job.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleDefinition {
    job_type: JobType,
    target_id: Option<String>,
    run_at: DateTime<Utc>,
    recurrence: ScheduleRecurrence,
    max_retries: u32,
    priority: i32,
    metadata: HashMap<String, Value>,
    payload: HashMap<String, Value>,
}

impl ScheduleDefinition {
    /// Start building a definition.
    pub fn builder(job_type: JobType, run_at: DateTime<Utc>) -> ScheduleDefinitionBuilder {
        ScheduleDefinitionBuilder {
            job_type,
            target_id: None,
            run_at,
            recurrence: ScheduleRecurrence::none(),
            max_retries: DEFAULT_MAX_RETRIES,
            priority: 0,
            metadata: HashMap::new(),
            payload: HashMap::new(),
        }
    }

    pub fn job_type(&self) -> &JobType {
        &self.job_type
    }

    pub fn target_id(&self) -> Option<&str> {
        self.target_id.as_deref()
    }

    pub fn run_at(&self) -> DateTime<Utc> {
        self.run_at
    }

    pub fn recurrence(&self) -> &ScheduleRecurrence {
        &self.recurrence
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    pub fn payload(&self) -> &HashMap<String, Value> {
        &self.payload
    }
}

/// Builder for [`ScheduleDefinition`].
#[derive(Debug, Clone)]
pub struct ScheduleDefinitionBuilder {
    job_type: JobType,
    target_id: Option<String>,
    run_at: DateTime<Utc>,
    recurrence: ScheduleRecurrence,
    max_retries: u32,
    priority: i32,
    metadata: HashMap<String, Value>,
    payload: HashMap<String, Value>,
}

impl ScheduleDefinitionBuilder {
    /// Set the target entity.
    pub fn target(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }

    /// Set the recurrence.
    pub fn recurrence(mut self, recurrence: ScheduleRecurrence) -> Self {
        self.recurrence = recurrence;
        self
    }

    /// Set the retry budget.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the priority. Higher runs first among due jobs.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Add a metadata entry.
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Add a payload entry.
    pub fn payload(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Validate and build the definition.
    pub fn build(self) -> Result<ScheduleDefinition, DefinitionError> {
        let target_id = self.target_id.filter(|t| !t.trim().is_empty());
        if target_id.is_none() && self.job_type.requires_target() {
            return Err(DefinitionError::MissingTarget(self.job_type));
        }

        self.recurrence.validate(self.run_at)?;

        Ok(ScheduleDefinition {
            job_type: self.job_type,
            target_id,
            run_at: self.run_at,
            recurrence: self.recurrence,
            max_retries: self.max_retries,
            priority: self.priority,
            metadata: self.metadata,
            payload: self.payload,
        })
    }
}

/// Persisted job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    /// Unique job identifier.
    pub id: JobId,
    /// Kind of work, used to resolve the handler.
    pub job_type: JobType,
    /// Entity the job acts on.
    pub target_id: Option<String>,
    /// When the job becomes due.
    pub run_at: DateTime<Utc>,
    /// Calendar time of the current occurrence. Retries move `run_at` only,
    /// so the next occurrence is computed from here.
    pub scheduled_for: DateTime<Utc>,
    /// Lifecycle state.
    pub status: JobStatus,
    /// Repetition rule.
    pub recurrence: ScheduleRecurrence,
    /// Retry budget per occurrence.
    pub max_retries: u32,
    /// Retries consumed by the current occurrence.
    pub retry_count: u32,
    /// Successful occurrences so far.
    pub occurrence_count: u32,
    /// Result of the most recent attempt.
    pub last_result: Option<JobResult>,
    /// Higher runs first among due jobs.
    pub priority: i32,
    /// Caller metadata.
    pub metadata: HashMap<String, Value>,
    /// Handler input.
    pub payload: HashMap<String, Value>,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// When the job was last written.
    pub updated_at: DateTime<Utc>,
    /// Store revision, bumped on every successful save.
    pub version: u64,
    /// Present while a worker holds the job.
    pub claim: Option<Claim>,
    /// Cancel arrived while the job was running.
    pub cancel_requested: bool,
}

impl ScheduledJob {
    /// Create a pending job from a definition.
    pub fn from_definition(id: JobId, definition: ScheduleDefinition, now: DateTime<Utc>) -> Self {
        Self {
            id,
            job_type: definition.job_type,
            target_id: definition.target_id,
            run_at: definition.run_at,
            scheduled_for: definition.run_at,
            status: JobStatus::Pending,
            recurrence: definition.recurrence,
            max_retries: definition.max_retries,
            retry_count: 0,
            occurrence_count: 0,
            last_result: None,
            priority: definition.priority,
            metadata: definition.metadata,
            payload: definition.payload,
            created_at: now,
            updated_at: now,
            version: 0,
            claim: None,
            cancel_requested: false,
        }
    }

    /// Whether the job is pending and its run time has arrived.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.run_at <= now
    }

    /// Whether the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Token of the current claim.
    pub fn claim_token(&self) -> Option<&ClaimId> {
        self.claim.as_ref().map(|c| &c.token)
    }

    /// Mark the job as claimed by `worker`.
    pub fn mark_claimed(&mut self, worker: WorkerId, now: DateTime<Utc>) -> ClaimId {
        let token = ClaimId::new();
        self.status = JobStatus::Running;
        self.claim = Some(Claim {
            token: token.clone(),
            worker,
            claimed_at: now,
        });
        self.updated_at = now;
        token
    }

    /// Mark the job as canceled.
    pub fn mark_canceled(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Canceled;
        self.claim = None;
        self.cancel_requested = false;
        self.updated_at = now;
    }

    /// Release a claim without recording an attempt.
    pub fn mark_released(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Pending;
        self.claim = None;
        self.updated_at = now;
    }

    /// How long until the job is due, or `None` when it is due now.
    pub fn delay_until_due(&self, now: DateTime<Utc>) -> Option<Duration> {
        (self.run_at - now).to_std().ok().filter(|d| !d.is_zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, h, 0, 0).unwrap()
    }

    #[test]
    fn test_definition_defaults() {
        let def = ScheduleDefinition::builder(JobType::Reminder, at(9))
            .target("invoice-42")
            .build()
            .unwrap();

        assert_eq!(def.max_retries(), DEFAULT_MAX_RETRIES);
        assert_eq!(def.priority(), 0);
        assert!(!def.recurrence().is_recurring());
        assert_eq!(def.target_id(), Some("invoice-42"));
    }

    #[test]
    fn test_definition_requires_target() {
        let result = ScheduleDefinition::builder(JobType::PeriodClose, at(9)).build();
        assert_eq!(result, Err(DefinitionError::MissingTarget(JobType::PeriodClose)));

        let blank = ScheduleDefinition::builder(JobType::PeriodClose, at(9))
            .target("   ")
            .build();
        assert!(blank.is_err());
    }

    #[test]
    fn test_targetless_types_build_without_target() {
        let def = ScheduleDefinition::builder(JobType::DataCleanup, at(2)).build();
        assert!(def.is_ok());
    }

    #[test]
    fn test_definition_rejects_bad_recurrence() {
        let result = ScheduleDefinition::builder(JobType::DataCleanup, at(9))
            .recurrence(ScheduleRecurrence::daily().until(at(8)))
            .build();

        assert!(matches!(result, Err(DefinitionError::InvalidRecurrence(_))));
    }

    #[test]
    fn test_job_from_definition() {
        let def = ScheduleDefinition::builder(JobType::ReportExport, at(6))
            .target("sales-report")
            .recurrence(ScheduleRecurrence::daily())
            .priority(5)
            .payload("format", "csv")
            .metadata("requested_by", "ops")
            .build()
            .unwrap();

        let job = ScheduledJob::from_definition(JobId::new("job-1"), def, at(5));

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.occurrence_count, 0);
        assert_eq!(job.version, 0);
        assert_eq!(job.priority, 5);
        assert_eq!(job.payload["format"], "csv");
        assert_eq!(job.created_at, at(5));
        assert_eq!(job.scheduled_for, job.run_at);
        assert!(job.claim.is_none());
    }

    #[test]
    fn test_status_transitions() {
        use JobStatus::*;

        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Canceled));
        assert!(Running.can_transition_to(Pending));
        assert!(Running.can_transition_to(FailedPermanent));
        assert!(Running.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Completed));

        for terminal in [Completed, FailedPermanent, Canceled] {
            assert!(terminal.is_terminal());
            for next in JobStatus::ALL {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_claim_and_release() {
        let def = ScheduleDefinition::builder(JobType::DataCleanup, at(9))
            .build()
            .unwrap();
        let mut job = ScheduledJob::from_definition(JobId::generate(), def, at(8));

        let token = job.mark_claimed(WorkerId::new("w1"), at(9));
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.claim_token(), Some(&token));

        job.mark_released(at(10));
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.claim.is_none());
    }

    #[test]
    fn test_delay_until_due() {
        let def = ScheduleDefinition::builder(JobType::DataCleanup, at(9))
            .build()
            .unwrap();
        let job = ScheduledJob::from_definition(JobId::generate(), def, at(8));

        assert_eq!(job.delay_until_due(at(8)), Some(Duration::from_secs(3600)));
        assert_eq!(job.delay_until_due(at(9)), None);
        assert_eq!(job.delay_until_due(at(10)), None);
        assert!(job.is_due(at(9)));
        assert!(!job.is_due(at(8)));
    }

    #[test]
    fn test_result_constructors() {
        assert!(JobResult::success().success);
        assert!(JobResult::failure("boom").should_retry);

        let permanent = JobResult::permanent_failure("bad input");
        assert!(!permanent.success);
        assert!(!permanent.should_retry);
        assert_eq!(permanent.error.as_deref(), Some("bad input"));
    }

    #[test]
    fn test_job_serialization() {
        let def = ScheduleDefinition::builder(JobType::Custom("log".into()), at(9))
            .recurrence(ScheduleRecurrence::weekly())
            .build()
            .unwrap();
        let mut job = ScheduledJob::from_definition(JobId::generate(), def, at(8));
        job.last_result = Some(JobResult::failure("x").with_retry_after(Duration::from_secs(5)));

        let json = serde_json::to_string(&job).unwrap();
        let parsed: ScheduledJob = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed, job);
    }
}
