//! Next-state computation after an attempt.
//!
//! [`settle`] is pure: it rewrites a claimed job from the handler's result and
//! the current time, and reports which branch of the state machine was taken.
//! The engine persists the rewritten job.

use chrono::{DateTime, Utc};

use crate::core::job::{JobResult, JobStatus, ScheduledJob};
use crate::core::recurrence::{RecurrenceEngine, RecurrenceError};
use crate::core::retry::RetryPolicy;

/// Branch taken by [`settle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// Ran for the last time.
    Completed,
    /// Recurring job moved to its next occurrence.
    Recurred {
        next_run_at: DateTime<Utc>,
        /// Missed occurrences folded into this one.
        skipped: u32,
    },
    /// Failed attempt queued for another try.
    RetryScheduled { run_at: DateTime<Utc> },
    /// Failed with no retry left or a non-retryable error.
    Failed,
    /// Would have returned to pending, but a cancel arrived while running.
    Canceled,
}

impl Settlement {
    /// Whether the job goes back to the queue.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            Settlement::Recurred { .. } | Settlement::RetryScheduled { .. }
        )
    }
}

/// Apply an attempt's result to a claimed job.
///
/// Releases the claim, records `result` as the last result and sets the new
/// status, `run_at` and counters.
pub fn settle(
    job: &mut ScheduledJob,
    result: &JobResult,
    now: DateTime<Utc>,
    retry_policy: &RetryPolicy,
) -> Settlement {
    job.claim = None;
    job.last_result = Some(result.clone());
    job.updated_at = now;

    let settlement = if result.success {
        settle_success(job, now)
    } else {
        settle_failure(job, result, now, retry_policy)
    };

    if settlement.is_pending() && job.cancel_requested {
        job.mark_canceled(now);
        return Settlement::Canceled;
    }
    if job.is_terminal() {
        job.cancel_requested = false;
    }
    settlement
}

fn settle_success(job: &mut ScheduledJob, now: DateTime<Utc>) -> Settlement {
    if !job.recurrence.is_recurring() {
        job.status = JobStatus::Completed;
        return Settlement::Completed;
    }

    let completed = job.occurrence_count.saturating_add(1);
    match RecurrenceEngine::advance(&job.recurrence, job.scheduled_for, now, completed) {
        Ok(next) => {
            job.occurrence_count = completed;
            job.retry_count = 0;
            job.run_at = next.run_at;
            job.scheduled_for = next.run_at;
            job.status = JobStatus::Pending;
            Settlement::Recurred {
                next_run_at: next.run_at,
                skipped: next.skipped,
            }
        }
        Err(RecurrenceError::Exhausted | RecurrenceError::NotRecurring) => {
            job.occurrence_count = completed;
            job.status = JobStatus::Completed;
            Settlement::Completed
        }
        Err(e) => {
            tracing::warn!(job_id = %job.id, error = %e, "Cannot compute next occurrence, completing job");
            job.occurrence_count = completed;
            job.status = JobStatus::Completed;
            Settlement::Completed
        }
    }
}

fn settle_failure(
    job: &mut ScheduledJob,
    result: &JobResult,
    now: DateTime<Utc>,
    retry_policy: &RetryPolicy,
) -> Settlement {
    if !result.should_retry || job.retry_count >= job.max_retries {
        job.status = JobStatus::FailedPermanent;
        return Settlement::Failed;
    }

    let delay = result
        .retry_after
        .unwrap_or_else(|| retry_policy.delay_for(job.retry_count));
    let run_at = chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(now);

    job.retry_count += 1;
    job.run_at = run_at;
    job.status = JobStatus::Pending;
    Settlement::RetryScheduled { run_at }
}
