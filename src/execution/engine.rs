//! Job execution engine.
//!
//! The `ExecutionEngine` runs one attempt of a job:
//! - Claims the job with a compare-and-swap write
//! - Invokes the handler under a timeout, isolating panics
//! - Settles the result into the next state and persists it
//! - Re-dispatches jobs that return to pending

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::transition::{Settlement, settle};
use crate::core::clock::Clock;
use crate::core::job::{JobResult, JobStatus, ScheduledJob};
use crate::core::retry::RetryPolicy;
use crate::core::types::{ClaimId, JobId, JobType, WorkerId};
use crate::dispatch::{DispatchError, Dispatcher};
use crate::events::{Event, EventBus};
use crate::handlers::{HandlerRegistry, JobHandler, RegistryError};
use crate::storage::{JobStore, StorageError};

/// Default per-attempt timeout when neither config nor handler sets one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Number of times the final write is retried after losing a race with a
/// cancel request.
const MAX_COMMIT_ATTEMPTS: u32 = 5;

/// Errors that can occur while executing a job.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The job is not pending.
    #[error("job {id} is {status}, expected pending")]
    InvalidState { id: JobId, status: JobStatus },

    /// No handler is registered for the job type.
    #[error(transparent)]
    NoHandler(#[from] RegistryError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Dispatch error.
    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
}

/// What happened to an execution request.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    /// This worker ran the job and stored the result.
    Executed(ExecutionReport),
    /// Another worker holds or took over the job; nothing was stored.
    ClaimLost,
}

impl ExecutionOutcome {
    /// The handler's result, if this worker stored one.
    pub fn result(&self) -> Option<&JobResult> {
        match self {
            ExecutionOutcome::Executed(report) => Some(&report.result),
            ExecutionOutcome::ClaimLost => None,
        }
    }

    /// Whether another worker won the claim.
    pub fn is_claim_lost(&self) -> bool {
        matches!(self, ExecutionOutcome::ClaimLost)
    }
}

/// Details of a completed attempt.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    /// Result reported by the handler, or synthesized on error, panic or timeout.
    pub result: JobResult,
    /// The job as stored after the attempt.
    pub job: ScheduledJob,
    /// Branch of the state machine that was taken.
    pub settlement: Settlement,
    /// Wall time spent in the handler.
    pub duration: Duration,
}

/// Executes jobs against a store, a handler registry and a dispatcher.
pub struct ExecutionEngine<S: JobStore> {
    store: Arc<S>,
    registry: Arc<HandlerRegistry>,
    dispatcher: Arc<dyn Dispatcher>,
    clock: Arc<dyn Clock>,
    event_bus: Arc<EventBus>,
    worker_id: WorkerId,
    default_timeout: Duration,
    type_timeouts: HashMap<JobType, Duration>,
    retry_policy: RetryPolicy,
}

impl<S: JobStore + 'static> ExecutionEngine<S> {
    /// Create an engine with default timeouts and retry policy.
    pub fn new(
        store: Arc<S>,
        registry: Arc<HandlerRegistry>,
        dispatcher: Arc<dyn Dispatcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            registry,
            dispatcher,
            clock,
            event_bus: Arc::new(EventBus::new()),
            worker_id: WorkerId::generate(),
            default_timeout: DEFAULT_TIMEOUT,
            type_timeouts: HashMap::new(),
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Set the event bus.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    /// Set the identity recorded in claims.
    pub fn with_worker_id(mut self, worker_id: WorkerId) -> Self {
        self.worker_id = worker_id;
        self
    }

    /// Set the timeout used when nothing more specific applies.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Override the timeout for one job type.
    pub fn with_type_timeout(mut self, job_type: JobType, timeout: Duration) -> Self {
        self.type_timeouts.insert(job_type, timeout);
        self
    }

    /// Set the default retry delay policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Timeout for a job: per-type config, then handler, then engine default.
    fn timeout_for(&self, job_type: &JobType, handler: &dyn JobHandler) -> Duration {
        self.type_timeouts
            .get(job_type)
            .copied()
            .or_else(|| handler.timeout())
            .unwrap_or(self.default_timeout)
    }

    /// Longest time one attempt may run before it is timed out.
    pub fn longest_timeout(&self) -> Duration {
        self.registry
            .job_types()
            .into_iter()
            .filter_map(|job_type| {
                let handler = self.registry.resolve(job_type).ok()?;
                Some(self.timeout_for(job_type, handler.as_ref()))
            })
            .chain(self.type_timeouts.values().copied())
            .fold(self.default_timeout, Duration::max)
    }

    /// Run one attempt of `job`.
    ///
    /// `job` is the caller's view of the record; its `version` is what the
    /// claim is conditioned on.
    pub async fn execute(&self, job: ScheduledJob) -> Result<ExecutionOutcome, EngineError> {
        if job.status != JobStatus::Pending {
            return Err(EngineError::InvalidState {
                id: job.id,
                status: job.status,
            });
        }

        let handler = self.registry.resolve(&job.job_type)?;

        let Some((claimed, token)) = self.claim(job).await? else {
            return Ok(ExecutionOutcome::ClaimLost);
        };

        let start = Instant::now();
        let result = self.invoke(handler, &claimed).await;
        let duration = start.elapsed();

        let Some((stored, settlement)) = self.commit(claimed, &token, &result).await? else {
            return Ok(ExecutionOutcome::ClaimLost);
        };

        self.report(&stored, &settlement, &result, duration).await;

        if settlement.is_pending() {
            let delay = stored.delay_until_due(self.clock.now());
            if let Err(e) = self.dispatcher.dispatch(&stored, delay).await {
                // The due-job poll picks the job up later.
                warn!(job_id = %stored.id, error = %e, "Failed to re-dispatch job");
            }
        }

        Ok(ExecutionOutcome::Executed(ExecutionReport {
            result,
            job: stored,
            settlement,
            duration,
        }))
    }

    /// Move the job to RUNNING. Returns `None` when another writer got there first.
    async fn claim(
        &self,
        job: ScheduledJob,
    ) -> Result<Option<(ScheduledJob, ClaimId)>, EngineError> {
        let job_id = job.id.clone();
        let mut claimed = job;
        let token = claimed.mark_claimed(self.worker_id.clone(), self.clock.now());

        match self.store.save(claimed).await {
            Ok(stored) => {
                debug!(job_id = %job_id, worker = %self.worker_id, claim = %token, "Claimed job");
                self.event_bus
                    .emit(Event::job_claimed(
                        job_id,
                        self.worker_id.clone(),
                        token.clone(),
                    ))
                    .await;
                Ok(Some((stored, token)))
            }
            Err(e) if e.is_conflict() => {
                debug!(job_id = %job_id, worker = %self.worker_id, "Claim lost to another worker");
                self.event_bus
                    .emit(Event::claim_lost(job_id, self.worker_id.clone()))
                    .await;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Run the handler in its own task so panics and timeouts stay contained.
    async fn invoke(&self, handler: Arc<dyn JobHandler>, job: &ScheduledJob) -> JobResult {
        let timeout = self.timeout_for(&job.job_type, handler.as_ref());
        let retry_on_timeout = handler.retry_on_timeout();
        let task_job = job.clone();

        let mut task = tokio::spawn(async move { handler.handle(&task_job).await });

        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(Ok(result))) => result,
            Ok(Ok(Err(e))) => {
                warn!(job_id = %job.id, error = %e, "Handler returned an error");
                JobResult::permanent_failure(format!("handler error: {}", e))
            }
            Ok(Err(join_error)) if join_error.is_panic() => {
                let message = panic_message(join_error.into_panic());
                error!(job_id = %job.id, panic = %message, "Handler panicked");
                JobResult::permanent_failure(format!("handler panicked: {}", message))
            }
            Ok(Err(join_error)) => {
                JobResult::permanent_failure(format!("handler task aborted: {}", join_error))
            }
            Err(_) => {
                task.abort();
                warn!(job_id = %job.id, timeout = ?timeout, "Handler timed out");
                let mut result =
                    JobResult::failure(format!("handler timed out after {:?}", timeout));
                result.should_retry = retry_on_timeout;
                result
            }
        }
    }

    /// Persist the settled job with a CAS on the claim version.
    ///
    /// A conflict while the claim token still matches means a cancel request
    /// landed during the attempt; the fresh record is re-settled so the cancel
    /// is honoured. A mismatched token means the claim was recovered and
    /// possibly re-run elsewhere, so nothing is written.
    async fn commit(
        &self,
        claimed: ScheduledJob,
        token: &ClaimId,
        result: &JobResult,
    ) -> Result<Option<(ScheduledJob, Settlement)>, EngineError> {
        let mut current = claimed;

        for _ in 0..MAX_COMMIT_ATTEMPTS {
            let mut next = current.clone();
            let settlement = settle(&mut next, result, self.clock.now(), &self.retry_policy);

            match self.store.save(next).await {
                Ok(stored) => return Ok(Some((stored, settlement))),
                Err(e) if e.is_conflict() => match self.store.find(&current.id).await? {
                    Some(fresh)
                        if fresh.status == JobStatus::Running
                            && fresh.claim_token() == Some(token) =>
                    {
                        debug!(job_id = %fresh.id, "Job changed during attempt, re-settling");
                        current = fresh;
                    }
                    _ => break,
                },
                Err(e) => return Err(e.into()),
            }
        }

        warn!(
            job_id = %current.id,
            worker = %self.worker_id,
            "Claim was taken over before the result could be stored"
        );
        self.event_bus
            .emit(Event::claim_lost(current.id.clone(), self.worker_id.clone()))
            .await;
        Ok(None)
    }

    async fn report(
        &self,
        job: &ScheduledJob,
        settlement: &Settlement,
        result: &JobResult,
        duration: Duration,
    ) {
        let error = result.error.clone().unwrap_or_default();
        let event = match settlement {
            Settlement::Completed => {
                info!(job_id = %job.id, job_type = %job.job_type, duration = ?duration, "Job completed");
                Event::job_succeeded(job.id.clone(), duration, None)
            }
            Settlement::Recurred {
                next_run_at,
                skipped,
            } => {
                if *skipped > 0 {
                    warn!(
                        job_id = %job.id,
                        skipped = *skipped,
                        next_run_at = %next_run_at,
                        "Missed occurrences folded into one run"
                    );
                }
                info!(job_id = %job.id, next_run_at = %next_run_at, "Job succeeded, next occurrence scheduled");
                Event::job_succeeded(job.id.clone(), duration, Some(*next_run_at))
            }
            Settlement::RetryScheduled { run_at } => {
                warn!(
                    job_id = %job.id,
                    retry = job.retry_count,
                    max_retries = job.max_retries,
                    run_at = %run_at,
                    error = %error,
                    "Job failed, retry scheduled"
                );
                Event::job_retry_scheduled(
                    job.id.clone(),
                    error,
                    job.retry_count,
                    job.max_retries,
                    *run_at,
                )
            }
            Settlement::Failed => {
                error!(job_id = %job.id, job_type = %job.job_type, error = %error, "Job failed permanently");
                Event::job_failed(job.id.clone(), error)
            }
            Settlement::Canceled => {
                info!(job_id = %job.id, "Job canceled after running attempt");
                Event::job_canceled(job.id.clone(), true)
            }
        };
        self.event_bus.emit(event).await;
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
