//! Public entry point for scheduling work.
//!
//! The `ScheduleManager` is responsible for:
//! - Persisting new jobs and dispatching the ones already due
//! - Executing a job on demand
//! - Canceling and rescheduling pending jobs
//! - Listing due jobs
//! - Releasing claims left behind by crashed workers

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::types::SchedulerError;
use crate::core::clock::Clock;
use crate::core::job::{JobStatus, ScheduleDefinition, ScheduledJob};
use crate::core::types::JobId;
use crate::dispatch::Dispatcher;
use crate::events::{Event, EventBus};
use crate::execution::{ExecutionEngine, ExecutionOutcome};
use crate::storage::JobStore;

/// Default number of jobs returned by [`ScheduleManager::get_due_jobs`].
pub const DEFAULT_DUE_BATCH_SIZE: usize = 100;

/// Façade over the job store, the execution engine and the dispatcher.
pub struct ScheduleManager<S: JobStore> {
    store: Arc<S>,
    engine: Arc<ExecutionEngine<S>>,
    dispatcher: Arc<dyn Dispatcher>,
    clock: Arc<dyn Clock>,
    event_bus: Arc<EventBus>,
    due_batch_size: usize,
}

impl<S: JobStore + 'static> ScheduleManager<S> {
    /// Create a manager sharing the engine's event bus.
    pub fn new(
        store: Arc<S>,
        engine: Arc<ExecutionEngine<S>>,
        dispatcher: Arc<dyn Dispatcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let event_bus = Arc::clone(engine.event_bus());
        Self {
            store,
            engine,
            dispatcher,
            clock,
            event_bus,
            due_batch_size: DEFAULT_DUE_BATCH_SIZE,
        }
    }

    /// Set the maximum number of jobs returned per due query.
    pub fn with_due_batch_size(mut self, size: usize) -> Self {
        self.due_batch_size = size.max(1);
        self
    }

    pub fn engine(&self) -> &Arc<ExecutionEngine<S>> {
        &self.engine
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Persist a new job. Jobs that are already due are dispatched at once.
    pub async fn schedule(
        &self,
        definition: ScheduleDefinition,
    ) -> Result<ScheduledJob, SchedulerError> {
        let now = self.clock.now();
        let job = ScheduledJob::from_definition(JobId::generate(), definition, now);
        let job = self.store.insert(job).await?;

        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            run_at = %job.run_at,
            recurrence = %job.recurrence,
            "Scheduled job"
        );
        self.event_bus
            .emit(Event::job_scheduled(
                job.id.clone(),
                job.job_type.clone(),
                job.run_at,
            ))
            .await;

        if job.run_at <= now {
            self.dispatcher.dispatch(&job, None).await?;
        }

        Ok(job)
    }

    /// Execute a pending job now, regardless of its `run_at`.
    pub async fn execute_job(&self, id: &JobId) -> Result<ExecutionOutcome, SchedulerError> {
        let job = self
            .store
            .find(id)
            .await?
            .ok_or_else(|| SchedulerError::NotFound(id.clone()))?;

        Ok(self.engine.execute(job).await?)
    }

    /// Cancel a job.
    ///
    /// Returns `false` when the job is missing, already terminal, or changed
    /// concurrently. A running job is flagged and canceled once its attempt
    /// ends, unless the attempt itself ends the job.
    pub async fn cancel_job(&self, id: &JobId) -> Result<bool, SchedulerError> {
        let Some(mut job) = self.store.find(id).await? else {
            return Ok(false);
        };
        let now = self.clock.now();

        let deferred = match job.status {
            JobStatus::Pending => {
                job.mark_canceled(now);
                false
            }
            JobStatus::Running => {
                if job.cancel_requested {
                    return Ok(true);
                }
                job.cancel_requested = true;
                job.updated_at = now;
                true
            }
            _ => return Ok(false),
        };

        match self.store.save(job).await {
            Ok(_) if deferred => {
                info!(job_id = %id, "Cancel requested for running job");
                Ok(true)
            }
            Ok(_) => {
                info!(job_id = %id, "Canceled job");
                self.event_bus
                    .emit(Event::job_canceled(id.clone(), false))
                    .await;
                Ok(true)
            }
            Err(e) if e.is_conflict() => {
                warn!(job_id = %id, "Job changed while canceling, cancel not applied");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Move a pending job to a new run time.
    pub async fn reschedule_job(
        &self,
        id: &JobId,
        new_run_at: DateTime<Utc>,
    ) -> Result<ScheduledJob, SchedulerError> {
        let mut job = self
            .store
            .find(id)
            .await?
            .ok_or_else(|| SchedulerError::NotFound(id.clone()))?;

        if job.status != JobStatus::Pending {
            return Err(SchedulerError::InvalidState {
                id: job.id,
                status: job.status,
            });
        }

        let now = self.clock.now();
        job.run_at = new_run_at;
        job.scheduled_for = new_run_at;
        job.updated_at = now;
        let job = self.store.save(job).await?;

        info!(job_id = %id, run_at = %new_run_at, "Rescheduled job");
        self.event_bus
            .emit(Event::job_rescheduled(id.clone(), new_run_at))
            .await;
        self.dispatcher
            .dispatch(&job, job.delay_until_due(now))
            .await?;

        Ok(job)
    }

    /// Pending jobs whose run time has arrived.
    pub async fn get_due_jobs(&self) -> Result<Vec<ScheduledJob>, SchedulerError> {
        Ok(self
            .store
            .find_due(self.clock.now(), self.due_batch_size)
            .await?)
    }

    /// Look a job up by id.
    pub async fn get_job(&self, id: &JobId) -> Result<Option<ScheduledJob>, SchedulerError> {
        Ok(self.store.find(id).await?)
    }

    /// Release claims older than `lease` back to pending.
    ///
    /// Covers workers that died mid-attempt. A released job that had a cancel
    /// request is canceled instead. Returns the ids of released jobs.
    pub async fn recover_stale_claims(&self, lease: Duration) -> Result<Vec<JobId>, SchedulerError> {
        let now = self.clock.now();
        let lease = chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX);
        let running = self.store.find_by_status(JobStatus::Running).await?;
        let mut recovered = Vec::new();

        for mut job in running {
            let Some(claim) = job.claim.clone() else {
                continue;
            };
            let expired = claim
                .claimed_at
                .checked_add_signed(lease)
                .is_some_and(|deadline| deadline <= now);
            if !expired {
                continue;
            }

            if job.cancel_requested {
                job.mark_canceled(now);
            } else {
                job.mark_released(now);
            }

            match self.store.save(job).await {
                Ok(saved) => {
                    warn!(
                        job_id = %saved.id,
                        worker = %claim.worker,
                        claimed_at = %claim.claimed_at,
                        "Released stale claim"
                    );
                    self.event_bus
                        .emit(Event::claim_recovered(saved.id.clone(), claim.worker))
                        .await;
                    if saved.status == JobStatus::Pending {
                        self.dispatcher
                            .dispatch(&saved, saved.delay_until_due(now))
                            .await?;
                    } else {
                        self.event_bus
                            .emit(Event::job_canceled(saved.id.clone(), true))
                            .await;
                    }
                    recovered.push(saved.id);
                }
                Err(e) if e.is_conflict() => {
                    debug!(error = %e, "Claim settled while recovering, skipping");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(recovered)
    }
}
