//! Worker loop that executes due jobs.
//!
//! The worker is responsible for:
//! - Polling the store for due jobs on every tick
//! - Consuming jobs handed over through the dispatch queue
//! - Bounding concurrent executions
//! - Releasing stale claims left by crashed workers
//! - Pause, resume and graceful shutdown

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::handle::{COMMAND_CHANNEL_BUFFER, WorkerHandle};
use super::manager::ScheduleManager;
use super::types::{WorkerCommand, WorkerState};
use crate::core::job::ScheduledJob;
use crate::core::types::JobId;
use crate::dispatch::DispatchReceiver;
use crate::execution::{EngineError, ExecutionOutcome};
use crate::storage::JobStore;

/// Margin added above the longest attempt timeout when a lease is too short.
const CLAIM_LEASE_GRACE: Duration = Duration::from_secs(30);

/// Polls for due work and executes it with bounded concurrency.
pub struct Worker<S: JobStore> {
    manager: Arc<ScheduleManager<S>>,
    receiver: Option<DispatchReceiver>,
    tick_interval: Duration,
    max_concurrent_jobs: usize,
    claim_lease: Option<Duration>,
    shutdown_timeout: Duration,
}

impl<S: JobStore + 'static> Worker<S> {
    /// Create a worker with a 1s tick and 4 concurrent jobs.
    pub fn new(manager: Arc<ScheduleManager<S>>) -> Self {
        Self {
            manager,
            receiver: None,
            tick_interval: Duration::from_secs(1),
            max_concurrent_jobs: 4,
            claim_lease: None,
            shutdown_timeout: Duration::from_secs(30),
        }
    }

    /// Consume jobs from a dispatch queue in addition to polling.
    pub fn with_dispatch_receiver(mut self, receiver: DispatchReceiver) -> Self {
        self.receiver = Some(receiver);
        self
    }

    /// Set the tick interval.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Set the maximum number of jobs executing at once.
    pub fn with_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max.max(1);
        self
    }

    /// Release claims older than `lease` while running.
    ///
    /// The lease must outlast the longest attempt timeout the engine can
    /// apply; a shorter lease is raised at start so a job still executing is
    /// never handed to a second worker.
    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = Some(lease);
        self
    }

    /// Set the graceful shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Start the worker and return a handle for controlling it.
    pub fn start(mut self) -> (WorkerHandle, JoinHandle<()>) {
        self.claim_lease = self.effective_claim_lease();

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let state = Arc::new(RwLock::new(WorkerState::Running));

        let handle = WorkerHandle {
            command_tx,
            state: Arc::clone(&state),
        };

        let task = tokio::spawn(async move {
            self.run(command_rx, state).await;
        });

        (handle, task)
    }

    /// Main worker loop.
    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<WorkerCommand>,
        state: Arc<RwLock<WorkerState>>,
    ) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let permits = Arc::new(Semaphore::new(self.max_concurrent_jobs));
        let mut running: JoinSet<()> = JoinSet::new();
        let mut receiver = self.receiver.take();
        let mut last_recovery: Option<Instant> = None;

        info!(
            worker = %self.manager.engine().worker_id(),
            max_concurrent_jobs = self.max_concurrent_jobs,
            "Worker started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if *state.read().await == WorkerState::Running {
                        self.recover_if_due(&mut last_recovery).await;
                        self.poll_due(&permits, &mut running).await;
                    }
                }

                Some(job_id) = next_dispatch(&mut receiver) => {
                    if *state.read().await == WorkerState::Running {
                        self.start_dispatched(job_id, &permits, &mut running).await;
                    }
                }

                Some(joined) = running.join_next(), if !running.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "Execution task ended abnormally");
                    }
                }

                Some(command) = command_rx.recv() => {
                    match command {
                        WorkerCommand::Pause { response } => {
                            *state.write().await = WorkerState::Paused;
                            info!("Worker paused");
                            let _ = response.send(());
                        }
                        WorkerCommand::Resume { response } => {
                            *state.write().await = WorkerState::Running;
                            info!("Worker resumed");
                            let _ = response.send(());
                        }
                        WorkerCommand::Shutdown { response } => {
                            *state.write().await = WorkerState::Stopped;
                            self.drain(&mut running).await;
                            let _ = response.send(());
                            break;
                        }
                    }
                }
            }
        }

        info!(worker = %self.manager.engine().worker_id(), "Worker stopped");
    }

    /// Configured lease, raised above the longest attempt timeout if needed.
    fn effective_claim_lease(&self) -> Option<Duration> {
        let lease = self.claim_lease?;
        let longest = self.manager.engine().longest_timeout();
        if lease > longest {
            return Some(lease);
        }

        let raised = longest + CLAIM_LEASE_GRACE;
        warn!(
            lease = ?lease,
            longest_timeout = ?longest,
            raised = ?raised,
            "Claim lease does not outlast the longest job timeout, raising it"
        );
        Some(raised)
    }

    async fn recover_if_due(&self, last_recovery: &mut Option<Instant>) {
        let Some(lease) = self.claim_lease else {
            return;
        };
        if last_recovery.is_some_and(|at| at.elapsed() < lease / 2) {
            return;
        }
        *last_recovery = Some(Instant::now());

        match self.manager.recover_stale_claims(lease).await {
            Ok(recovered) if !recovered.is_empty() => {
                info!(count = recovered.len(), "Recovered stale claims");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to recover stale claims"),
        }
    }

    async fn poll_due(&self, permits: &Arc<Semaphore>, running: &mut JoinSet<()>) {
        if permits.available_permits() == 0 {
            return;
        }

        let due = match self.manager.get_due_jobs().await {
            Ok(due) => due,
            Err(e) => {
                warn!(error = %e, "Failed to query due jobs");
                return;
            }
        };

        for job in due {
            let Ok(permit) = Arc::clone(permits).try_acquire_owned() else {
                debug!("Concurrency limit reached, deferring remaining due jobs");
                break;
            };
            self.spawn_execution(job, permit, running);
        }
    }

    async fn start_dispatched(
        &self,
        job_id: JobId,
        permits: &Arc<Semaphore>,
        running: &mut JoinSet<()>,
    ) {
        let job = match self.manager.get_job(&job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                debug!(job_id = %job_id, "Dispatched job no longer exists");
                return;
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Failed to load dispatched job");
                return;
            }
        };

        // Rescheduled or already handled since it was dispatched.
        if !job.is_due(self.manager.clock().now()) {
            return;
        }

        let Ok(permit) = Arc::clone(permits).try_acquire_owned() else {
            debug!(job_id = %job_id, "Concurrency limit reached, leaving job to the poll");
            return;
        };
        self.spawn_execution(job, permit, running);
    }

    fn spawn_execution(
        &self,
        job: ScheduledJob,
        permit: OwnedSemaphorePermit,
        running: &mut JoinSet<()>,
    ) {
        let engine = Arc::clone(self.manager.engine());
        running.spawn(async move {
            let _permit = permit;
            let job_id = job.id.clone();
            match engine.execute(job).await {
                Ok(ExecutionOutcome::Executed(report)) => {
                    debug!(job_id = %job_id, status = %report.job.status, "Attempt finished");
                }
                Ok(ExecutionOutcome::ClaimLost) => {
                    debug!(job_id = %job_id, "Job claimed by another worker");
                }
                Err(EngineError::InvalidState { status, .. }) => {
                    debug!(job_id = %job_id, status = %status, "Job no longer pending");
                }
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Failed to execute job");
                }
            }
        });
    }

    /// Wait for running executions, aborting them after the shutdown timeout.
    async fn drain(&self, running: &mut JoinSet<()>) {
        if running.is_empty() {
            info!("No running jobs to wait for during shutdown");
            return;
        }

        info!(
            running = running.len(),
            timeout = ?self.shutdown_timeout,
            "Graceful shutdown: waiting for running jobs"
        );

        let drained = tokio::time::timeout(self.shutdown_timeout, async {
            while running.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = running.len(),
                "Graceful shutdown timeout exceeded, aborting running jobs"
            );
            running.abort_all();
        }
    }
}

async fn next_dispatch(receiver: &mut Option<DispatchReceiver>) -> Option<JobId> {
    match receiver {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
