//! Lifecycle events and event handling.
//!
//! The manager and the execution engine report every state change of a job
//! through an [`EventBus`], enabling observability without touching the store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::core::types::{ClaimId, JobId, JobType, WorkerId};

/// Lifecycle events emitted by the scheduler.
#[derive(Debug, Clone)]
pub enum Event {
    /// A new job was persisted.
    JobScheduled {
        job_id: JobId,
        job_type: JobType,
        run_at: DateTime<Utc>,
        timestamp: Instant,
    },

    /// A worker claimed a job.
    JobClaimed {
        job_id: JobId,
        worker: WorkerId,
        claim: ClaimId,
        timestamp: Instant,
    },

    /// A worker lost the race for a job.
    ClaimLost {
        job_id: JobId,
        worker: WorkerId,
        timestamp: Instant,
    },

    /// An attempt succeeded.
    JobSucceeded {
        job_id: JobId,
        duration: Duration,
        /// Next occurrence for recurring jobs.
        next_run_at: Option<DateTime<Utc>>,
        timestamp: Instant,
    },

    /// An attempt failed and will be retried.
    JobRetryScheduled {
        job_id: JobId,
        error: String,
        /// Retries consumed, including the one just scheduled.
        retry_count: u32,
        max_retries: u32,
        run_at: DateTime<Utc>,
        timestamp: Instant,
    },

    /// An attempt failed and the job will not run again.
    JobFailed {
        job_id: JobId,
        error: String,
        timestamp: Instant,
    },

    /// A job was canceled.
    JobCanceled {
        job_id: JobId,
        /// True when the cancel was applied after a running attempt ended.
        deferred: bool,
        timestamp: Instant,
    },

    /// A pending job was moved to a new run time.
    JobRescheduled {
        job_id: JobId,
        run_at: DateTime<Utc>,
        timestamp: Instant,
    },

    /// A stale claim was released back to pending.
    ClaimRecovered {
        job_id: JobId,
        worker: WorkerId,
        timestamp: Instant,
    },
}

impl Event {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> Instant {
        match self {
            Event::JobScheduled { timestamp, .. }
            | Event::JobClaimed { timestamp, .. }
            | Event::ClaimLost { timestamp, .. }
            | Event::JobSucceeded { timestamp, .. }
            | Event::JobRetryScheduled { timestamp, .. }
            | Event::JobFailed { timestamp, .. }
            | Event::JobCanceled { timestamp, .. }
            | Event::JobRescheduled { timestamp, .. }
            | Event::ClaimRecovered { timestamp, .. } => *timestamp,
        }
    }

    /// The job the event is about.
    pub fn job_id(&self) -> &JobId {
        match self {
            Event::JobScheduled { job_id, .. }
            | Event::JobClaimed { job_id, .. }
            | Event::ClaimLost { job_id, .. }
            | Event::JobSucceeded { job_id, .. }
            | Event::JobRetryScheduled { job_id, .. }
            | Event::JobFailed { job_id, .. }
            | Event::JobCanceled { job_id, .. }
            | Event::JobRescheduled { job_id, .. }
            | Event::ClaimRecovered { job_id, .. } => job_id,
        }
    }

    /// Create a JobScheduled event.
    pub fn job_scheduled(job_id: JobId, job_type: JobType, run_at: DateTime<Utc>) -> Self {
        Event::JobScheduled {
            job_id,
            job_type,
            run_at,
            timestamp: Instant::now(),
        }
    }

    /// Create a JobClaimed event.
    pub fn job_claimed(job_id: JobId, worker: WorkerId, claim: ClaimId) -> Self {
        Event::JobClaimed {
            job_id,
            worker,
            claim,
            timestamp: Instant::now(),
        }
    }

    /// Create a ClaimLost event.
    pub fn claim_lost(job_id: JobId, worker: WorkerId) -> Self {
        Event::ClaimLost {
            job_id,
            worker,
            timestamp: Instant::now(),
        }
    }

    /// Create a JobSucceeded event.
    pub fn job_succeeded(
        job_id: JobId,
        duration: Duration,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Self {
        Event::JobSucceeded {
            job_id,
            duration,
            next_run_at,
            timestamp: Instant::now(),
        }
    }

    /// Create a JobRetryScheduled event.
    pub fn job_retry_scheduled(
        job_id: JobId,
        error: String,
        retry_count: u32,
        max_retries: u32,
        run_at: DateTime<Utc>,
    ) -> Self {
        Event::JobRetryScheduled {
            job_id,
            error,
            retry_count,
            max_retries,
            run_at,
            timestamp: Instant::now(),
        }
    }

    /// Create a JobFailed event.
    pub fn job_failed(job_id: JobId, error: String) -> Self {
        Event::JobFailed {
            job_id,
            error,
            timestamp: Instant::now(),
        }
    }

    /// Create a JobCanceled event.
    pub fn job_canceled(job_id: JobId, deferred: bool) -> Self {
        Event::JobCanceled {
            job_id,
            deferred,
            timestamp: Instant::now(),
        }
    }

    /// Create a JobRescheduled event.
    pub fn job_rescheduled(job_id: JobId, run_at: DateTime<Utc>) -> Self {
        Event::JobRescheduled {
            job_id,
            run_at,
            timestamp: Instant::now(),
        }
    }

    /// Create a ClaimRecovered event.
    pub fn claim_recovered(job_id: JobId, worker: WorkerId) -> Self {
        Event::ClaimRecovered {
            job_id,
            worker,
            timestamp: Instant::now(),
        }
    }
}

/// Handler for receiving lifecycle events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: &Event);
}

/// Event bus for distributing events to registered handlers.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    /// Create a new event bus with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register an event handler.
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.push(handler);
    }

    /// Emit an event to all registered handlers.
    pub async fn emit(&self, event: Event) {
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            handler.handle(&event).await;
        }
    }

    /// Get the number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
