//! Scheduler type definitions.
//!
//! This module contains error types, state enums, and command types for the
//! schedule manager and the worker loop.

use thiserror::Error;
use tokio::sync::oneshot;

use crate::core::job::JobStatus;
use crate::core::types::{JobId, JobType};
use crate::dispatch::DispatchError;
use crate::execution::EngineError;
use crate::handlers::RegistryError;
use crate::storage::StorageError;

/// Errors that can occur in the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Job not found.
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// The operation is not allowed in the job's current status.
    #[error("job {id} is {status}, expected pending")]
    InvalidState { id: JobId, status: JobStatus },

    /// No handler is registered for the job type.
    #[error("no handler registered for job type {0}")]
    NoHandler(JobType),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Dispatch error.
    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Channel error.
    #[error("channel error: {0}")]
    ChannelError(String),
}

impl From<EngineError> for SchedulerError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::InvalidState { id, status } => SchedulerError::InvalidState { id, status },
            EngineError::NoHandler(
                RegistryError::NoHandlerForType(job_type)
                | RegistryError::DuplicateHandler(job_type)
                | RegistryError::UnsupportedType(job_type),
            ) => SchedulerError::NoHandler(job_type),
            EngineError::Storage(e) => SchedulerError::Storage(e),
            EngineError::Dispatch(e) => SchedulerError::Dispatch(e),
        }
    }
}

/// State of a worker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Worker is stopped.
    Stopped,
    /// Worker is polling and executing jobs.
    Running,
    /// Worker is alive but does not start new jobs.
    Paused,
}

/// Commands that can be sent to the worker.
pub(crate) enum WorkerCommand {
    /// Stop starting new jobs.
    Pause { response: oneshot::Sender<()> },
    /// Resume after a pause.
    Resume { response: oneshot::Sender<()> },
    /// Drain running jobs and stop.
    Shutdown { response: oneshot::Sender<()> },
}
