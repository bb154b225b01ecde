//! Job handlers and the registry that routes jobs to them.
//!
//! Domain packages implement [`JobHandler`] for the job types they own and
//! register an instance in the [`HandlerRegistry`] at startup.

mod logging;
mod registry;

pub use logging::LogHandler;
pub use registry::{HandlerRegistry, RegistryError};

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::core::job::{JobResult, ScheduledJob};
use crate::core::types::JobType;

/// Errors a handler can raise instead of returning a [`JobResult`].
///
/// The engine turns every handler error into a non-retryable failure. A
/// handler that wants a retry returns `Ok(JobResult::failure(..))` instead.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The job payload is missing data or malformed.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The target entity could not be processed.
    #[error("handler failed: {0}")]
    Failed(String),

    /// Generic error wrapper.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Domain logic executed for a job.
///
/// Handlers must be idempotent: a job can run more than once when a worker
/// dies after the handler finished but before the result was stored.
///
/// # Example
///
/// ```
/// use async_trait::async_trait;
/// use kairos::{HandlerError, JobHandler, JobResult, JobType, ScheduledJob};
///
/// struct ReminderSender;
///
/// #[async_trait]
/// impl JobHandler for ReminderSender {
///     fn supports(&self, job_type: &JobType) -> bool {
///         *job_type == JobType::Reminder
///     }
///
///     async fn handle(&self, job: &ScheduledJob) -> Result<JobResult, HandlerError> {
///         let target = job
///             .target_id
///             .as_deref()
///             .ok_or_else(|| HandlerError::InvalidPayload("missing target".into()))?;
///         Ok(JobResult::success().with_output(format!("reminded {}", target)))
///     }
/// }
/// ```
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Whether this handler can execute jobs of `job_type`.
    fn supports(&self, job_type: &JobType) -> bool;

    /// Execute one attempt of the job.
    async fn handle(&self, job: &ScheduledJob) -> Result<JobResult, HandlerError>;

    /// Per-handler timeout, overriding the engine default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Whether a timed-out attempt may be retried.
    fn retry_on_timeout(&self) -> bool {
        true
    }
}
