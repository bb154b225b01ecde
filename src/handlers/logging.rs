//! Handler that only logs the job it receives.

use async_trait::async_trait;
use tracing::info;

use super::{HandlerError, JobHandler};
use crate::core::job::{JobResult, ScheduledJob};
use crate::core::types::JobType;

/// Logs each job and succeeds. Used by the CLI to demonstrate the worker loop.
#[derive(Debug, Clone)]
pub struct LogHandler {
    job_type: JobType,
}

impl LogHandler {
    /// Handler for `custom:log` jobs.
    pub fn new() -> Self {
        Self::for_type(JobType::Custom("log".to_string()))
    }

    /// Handler for an arbitrary job type.
    pub fn for_type(job_type: JobType) -> Self {
        Self { job_type }
    }

    pub fn job_type(&self) -> &JobType {
        &self.job_type
    }
}

impl Default for LogHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobHandler for LogHandler {
    fn supports(&self, job_type: &JobType) -> bool {
        *job_type == self.job_type
    }

    async fn handle(&self, job: &ScheduledJob) -> Result<JobResult, HandlerError> {
        let message = job
            .payload
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("(no message)");
        info!(
            job_id = %job.id,
            occurrence = job.occurrence_count + 1,
            "{}", message
        );
        Ok(JobResult::success().with_output(message))
    }
}
