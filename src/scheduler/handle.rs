//! Handle for controlling a running worker.
//!
//! This module provides the `WorkerHandle` type that allows external control
//! of the worker loop through pause, resume, and shutdown commands.

use std::sync::Arc;

use tokio::sync::{RwLock, mpsc, oneshot};

use super::types::{SchedulerError, WorkerCommand, WorkerState};

/// Buffer size for the command channel between WorkerHandle and Worker.
pub(crate) const COMMAND_CHANNEL_BUFFER: usize = 32;

/// Handle for controlling a worker.
#[derive(Clone)]
pub struct WorkerHandle {
    pub(crate) command_tx: mpsc::Sender<WorkerCommand>,
    pub(crate) state: Arc<RwLock<WorkerState>>,
}

impl WorkerHandle {
    /// Send a command and wait for the worker to acknowledge it.
    async fn send_command(
        &self,
        build_command: impl FnOnce(oneshot::Sender<()>) -> WorkerCommand,
        operation: &str,
    ) -> Result<(), SchedulerError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(build_command(response_tx))
            .await
            .map_err(|_| {
                SchedulerError::ChannelError(format!("failed to send {} command", operation))
            })?;

        response_rx.await.map_err(|_| {
            SchedulerError::ChannelError(format!("failed to receive {} response", operation))
        })
    }

    /// Pause the worker.
    ///
    /// Running attempts finish; no new jobs are started until resumed.
    pub async fn pause(&self) -> Result<(), SchedulerError> {
        self.send_command(|response| WorkerCommand::Pause { response }, "pause")
            .await
    }

    /// Resume the worker after being paused.
    pub async fn resume(&self) -> Result<(), SchedulerError> {
        self.send_command(|response| WorkerCommand::Resume { response }, "resume")
            .await
    }

    /// Shut the worker down after draining running attempts.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        self.send_command(|response| WorkerCommand::Shutdown { response }, "shutdown")
            .await
    }

    /// Get the current worker state.
    pub async fn state(&self) -> WorkerState {
        *self.state.read().await
    }

    /// Check if the worker is running.
    pub async fn is_running(&self) -> bool {
        *self.state.read().await == WorkerState::Running
    }

    /// Check if the worker is paused.
    pub async fn is_paused(&self) -> bool {
        *self.state.read().await == WorkerState::Paused
    }
}
