//! Storage abstraction for persisting scheduled jobs.
//!
//! This module provides a trait-based job store with pluggable backends
//! (in-memory, SQLite). Every write after the initial insert is a
//! compare-and-swap on the job's `version`, which is how concurrent workers
//! agree on who holds a claim.

mod memory;
#[cfg(any(feature = "sqlite", test))]
mod sqlite;

pub use memory::InMemoryJobStore;
#[cfg(any(feature = "sqlite", test))]
pub use sqlite::SqliteJobStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use thiserror::Error;

use crate::core::job::{JobStatus, ScheduledJob};
use crate::core::types::JobId;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested item was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A duplicate key was detected.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// The stored version moved on since the job was read.
    #[error("version conflict on job {id}: expected {expected}")]
    VersionConflict {
        /// Job being written.
        id: JobId,
        /// Version the writer read.
        expected: u64,
    },

    /// The write would move the job along an edge the state machine lacks.
    #[error("invalid transition on job {id}: {from} -> {to}")]
    InvalidTransition {
        /// Job being written.
        id: JobId,
        /// Stored status.
        from: JobStatus,
        /// Status carried by the write.
        to: JobStatus,
    },

    /// Storage lock was poisoned.
    #[error("storage lock poisoned")]
    LockPoisoned,

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Generic storage error.
    #[error("storage error: {0}")]
    Other(String),
}

impl StorageError {
    /// Whether this error is a lost compare-and-swap.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::VersionConflict { .. })
    }
}

/// Durable job storage.
///
/// Implementations must make `save` atomic with respect to other `save`
/// calls on the same job and must never hold a lock across calls.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job. The stored copy starts at version 1 and is returned.
    async fn insert(&self, job: ScheduledJob) -> Result<ScheduledJob, StorageError>;

    /// Load a job by id.
    async fn find(&self, id: &JobId) -> Result<Option<ScheduledJob>, StorageError>;

    /// Pending jobs with `run_at <= as_of`, highest priority first, then
    /// earliest `run_at`, then id.
    async fn find_due(
        &self,
        as_of: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledJob>, StorageError>;

    /// All jobs in the given status.
    async fn find_by_status(&self, status: JobStatus) -> Result<Vec<ScheduledJob>, StorageError>;

    /// Write `job` if the stored version still equals `job.version`.
    ///
    /// On success the stored version is bumped and the written copy returned.
    /// Otherwise returns [`StorageError::VersionConflict`]. A write whose
    /// status is not reachable from the stored status is rejected with
    /// [`StorageError::InvalidTransition`].
    async fn save(&self, job: ScheduledJob) -> Result<ScheduledJob, StorageError>;

    /// Remove a job. Returns whether it existed.
    async fn delete(&self, id: &JobId) -> Result<bool, StorageError>;
}

/// Reject a write that skips the job state machine.
pub(crate) fn check_transition(
    stored: &ScheduledJob,
    incoming: &ScheduledJob,
) -> Result<(), StorageError> {
    if stored.status.can_transition_to(incoming.status) {
        Ok(())
    } else {
        Err(StorageError::InvalidTransition {
            id: incoming.id.clone(),
            from: stored.status,
            to: incoming.status,
        })
    }
}

/// Ordering used by due-job queries.
pub(crate) fn due_order(a: &ScheduledJob, b: &ScheduledJob) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.run_at.cmp(&b.run_at))
        .then_with(|| a.id.cmp(&b.id))
}
