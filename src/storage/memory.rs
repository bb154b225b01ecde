//! In-memory job store.
//!
//! Provides a thread-safe in-memory backend for testing and development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

use super::{JobStore, StorageError, check_transition, due_order};
use crate::core::job::{JobStatus, ScheduledJob};
use crate::core::types::JobId;

/// In-memory job store.
///
/// Thread-safe storage using RwLock for concurrent access. The version check
/// and the write happen under one write lock, so `save` is a true CAS.
/// Data is not persisted across restarts.
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, ScheduledJob>>,
}

impl InMemoryJobStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
        }
    }

    /// Number of stored jobs.
    pub fn len(&self) -> Result<usize, StorageError> {
        let jobs = self.jobs.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(jobs.len())
    }

    /// Whether the store holds no jobs.
    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, mut job: ScheduledJob) -> Result<ScheduledJob, StorageError> {
        let mut jobs = self.jobs.write().map_err(|_| StorageError::LockPoisoned)?;
        if jobs.contains_key(&job.id) {
            return Err(StorageError::DuplicateKey(format!("job: {}", job.id)));
        }
        job.version = 1;
        jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    async fn find(&self, id: &JobId) -> Result<Option<ScheduledJob>, StorageError> {
        let jobs = self.jobs.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(jobs.get(id).cloned())
    }

    async fn find_due(
        &self,
        as_of: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledJob>, StorageError> {
        let jobs = self.jobs.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut due: Vec<_> = jobs.values().filter(|j| j.is_due(as_of)).cloned().collect();
        due.sort_by(due_order);
        due.truncate(limit);
        Ok(due)
    }

    async fn find_by_status(&self, status: JobStatus) -> Result<Vec<ScheduledJob>, StorageError> {
        let jobs = self.jobs.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect();
        result.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(result)
    }

    async fn save(&self, mut job: ScheduledJob) -> Result<ScheduledJob, StorageError> {
        let mut jobs = self.jobs.write().map_err(|_| StorageError::LockPoisoned)?;
        let stored = jobs
            .get_mut(&job.id)
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", job.id)))?;

        if stored.version != job.version {
            return Err(StorageError::VersionConflict {
                id: job.id,
                expected: job.version,
            });
        }
        check_transition(stored, &job)?;

        job.version += 1;
        *stored = job.clone();
        Ok(job)
    }

    async fn delete(&self, id: &JobId) -> Result<bool, StorageError> {
        let mut jobs = self.jobs.write().map_err(|_| StorageError::LockPoisoned)?;
        Ok(jobs.remove(id).is_some())
    }
}
