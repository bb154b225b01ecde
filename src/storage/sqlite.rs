//! SQLite job store.
//!
//! Provides persistent storage using SQLite database. Each job is kept as a
//! JSON document next to the indexed columns needed for due-job queries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

use super::{JobStore, StorageError, check_transition};
use crate::core::job::{JobStatus, ScheduledJob};
use crate::core::types::JobId;

/// SQLite job store.
///
/// Provides persistent storage with automatic schema migration.
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Open (or create) the database at `path` and run migrations.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path_str = path.as_ref().to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path_str))
            .map_err(|e| StorageError::Other(e.to_string()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create an in-memory SQLite database (useful for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StorageError> {
        let schema = include_str!("../../migrations/001_initial_schema.sql");
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(format!("migration failed: {}", e)))?;
        Ok(())
    }

    /// Close the database connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn to_db_version(version: u64) -> Result<i64, StorageError> {
    i64::try_from(version).map_err(|_| StorageError::Other(format!("version overflow: {}", version)))
}

/// Split a timestamp into whole seconds and nanoseconds so due filtering
/// compares at full precision.
fn time_key(at: DateTime<Utc>) -> (i64, i64) {
    (at.timestamp(), i64::from(at.timestamp_subsec_nanos()))
}

fn encode(job: &ScheduledJob) -> Result<String, StorageError> {
    serde_json::to_string(job).map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn decode(body: &str, version: i64) -> Result<ScheduledJob, StorageError> {
    let mut job: ScheduledJob =
        serde_json::from_str(body).map_err(|e| StorageError::SerializationError(e.to_string()))?;
    job.version = u64::try_from(version)
        .map_err(|_| StorageError::SerializationError(format!("negative version: {}", version)))?;
    Ok(job)
}

fn decode_rows(rows: Vec<(String, i64)>) -> Result<Vec<ScheduledJob>, StorageError> {
    rows.iter().map(|(body, version)| decode(body, *version)).collect()
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn insert(&self, mut job: ScheduledJob) -> Result<ScheduledJob, StorageError> {
        job.version = 1;
        let (run_at_s, run_at_ns) = time_key(job.run_at);
        let result = sqlx::query(
            r#"
            INSERT INTO scheduled_jobs
                (id, job_type, status, run_at_s, run_at_ns, priority, version, body)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.id.as_str())
        .bind(job.job_type.to_string())
        .bind(job.status.as_str())
        .bind(run_at_s)
        .bind(run_at_ns)
        .bind(job.priority)
        .bind(to_db_version(job.version)?)
        .bind(encode(&job)?)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(job),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StorageError::DuplicateKey(format!("job: {}", job.id)))
            }
            Err(e) => Err(StorageError::Other(e.to_string())),
        }
    }

    async fn find(&self, id: &JobId) -> Result<Option<ScheduledJob>, StorageError> {
        let row: Option<(String, i64)> =
            sqlx::query_as("SELECT body, version FROM scheduled_jobs WHERE id = ?")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StorageError::Other(e.to_string()))?;

        row.map(|(body, version)| decode(&body, version)).transpose()
    }

    async fn find_due(
        &self,
        as_of: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledJob>, StorageError> {
        let (as_of_s, as_of_ns) = time_key(as_of);
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT body, version FROM scheduled_jobs
            WHERE status = ?
              AND (run_at_s < ? OR (run_at_s = ? AND run_at_ns <= ?))
            ORDER BY priority DESC, run_at_s ASC, run_at_ns ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(JobStatus::Pending.as_str())
        .bind(as_of_s)
        .bind(as_of_s)
        .bind(as_of_ns)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;

        decode_rows(rows)
    }

    async fn find_by_status(&self, status: JobStatus) -> Result<Vec<ScheduledJob>, StorageError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT body, version FROM scheduled_jobs WHERE status = ? ORDER BY id")
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StorageError::Other(e.to_string()))?;

        decode_rows(rows)
    }

    async fn save(&self, mut job: ScheduledJob) -> Result<ScheduledJob, StorageError> {
        let current: Option<(String, i64)> =
            sqlx::query_as("SELECT body, version FROM scheduled_jobs WHERE id = ?")
                .bind(job.id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StorageError::Other(e.to_string()))?;
        let Some((body, version)) = current else {
            return Err(StorageError::NotFound(format!("job: {}", job.id)));
        };
        let stored = decode(&body, version)?;

        let expected = job.version;
        if stored.version != expected {
            return Err(StorageError::VersionConflict { id: job.id, expected });
        }
        check_transition(&stored, &job)?;

        job.version += 1;
        let (run_at_s, run_at_ns) = time_key(job.run_at);

        // The version predicate keeps this a CAS if another writer got in
        // between the read above and this update.
        let result = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET job_type = ?, status = ?, run_at_s = ?, run_at_ns = ?, priority = ?,
                version = ?, body = ?
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(job.job_type.to_string())
        .bind(job.status.as_str())
        .bind(run_at_s)
        .bind(run_at_ns)
        .bind(job.priority)
        .bind(to_db_version(job.version)?)
        .bind(encode(&job)?)
        .bind(job.id.as_str())
        .bind(to_db_version(expected)?)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;

        if result.rows_affected() == 1 {
            Ok(job)
        } else {
            Err(StorageError::VersionConflict { id: job.id, expected })
        }
    }

    async fn delete(&self, id: &JobId) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM scheduled_jobs WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }
}
