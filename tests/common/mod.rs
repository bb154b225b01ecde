//! Common test utilities shared across integration tests.

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use kairos::{JobId, JobStatus, JobStore, ScheduledJob};
use std::time::Duration;

/// Monday 2024-01-15 09:00 UTC.
pub fn monday_morning() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 15, 9, 0, 0).unwrap()
}

/// Wait for a job to reach an expected status, polling storage.
///
/// Polls every 10ms and panics once `timeout` elapses.
pub async fn wait_for_status<S: JobStore + ?Sized>(
    store: &S,
    id: &JobId,
    expected: JobStatus,
    timeout: Duration,
) -> ScheduledJob {
    let start = tokio::time::Instant::now();
    loop {
        let job = store.find(id).await.unwrap().expect("job should exist");
        if job.status == expected {
            return job;
        }
        if start.elapsed() > timeout {
            panic!(
                "Timeout waiting for job {} to reach {}, current status: {}",
                id, expected, job.status
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
