//! Job lifecycle integration tests.
//!
//! Drive jobs through the manager with a manual clock and check the stored
//! state after each attempt.

use crate::common::monday_morning;
use chrono::Duration as ChronoDuration;
use kairos::testing::{EventRecorder, ScriptedHandler, TestHarness};
use kairos::{
    Clock, Event, JobResult, JobStatus, JobStore, JobType, RetryPolicy, ScheduleDefinition,
    ScheduleRecurrence, SchedulerError, Settlement,
};
use std::sync::Arc;
use std::time::Duration;

/// Test: A payment reminder fires once at its due time and never again.
#[tokio::test]
async fn test_reminder_runs_once_when_due() {
    let handler = Arc::new(ScriptedHandler::succeeding(JobType::Reminder));
    let h = TestHarness::builder(monday_morning())
        .shared_handler(JobType::Reminder, handler.clone())
        .build();

    let due_at = monday_morning() + ChronoDuration::days(3);
    let def = ScheduleDefinition::builder(JobType::Reminder, due_at)
        .target("invoice-2024-017")
        .payload("channel", "email")
        .build()
        .unwrap();
    let job = h.manager.schedule(def).await.unwrap();

    // Not due yet, so nothing is dispatched or returned by the due query.
    assert!(h.dispatcher.dispatched().is_empty());
    assert!(h.manager.get_due_jobs().await.unwrap().is_empty());

    h.clock.advance(ChronoDuration::days(3));
    let due = h.manager.get_due_jobs().await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].id, job.id);

    let outcome = h.manager.execute_job(&job.id).await.unwrap();
    assert!(outcome.result().unwrap().success);

    let stored = h.store.find(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert!(stored.claim.is_none());
    assert!(h.dispatcher.dispatched().is_empty());
    assert!(h.manager.get_due_jobs().await.unwrap().is_empty());
    assert_eq!(handler.calls(), 1);
}

/// Test: A daily report export keeps its wall-clock time across runs.
#[tokio::test]
async fn test_daily_export_advances_each_run() {
    let h = TestHarness::builder(monday_morning())
        .handler(
            JobType::ReportExport,
            ScriptedHandler::succeeding(JobType::ReportExport),
        )
        .build();

    let def = ScheduleDefinition::builder(JobType::ReportExport, monday_morning())
        .target("sales-daily")
        .recurrence(ScheduleRecurrence::daily())
        .build()
        .unwrap();
    let job = h.manager.schedule(def).await.unwrap();

    for day in 1..=3 {
        let outcome = h.manager.execute_job(&job.id).await.unwrap();
        let report = match outcome {
            kairos::ExecutionOutcome::Executed(report) => report,
            kairos::ExecutionOutcome::ClaimLost => panic!("unexpected claim loss"),
        };
        let expected = monday_morning() + ChronoDuration::days(day);
        assert_eq!(
            report.settlement,
            Settlement::Recurred {
                next_run_at: expected,
                skipped: 0
            }
        );
        assert_eq!(report.job.status, JobStatus::Pending);
        assert_eq!(report.job.run_at, expected);
        assert_eq!(report.job.occurrence_count, day as u32);

        h.clock.set(expected);
    }
}

/// Test: A retried daily run does not shift later runs off 09:00.
#[tokio::test]
async fn test_daily_retry_does_not_drift() {
    let h = TestHarness::builder(monday_morning())
        .handler(
            JobType::ReportExport,
            ScriptedHandler::new(JobType::ReportExport)
                .then(JobResult::failure("sftp busy").with_retry_after(Duration::from_secs(30))),
        )
        .build();

    let def = ScheduleDefinition::builder(JobType::ReportExport, monday_morning())
        .target("sales-daily")
        .recurrence(ScheduleRecurrence::daily())
        .build()
        .unwrap();
    let job = h.manager.schedule(def).await.unwrap();

    h.manager.execute_job(&job.id).await.unwrap();
    let retried = h.store.find(&job.id).await.unwrap().unwrap();
    assert_eq!(retried.run_at, monday_morning() + ChronoDuration::seconds(30));

    h.clock.advance(ChronoDuration::seconds(30));
    h.manager.execute_job(&job.id).await.unwrap();
    let first = h.store.find(&job.id).await.unwrap().unwrap();
    assert_eq!(first.run_at, monday_morning() + ChronoDuration::days(1));

    h.clock.set(first.run_at);
    h.manager.execute_job(&job.id).await.unwrap();
    let second = h.store.find(&job.id).await.unwrap().unwrap();
    assert_eq!(second.run_at, monday_morning() + ChronoDuration::days(2));
    assert_eq!(second.occurrence_count, 2);
    assert_eq!(second.retry_count, 0);
}

/// Test: A recurring job that missed several occurrences runs once.
#[tokio::test]
async fn test_missed_occurrences_are_folded() {
    let h = TestHarness::builder(monday_morning())
        .handler(
            JobType::DataCleanup,
            ScriptedHandler::succeeding(JobType::DataCleanup),
        )
        .build();

    let def = ScheduleDefinition::builder(JobType::DataCleanup, monday_morning())
        .recurrence(ScheduleRecurrence::daily())
        .build()
        .unwrap();
    let job = h.manager.schedule(def).await.unwrap();

    // The worker was down for four and a half days.
    h.clock.advance(ChronoDuration::hours(4 * 24 + 12));
    h.manager.execute_job(&job.id).await.unwrap();

    let stored = h.store.find(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.run_at, monday_morning() + ChronoDuration::days(4));
    assert_eq!(stored.occurrence_count, 1);
    assert!(stored.is_due(h.clock.now()));
}

/// Test: A non-retryable failure ends the job at once.
#[tokio::test]
async fn test_non_retryable_failure_is_permanent() {
    let h = TestHarness::builder(monday_morning())
        .handler(
            JobType::ProductionOrderStart,
            ScriptedHandler::new(JobType::ProductionOrderStart)
                .then(JobResult::permanent_failure("order PO-77 was deleted")),
        )
        .build();
    let recorder = Arc::new(EventRecorder::new());
    h.event_bus.register(recorder.clone()).await;

    let def = ScheduleDefinition::builder(JobType::ProductionOrderStart, monday_morning())
        .target("PO-77")
        .max_retries(5)
        .build()
        .unwrap();
    let job = h.manager.schedule(def).await.unwrap();
    let dispatched_before = h.dispatcher.dispatched().len();

    h.manager.execute_job(&job.id).await.unwrap();

    let stored = h.store.find(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::FailedPermanent);
    assert_eq!(stored.retry_count, 0);
    assert_eq!(
        stored.last_result.unwrap().error.as_deref(),
        Some("order PO-77 was deleted")
    );
    assert_eq!(h.dispatcher.dispatched().len(), dispatched_before);

    let events = recorder.events().await;
    assert!(events.iter().any(|e| matches!(e, Event::JobFailed { .. })));
    assert!(!events
        .iter()
        .any(|e| matches!(e, Event::JobRetryScheduled { .. })));
}

/// Test: Retryable failures are retried until the budget is spent.
#[tokio::test]
async fn test_retries_until_exhausted() {
    let h = TestHarness::builder(monday_morning())
        .handler(
            JobType::PeriodClose,
            ScriptedHandler::new(JobType::PeriodClose)
                .then(JobResult::failure("ledger locked"))
                .then(JobResult::failure("ledger locked"))
                .then(JobResult::failure("ledger locked")),
        )
        .retry_policy(RetryPolicy::fixed(Duration::from_secs(60)))
        .build();

    let def = ScheduleDefinition::builder(JobType::PeriodClose, monday_morning())
        .target("2024-01")
        .max_retries(2)
        .build()
        .unwrap();
    let job = h.manager.schedule(def).await.unwrap();

    for attempt in 1..=2u32 {
        h.manager.execute_job(&job.id).await.unwrap();
        let stored = h.store.find(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.retry_count, attempt);
        assert_eq!(stored.run_at, h.clock.now() + ChronoDuration::seconds(60));
        assert!(!stored.is_due(h.clock.now()));

        h.clock.advance(ChronoDuration::seconds(60));
        assert!(stored.is_due(h.clock.now()));
    }

    h.manager.execute_job(&job.id).await.unwrap();
    let stored = h.store.find(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::FailedPermanent);
    assert_eq!(stored.retry_count, 2);
}

/// Test: A retry followed by success completes a one-shot job.
#[tokio::test]
async fn test_retry_then_success() {
    let handler = Arc::new(
        ScriptedHandler::new(JobType::ReportExport)
            .then(JobResult::failure("storage timeout").with_retry_after(Duration::from_secs(5))),
    );
    let h = TestHarness::builder(monday_morning())
        .shared_handler(JobType::ReportExport, handler.clone())
        .build();

    let def = ScheduleDefinition::builder(JobType::ReportExport, monday_morning())
        .target("inventory")
        .build()
        .unwrap();
    let job = h.manager.schedule(def).await.unwrap();

    h.manager.execute_job(&job.id).await.unwrap();
    let stored = h.store.find(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.run_at, monday_morning() + ChronoDuration::seconds(5));
    let (_, delay) = h.dispatcher.dispatched().pop().unwrap();
    assert_eq!(delay, Some(Duration::from_secs(5)));

    h.clock.advance(ChronoDuration::seconds(5));
    h.manager.execute_job(&job.id).await.unwrap();
    let stored = h.store.find(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(handler.calls(), 2);
}

/// Test: Cancel is idempotent and rejected on finished jobs.
#[tokio::test]
async fn test_cancel_is_idempotent() {
    let h = TestHarness::builder(monday_morning())
        .handler(JobType::Reminder, ScriptedHandler::succeeding(JobType::Reminder))
        .build();

    let pending = h
        .manager
        .schedule(
            ScheduleDefinition::builder(JobType::Reminder, monday_morning() + ChronoDuration::hours(1))
                .target("invoice-1")
                .build()
                .unwrap(),
        )
        .await
        .unwrap();
    assert!(h.manager.cancel_job(&pending.id).await.unwrap());
    assert!(!h.manager.cancel_job(&pending.id).await.unwrap());
    let stored = h.store.find(&pending.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Canceled);

    let done = h
        .manager
        .schedule(
            ScheduleDefinition::builder(JobType::Reminder, monday_morning())
                .target("invoice-2")
                .build()
                .unwrap(),
        )
        .await
        .unwrap();
    h.manager.execute_job(&done.id).await.unwrap();
    assert!(!h.manager.cancel_job(&done.id).await.unwrap());
    let stored = h.store.find(&done.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
}

/// Test: Canceled jobs cannot be executed.
#[tokio::test]
async fn test_canceled_job_is_not_executed() {
    let handler = Arc::new(ScriptedHandler::succeeding(JobType::Reminder));
    let h = TestHarness::builder(monday_morning())
        .shared_handler(JobType::Reminder, handler.clone())
        .build();
    let job = h
        .manager
        .schedule(
            ScheduleDefinition::builder(JobType::Reminder, monday_morning())
                .target("invoice-3")
                .build()
                .unwrap(),
        )
        .await
        .unwrap();
    h.manager.cancel_job(&job.id).await.unwrap();

    let result = h.manager.execute_job(&job.id).await;

    assert!(matches!(
        result,
        Err(SchedulerError::InvalidState {
            status: JobStatus::Canceled,
            ..
        })
    ));
    assert_eq!(handler.calls(), 0);
}

/// Test: Events trace the whole lifecycle of a successful job.
#[tokio::test]
async fn test_lifecycle_events() {
    let h = TestHarness::builder(monday_morning())
        .handler(
            JobType::DocumentRetention,
            ScriptedHandler::succeeding(JobType::DocumentRetention),
        )
        .build();
    let recorder = Arc::new(EventRecorder::new());
    h.event_bus.register(recorder.clone()).await;

    let job = h
        .manager
        .schedule(
            ScheduleDefinition::builder(JobType::DocumentRetention, monday_morning())
                .target("contract-881")
                .build()
                .unwrap(),
        )
        .await
        .unwrap();
    h.manager.execute_job(&job.id).await.unwrap();

    let events = recorder.events().await;
    assert_eq!(events.len(), 3);
    assert!(matches!(events[0], Event::JobScheduled { .. }));
    assert!(matches!(events[1], Event::JobClaimed { .. }));
    assert!(matches!(
        events[2],
        Event::JobSucceeded {
            next_run_at: None,
            ..
        }
    ));
    assert!(events.iter().all(|e| e.job_id() == &job.id));
}
