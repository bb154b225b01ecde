//! Concurrent claim integration tests.
//!
//! Several engines share one store and race for the same job snapshot.

use crate::common::monday_morning;
use kairos::testing::{RecordingDispatcher, SlowHandler};
use kairos::{
    ExecutionEngine, HandlerRegistry, InMemoryJobStore, JobId, JobStatus, JobStore, JobType,
    ManualClock, ScheduleDefinition, ScheduleManager, ScheduledJob, WorkerId,
};
use std::sync::Arc;
use std::time::Duration;

fn engines<S: JobStore + 'static>(
    store: &Arc<S>,
    handler: &SlowHandler,
    count: usize,
) -> Vec<Arc<ExecutionEngine<S>>> {
    let clock = Arc::new(ManualClock::new(monday_morning()));
    (0..count)
        .map(|i| {
            let registry = HandlerRegistry::new()
                .with_handler(JobType::Reminder, Arc::new(handler.clone()))
                .unwrap();
            Arc::new(
                ExecutionEngine::new(
                    Arc::clone(store),
                    Arc::new(registry),
                    Arc::new(RecordingDispatcher::new()),
                    clock.clone(),
                )
                .with_worker_id(WorkerId::new(format!("worker-{}", i))),
            )
        })
        .collect()
}

async fn insert_reminder<S: JobStore>(store: &S) -> ScheduledJob {
    let def = ScheduleDefinition::builder(JobType::Reminder, monday_morning())
        .target("invoice-55")
        .build()
        .unwrap();
    let job = ScheduledJob::from_definition(JobId::generate(), def, monday_morning());
    store.insert(job).await.unwrap()
}

async fn race<S: JobStore + 'static>(store: Arc<S>, contenders: usize) {
    let handler = SlowHandler::new(JobType::Reminder, Duration::from_millis(20));
    let job = insert_reminder(store.as_ref()).await;

    let mut handles = Vec::new();
    for engine in engines(&store, &handler, contenders) {
        let snapshot = job.clone();
        handles.push(tokio::spawn(async move { engine.execute(snapshot).await }));
    }

    let mut executed = 0;
    let mut lost = 0;
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        if outcome.is_claim_lost() {
            lost += 1;
        } else {
            executed += 1;
        }
    }

    assert_eq!(executed, 1);
    assert_eq!(lost, contenders - 1);
    assert_eq!(handler.calls(), 1);

    let stored = store.find(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert!(stored.claim.is_none());
}

/// Test: Exactly one of many racing workers runs the job.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_one_claim_wins_in_memory() {
    race(Arc::new(InMemoryJobStore::new()), 8).await;
}

/// Test: Exactly one of many racing workers runs the job on SQLite.
#[cfg(feature = "sqlite")]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_one_claim_wins_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let store = kairos::SqliteJobStore::new(dir.path().join("jobs.db"))
        .await
        .unwrap();
    race(Arc::new(store), 8).await;
}

/// Test: A cancel that lands mid-run is applied once the attempt ends.
#[tokio::test]
async fn test_cancel_during_run_is_deferred() {
    let store = Arc::new(InMemoryJobStore::new());
    let handler = SlowHandler::new(JobType::Reminder, Duration::from_millis(200));
    let engine = engines(&store, &handler, 1).remove(0);
    let clock = Arc::new(ManualClock::new(monday_morning()));
    let manager = ScheduleManager::new(
        Arc::clone(&store),
        Arc::clone(&engine),
        Arc::new(RecordingDispatcher::new()),
        clock,
    );

    let def = ScheduleDefinition::builder(JobType::Reminder, monday_morning())
        .target("invoice-56")
        .recurrence(kairos::ScheduleRecurrence::daily())
        .build()
        .unwrap();
    let job = manager.schedule(def).await.unwrap();

    let run = tokio::spawn({
        let engine = Arc::clone(&engine);
        let job = job.clone();
        async move { engine.execute(job).await }
    });

    crate::common::wait_for_status(
        store.as_ref(),
        &job.id,
        JobStatus::Running,
        Duration::from_secs(5),
    )
    .await;
    assert!(manager.cancel_job(&job.id).await.unwrap());
    assert!(manager.cancel_job(&job.id).await.unwrap());
    let flagged = store.find(&job.id).await.unwrap().unwrap();
    assert_eq!(flagged.status, JobStatus::Running);
    assert!(flagged.cancel_requested);

    let outcome = run.await.unwrap().unwrap();
    assert!(!outcome.is_claim_lost());

    let stored = store.find(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Canceled);
    assert!(!stored.cancel_requested);
    assert!(!manager.cancel_job(&job.id).await.unwrap());
}
