//! Worker loop integration tests.
//!
//! Run a real worker with the system clock and the in-process dispatch queue.

use crate::common::wait_for_status;
use chrono::Utc;
use kairos::testing::{ScriptedHandler, SlowHandler};
use kairos::{
    Clock, ExecutionEngine, HandlerRegistry, InMemoryJobStore, JobHandler, JobResult, JobStatus,
    JobStore, JobType, QueueDispatcher, ScheduleDefinition, ScheduleManager, ScheduledJob,
    SystemClock, Worker, WorkerId, WorkerState,
};
use std::sync::Arc;
use std::time::Duration;

struct Setup {
    store: Arc<InMemoryJobStore>,
    manager: Arc<ScheduleManager<InMemoryJobStore>>,
    worker: Worker<InMemoryJobStore>,
}

fn setup(job_type: JobType, handler: Arc<dyn JobHandler>) -> Setup {
    let store = Arc::new(InMemoryJobStore::new());
    let (dispatcher, receiver) = QueueDispatcher::new();
    let dispatcher = Arc::new(dispatcher);
    let clock = Arc::new(SystemClock);
    let registry = HandlerRegistry::new()
        .with_handler(job_type, handler)
        .unwrap();

    let engine = ExecutionEngine::new(
        Arc::clone(&store),
        Arc::new(registry),
        dispatcher.clone(),
        clock.clone(),
    )
    .with_worker_id(WorkerId::new("worker-it"));
    let manager = Arc::new(ScheduleManager::new(
        Arc::clone(&store),
        Arc::new(engine),
        dispatcher,
        clock,
    ));

    // A long tick makes the dispatch queue the only fast path.
    let worker = Worker::new(Arc::clone(&manager))
        .with_dispatch_receiver(receiver)
        .with_tick_interval(Duration::from_secs(60));

    Setup {
        store,
        manager,
        worker,
    }
}

/// Test: A due job reaches the worker through the dispatch queue.
#[tokio::test]
async fn test_dispatched_job_is_executed() {
    let handler = Arc::new(ScriptedHandler::succeeding(JobType::Reminder));
    let s = setup(JobType::Reminder, handler.clone());
    let (handle, task) = s.worker.start();

    let job = s
        .manager
        .schedule(
            ScheduleDefinition::builder(JobType::Reminder, Utc::now())
                .target("invoice-100")
                .build()
                .unwrap(),
        )
        .await
        .unwrap();

    wait_for_status(
        s.store.as_ref(),
        &job.id,
        JobStatus::Completed,
        Duration::from_secs(5),
    )
    .await;
    assert_eq!(handler.calls(), 1);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

/// Test: A retry with a short delay is re-dispatched and succeeds.
#[tokio::test]
async fn test_retry_is_redelivered() {
    let handler = Arc::new(
        ScriptedHandler::new(JobType::ReportExport).then(
            JobResult::failure("upstream busy").with_retry_after(Duration::from_millis(50)),
        ),
    );
    let s = setup(JobType::ReportExport, handler.clone());
    let (handle, task) = s.worker.start();

    let job = s
        .manager
        .schedule(
            ScheduleDefinition::builder(JobType::ReportExport, Utc::now())
                .target("weekly-kpis")
                .build()
                .unwrap(),
        )
        .await
        .unwrap();

    let done = wait_for_status(
        s.store.as_ref(),
        &job.id,
        JobStatus::Completed,
        Duration::from_secs(5),
    )
    .await;
    assert_eq!(done.retry_count, 1);
    assert_eq!(handler.calls(), 2);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

/// Test: A job whose run time was moved is not executed early.
#[tokio::test]
async fn test_rescheduled_job_waits() {
    let handler = Arc::new(ScriptedHandler::succeeding(JobType::Reminder));
    let s = setup(JobType::Reminder, handler.clone());

    let job = s
        .manager
        .schedule(
            ScheduleDefinition::builder(JobType::Reminder, Utc::now())
                .target("invoice-101")
                .build()
                .unwrap(),
        )
        .await
        .unwrap();
    s.manager
        .reschedule_job(&job.id, Utc::now() + chrono::Duration::hours(1))
        .await
        .unwrap();

    let (handle, task) = s.worker.start();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(handler.calls(), 0);
    let stored = s.store.find(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Pending);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

/// Test: Shutdown waits for running jobs to settle.
#[tokio::test]
async fn test_graceful_shutdown_waits_for_running_job() {
    let handler = SlowHandler::new(JobType::DataCleanup, Duration::from_millis(300));
    let s = setup(JobType::DataCleanup, Arc::new(handler.clone()));
    let (handle, task) = s.worker.start();

    let job = s
        .manager
        .schedule(ScheduleDefinition::builder(JobType::DataCleanup, Utc::now()).build().unwrap())
        .await
        .unwrap();
    wait_for_status(
        s.store.as_ref(),
        &job.id,
        JobStatus::Running,
        Duration::from_secs(5),
    )
    .await;

    handle.shutdown().await.unwrap();
    task.await.unwrap();

    assert_eq!(handle.state().await, WorkerState::Stopped);
    let stored = s.store.find(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
}

/// Test: A claim left behind by a dead worker is recovered and run.
#[tokio::test]
async fn test_stale_claim_is_recovered() {
    let handler = Arc::new(ScriptedHandler::succeeding(JobType::Reminder));
    let s = setup(JobType::Reminder, handler.clone());

    let def = ScheduleDefinition::builder(JobType::Reminder, Utc::now())
        .target("invoice-102")
        .build()
        .unwrap();
    let mut orphan = ScheduledJob::from_definition(kairos::JobId::generate(), def, Utc::now());
    orphan.mark_claimed(
        WorkerId::new("dead-worker"),
        SystemClock.now() - chrono::Duration::minutes(30),
    );
    let orphan = s.store.insert(orphan).await.unwrap();

    let worker = s
        .worker
        .with_tick_interval(Duration::from_millis(20))
        .with_claim_lease(Duration::from_secs(60));
    let (handle, task) = worker.start();

    let done = wait_for_status(
        s.store.as_ref(),
        &orphan.id,
        JobStatus::Completed,
        Duration::from_secs(5),
    )
    .await;
    assert_eq!(handler.calls(), 1);
    assert_eq!(done.last_result.map(|r| r.success), Some(true));

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}
