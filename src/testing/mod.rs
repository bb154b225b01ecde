//! Testing utilities for users of the Kairos library.
//!
//! This module provides helpers for testing job handlers and scheduling flows:
//!
//! - [`ScriptedHandler`]: A handler that returns a scripted sequence of results
//! - [`PanickingHandler`]: A handler that always panics
//! - [`SlowHandler`]: A handler that sleeps before succeeding
//! - [`RecordingDispatcher`]: A dispatcher that records dispatches instead of delivering them
//! - [`EventRecorder`]: An event handler that keeps every event it sees
//! - [`TestHarness`]: A manager wired to in-memory storage and a manual clock

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::core::clock::ManualClock;
use crate::core::job::{JobResult, ScheduledJob};
use crate::core::retry::RetryPolicy;
use crate::core::types::{JobId, JobType, WorkerId};
use crate::dispatch::{DispatchError, Dispatcher};
use crate::events::{Event, EventBus, EventHandler};
use crate::execution::ExecutionEngine;
use crate::handlers::{HandlerError, HandlerRegistry, JobHandler};
use crate::scheduler::ScheduleManager;
use crate::storage::InMemoryJobStore;

type CallHook = Box<dyn Fn(&ScheduledJob) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// A handler that returns scripted results in order.
///
/// Once the script is exhausted every call succeeds.
///
/// # Example
///
/// ```
/// use kairos::testing::ScriptedHandler;
/// use kairos::{JobResult, JobType};
///
/// // Fails once, then succeeds
/// let handler = ScriptedHandler::new(JobType::Reminder)
///     .then(JobResult::failure("smtp unavailable"));
/// assert_eq!(handler.calls(), 0);
/// ```
pub struct ScriptedHandler {
    job_type: JobType,
    script: Mutex<VecDeque<JobResult>>,
    calls: AtomicU32,
    hook: Option<CallHook>,
}

impl ScriptedHandler {
    /// Create a handler with an empty script.
    pub fn new(job_type: JobType) -> Self {
        Self {
            job_type,
            script: Mutex::new(VecDeque::new()),
            calls: AtomicU32::new(0),
            hook: None,
        }
    }

    /// Create a handler that always succeeds.
    pub fn succeeding(job_type: JobType) -> Self {
        Self::new(job_type)
    }

    /// Append a result to the script.
    pub fn then(self, result: JobResult) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(result);
        }
        self
    }

    /// Run `hook` at the start of every call, before the result is returned.
    pub fn on_call<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ScheduledJob) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync + 'static,
    {
        self.hook = Some(Box::new(hook));
        self
    }

    /// Number of times the handler was invoked.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for ScriptedHandler {
    fn supports(&self, job_type: &JobType) -> bool {
        *job_type == self.job_type
    }

    async fn handle(&self, job: &ScheduledJob) -> Result<JobResult, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = &self.hook {
            hook(job).await;
        }
        let next = self
            .script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front());
        Ok(next.unwrap_or_else(JobResult::success))
    }
}

/// A handler that panics on every call.
pub struct PanickingHandler {
    job_type: JobType,
}

impl PanickingHandler {
    pub fn new(job_type: JobType) -> Self {
        Self { job_type }
    }
}

#[async_trait]
impl JobHandler for PanickingHandler {
    fn supports(&self, job_type: &JobType) -> bool {
        *job_type == self.job_type
    }

    async fn handle(&self, job: &ScheduledJob) -> Result<JobResult, HandlerError> {
        panic!("handler exploded on {}", job.id);
    }
}

/// A handler that sleeps for a fixed duration, then succeeds.
///
/// Clones share their counters.
#[derive(Clone)]
pub struct SlowHandler {
    job_type: JobType,
    delay: Duration,
    timeout: Option<Duration>,
    retry_on_timeout: bool,
    calls: Arc<AtomicU32>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl SlowHandler {
    pub fn new(job_type: JobType, delay: Duration) -> Self {
        Self {
            job_type,
            delay,
            timeout: None,
            retry_on_timeout: true,
            calls: Arc::new(AtomicU32::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Report `timeout` as the handler's own timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Make timeouts permanent failures.
    pub fn without_timeout_retry(mut self) -> Self {
        self.retry_on_timeout = false;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of overlapping calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for SlowHandler {
    fn supports(&self, job_type: &JobType) -> bool {
        *job_type == self.job_type
    }

    async fn handle(&self, _job: &ScheduledJob) -> Result<JobResult, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(JobResult::success())
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn retry_on_timeout(&self) -> bool {
        self.retry_on_timeout
    }
}

/// A dispatcher that records every dispatch.
#[derive(Default)]
pub struct RecordingDispatcher {
    dispatched: Mutex<Vec<(JobId, Option<Duration>)>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every dispatch so far, oldest first.
    pub fn dispatched(&self) -> Vec<(JobId, Option<Duration>)> {
        self.dispatched
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn dispatch(
        &self,
        job: &ScheduledJob,
        delay: Option<Duration>,
    ) -> Result<(), DispatchError> {
        self.dispatched
            .lock()
            .map_err(|_| DispatchError::Other("recording lock poisoned".to_string()))?
            .push((job.id.clone(), delay));
        Ok(())
    }

    fn size(&self) -> usize {
        self.dispatched.lock().map(|d| d.len()).unwrap_or(0)
    }
}

/// An event handler that keeps every event.
#[derive(Default)]
pub struct EventRecorder {
    events: tokio::sync::Mutex<Vec<Event>>,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event so far, oldest first.
    pub async fn events(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl EventHandler for EventRecorder {
    async fn handle(&self, event: &Event) {
        self.events.lock().await.push(event.clone());
    }
}

/// A schedule manager wired to in-memory storage, a manual clock, and a
/// recording dispatcher.
///
/// # Example
///
/// ```
/// use chrono::Utc;
/// use kairos::testing::{ScriptedHandler, TestHarness};
/// use kairos::JobType;
///
/// let harness = TestHarness::builder(Utc::now())
///     .handler(JobType::Reminder, ScriptedHandler::succeeding(JobType::Reminder))
///     .build();
/// assert!(harness.dispatcher.dispatched().is_empty());
/// ```
pub struct TestHarness {
    pub manager: Arc<ScheduleManager<InMemoryJobStore>>,
    pub store: Arc<InMemoryJobStore>,
    pub clock: Arc<ManualClock>,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub event_bus: Arc<EventBus>,
}

impl TestHarness {
    /// Start building a harness whose clock reads `start`.
    pub fn builder(start: DateTime<Utc>) -> TestHarnessBuilder {
        TestHarnessBuilder {
            start,
            registry: HandlerRegistry::new(),
            retry_policy: None,
            worker_id: WorkerId::new("test-worker"),
        }
    }
}

/// Builder for [`TestHarness`].
pub struct TestHarnessBuilder {
    start: DateTime<Utc>,
    registry: HandlerRegistry,
    retry_policy: Option<RetryPolicy>,
    worker_id: WorkerId,
}

impl TestHarnessBuilder {
    /// Register a handler for `job_type`.
    ///
    /// # Panics
    ///
    /// Panics if the handler is rejected by the registry.
    pub fn handler(self, job_type: JobType, handler: impl JobHandler + 'static) -> Self {
        self.shared_handler(job_type, Arc::new(handler))
    }

    /// Register a handler the test keeps a reference to.
    ///
    /// # Panics
    ///
    /// Panics if the handler is rejected by the registry.
    pub fn shared_handler(mut self, job_type: JobType, handler: Arc<dyn JobHandler>) -> Self {
        if let Err(e) = self.registry.register(job_type, handler) {
            panic!("test harness handler rejected: {e}");
        }
        self
    }

    /// Use `policy` instead of the default backoff.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Claim jobs as `worker`.
    pub fn worker_id(mut self, worker: impl Into<String>) -> Self {
        self.worker_id = WorkerId::new(worker);
        self
    }

    pub fn build(self) -> TestHarness {
        let store = Arc::new(InMemoryJobStore::new());
        let clock = Arc::new(ManualClock::new(self.start));
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let event_bus = Arc::new(EventBus::new());

        let mut engine = ExecutionEngine::new(
            Arc::clone(&store),
            Arc::new(self.registry),
            dispatcher.clone(),
            clock.clone(),
        )
        .with_event_bus(Arc::clone(&event_bus))
        .with_worker_id(self.worker_id);
        if let Some(policy) = self.retry_policy {
            engine = engine.with_retry_policy(policy);
        }

        let manager = Arc::new(ScheduleManager::new(
            Arc::clone(&store),
            Arc::new(engine),
            dispatcher.clone(),
            clock.clone(),
        ));

        TestHarness {
            manager,
            store,
            clock,
            dispatcher,
            event_bus,
        }
    }
}
