//! kairos - scheduled job execution for business applications.
//!
//! Domain code hands the [`ScheduleManager`] a [`ScheduleDefinition`]; a
//! [`Worker`] picks due jobs up, the [`ExecutionEngine`] claims each one with
//! a version-guarded write, runs the registered [`JobHandler`] under a
//! timeout, and settles the outcome: completion, next occurrence, retry with
//! backoff, or permanent failure.

pub mod config;
pub mod core;
pub mod dispatch;
pub mod events;
pub mod execution;
pub mod handlers;
pub mod scheduler;
pub mod storage;
pub mod testing;

pub use config::{ConfigError, ConfigLoader, EngineConfig, StorageConfig};
pub use crate::core::clock::{Clock, ManualClock, SystemClock};
pub use crate::core::job::{
    Claim, DefinitionError, JobResult, JobStatus, ScheduleDefinition, ScheduleDefinitionBuilder,
    ScheduledJob,
};
pub use crate::core::recurrence::{
    NextRun, RecurrenceEnd, RecurrenceEngine, RecurrenceError, RecurrenceUnit, ScheduleRecurrence,
};
pub use crate::core::retry::{BackoffStrategy, RetryPolicy};
pub use crate::core::types::{ClaimId, JobId, JobType, WorkerId};
pub use dispatch::{DispatchError, DispatchReceiver, Dispatcher, QueueDispatcher};
pub use events::{Event, EventBus, EventHandler};
pub use execution::{
    EngineError, ExecutionEngine, ExecutionOutcome, ExecutionReport, Settlement,
};
pub use handlers::{HandlerError, HandlerRegistry, JobHandler, LogHandler, RegistryError};
pub use scheduler::{ScheduleManager, SchedulerError, Worker, WorkerHandle, WorkerState};
#[cfg(feature = "sqlite")]
pub use storage::SqliteJobStore;
pub use storage::{InMemoryJobStore, JobStore, StorageError};
