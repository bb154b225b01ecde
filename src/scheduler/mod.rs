//! Scheduling façade and worker loop.
//!
//! This module provides the `ScheduleManager` used by callers to create and
//! control jobs, and the `Worker` that polls for due jobs and executes them.

mod handle;
mod manager;
mod types;
mod worker;

pub use handle::WorkerHandle;
pub use manager::{DEFAULT_DUE_BATCH_SIZE, ScheduleManager};
pub use types::{SchedulerError, WorkerState};
pub use worker::Worker;
