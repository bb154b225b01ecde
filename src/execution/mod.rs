//! Job execution.
//!
//! This module provides the engine that claims and runs a single job attempt,
//! and the pure state transition applied to its result.

mod engine;
mod transition;

pub use engine::{
    DEFAULT_TIMEOUT, EngineError, ExecutionEngine, ExecutionOutcome, ExecutionReport,
};
pub use transition::{Settlement, settle};
