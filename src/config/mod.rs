//! Configuration loading and parsing.
//!
//! This module provides YAML-based configuration for the engine, the worker
//! and the jobs seeded at startup.

mod builder;
mod error;
mod types;
mod yaml;

pub use builder::build_definition;
pub use error::ConfigError;
pub use types::{EngineConfig, JobSeedConfig, RetryConfig, StorageConfig};
pub use yaml::ConfigLoader;
