//! Mapping from job type to handler.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use super::JobHandler;
use crate::core::types::JobType;

/// Errors raised by the handler registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// A handler is already registered for this type.
    #[error("handler already registered for job type {0}")]
    DuplicateHandler(JobType),

    /// The handler does not support the type it was registered for.
    #[error("handler does not support job type {0}")]
    UnsupportedType(JobType),

    /// No handler is registered for this type.
    #[error("no handler registered for job type {0}")]
    NoHandlerForType(JobType),
}

/// Explicit job type to handler table, built once at startup.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `job_type`.
    pub fn register(
        &mut self,
        job_type: JobType,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), RegistryError> {
        if self.handlers.contains_key(&job_type) {
            return Err(RegistryError::DuplicateHandler(job_type));
        }
        if !handler.supports(&job_type) {
            return Err(RegistryError::UnsupportedType(job_type));
        }
        self.handlers.insert(job_type, handler);
        Ok(())
    }

    /// Builder form of [`HandlerRegistry::register`].
    pub fn with_handler(
        mut self,
        job_type: JobType,
        handler: Arc<dyn JobHandler>,
    ) -> Result<Self, RegistryError> {
        self.register(job_type, handler)?;
        Ok(self)
    }

    /// Find the handler for `job_type`.
    pub fn resolve(&self, job_type: &JobType) -> Result<Arc<dyn JobHandler>, RegistryError> {
        self.handlers
            .get(job_type)
            .cloned()
            .ok_or_else(|| RegistryError::NoHandlerForType(job_type.clone()))
    }

    /// Whether a handler exists for `job_type`.
    pub fn contains(&self, job_type: &JobType) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Registered job types.
    pub fn job_types(&self) -> Vec<&JobType> {
        let mut types: Vec<_> = self.handlers.keys().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}
