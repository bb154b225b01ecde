//! Core scheduling types: identifiers, job records, recurrence, retry policy and time.

pub mod clock;
pub mod job;
pub mod recurrence;
pub mod retry;
pub mod types;
