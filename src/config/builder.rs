//! Conversion from seeded job configuration to schedule definitions.

use chrono::{DateTime, Utc};

use super::error::ConfigError;
use super::types::JobSeedConfig;
use crate::core::job::ScheduleDefinition;
use crate::core::recurrence::ScheduleRecurrence;

/// Build a [`ScheduleDefinition`] from a seeded job.
///
/// Jobs without `run_at` start at `now`; jobs without `max_retries` use
/// `default_max_retries`.
pub fn build_definition(
    seed: &JobSeedConfig,
    default_max_retries: u32,
    now: DateTime<Utc>,
) -> Result<ScheduleDefinition, ConfigError> {
    let run_at = match &seed.run_at {
        Some(raw) => parse_time("run_at", raw)?,
        None => now,
    };

    let mut recurrence = match &seed.recurrence {
        Some(expression) => ScheduleRecurrence::parse(expression)
            .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?,
        None => ScheduleRecurrence::none(),
    };
    if let Some(tz) = &seed.timezone {
        recurrence = recurrence
            .with_timezone(tz.as_str())
            .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;
    }
    match (&seed.until, seed.occurrences) {
        (Some(_), Some(_)) => {
            return Err(ConfigError::InvalidConfig(
                "set either until or occurrences, not both".into(),
            ));
        }
        (Some(raw), None) => recurrence = recurrence.until(parse_time("until", raw)?),
        (None, Some(count)) => recurrence = recurrence.occurrences(count),
        (None, None) => {}
    }

    let mut builder = ScheduleDefinition::builder(seed.job_type.clone(), run_at)
        .recurrence(recurrence)
        .max_retries(seed.max_retries.unwrap_or(default_max_retries))
        .priority(seed.priority);
    if let Some(target) = &seed.target {
        builder = builder.target(target.clone());
    }
    for (key, value) in &seed.payload {
        builder = builder.payload(key.clone(), value.clone());
    }

    builder
        .build()
        .map_err(|e| ConfigError::InvalidConfig(e.to_string()))
}

fn parse_time(field: &str, raw: &str) -> Result<DateTime<Utc>, ConfigError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ConfigError::InvalidConfig(format!("invalid {} '{}': {}", field, raw, e)))
}
