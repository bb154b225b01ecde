//! Recurrence rules and next occurrence calculation.
//!
//! Supports fixed calendar units (daily, weekly, monthly) evaluated in a
//! timezone, fixed intervals (`@every 90m`), and optional end conditions.
//! Calendar units are added to the previous run time in local wall-clock
//! terms, so a job scheduled at 09:00 keeps firing at 09:00 across DST changes.

use chrono::{
    DateTime, Days, LocalResult, Months, NaiveDateTime, Offset, TimeZone, Utc,
};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Upper bound on missed occurrences skipped in one catch-up pass.
const MAX_CATCH_UP_ITERATIONS: u32 = 10_000;

/// Errors that can occur when parsing or evaluating recurrences.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecurrenceError {
    /// The recurrence is `None`; the job runs once.
    #[error("job does not recur")]
    NotRecurring,

    /// The end condition has been reached.
    #[error("no more occurrences")]
    Exhausted,

    /// Invalid interval expression.
    #[error("invalid interval expression: {0}")]
    InvalidInterval(String),

    /// Unknown recurrence expression.
    #[error("unknown recurrence: {0}")]
    UnknownRecurrence(String),

    /// Invalid timezone.
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    /// Date arithmetic left the representable range.
    #[error("next occurrence is out of range")]
    OutOfRange,
}

/// How often a job repeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "unit", rename_all = "snake_case")]
pub enum RecurrenceUnit {
    /// Run once.
    None,
    /// Same local time on the next calendar day.
    Daily,
    /// Same local time seven calendar days later.
    Weekly,
    /// Same local time and day of month one month later, clamped to month end.
    Monthly,
    /// Fixed elapsed interval.
    Interval {
        /// Interval length in seconds.
        seconds: u64,
    },
}

/// When a recurring job stops recurring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecurrenceEnd {
    /// No occurrence is scheduled after this instant.
    Until(DateTime<Utc>),
    /// The job runs this many times in total.
    Occurrences(u32),
}

/// A repetition rule attached to a scheduled job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRecurrence {
    unit: RecurrenceUnit,
    #[serde(default)]
    end: Option<RecurrenceEnd>,
    #[serde(default = "default_timezone")]
    timezone: String,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl ScheduleRecurrence {
    /// A one-shot job.
    pub fn none() -> Self {
        Self::from_unit(RecurrenceUnit::None)
    }

    /// Repeat every calendar day.
    pub fn daily() -> Self {
        Self::from_unit(RecurrenceUnit::Daily)
    }

    /// Repeat every seven calendar days.
    pub fn weekly() -> Self {
        Self::from_unit(RecurrenceUnit::Weekly)
    }

    /// Repeat every calendar month.
    pub fn monthly() -> Self {
        Self::from_unit(RecurrenceUnit::Monthly)
    }

    /// Repeat after a fixed interval.
    pub fn every(interval: std::time::Duration) -> Self {
        Self::from_unit(RecurrenceUnit::Interval {
            seconds: interval.as_secs(),
        })
    }

    fn from_unit(unit: RecurrenceUnit) -> Self {
        Self {
            unit,
            end: None,
            timezone: default_timezone(),
        }
    }

    /// Builder: evaluate calendar units in the given IANA timezone.
    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Result<Self, RecurrenceError> {
        let timezone = timezone.into();
        timezone
            .parse::<Tz>()
            .map_err(|_| RecurrenceError::InvalidTimezone(timezone.clone()))?;
        self.timezone = timezone;
        Ok(self)
    }

    /// Builder: stop after the given instant.
    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.end = Some(RecurrenceEnd::Until(until));
        self
    }

    /// Builder: stop after `count` runs in total.
    pub fn occurrences(mut self, count: u32) -> Self {
        self.end = Some(RecurrenceEnd::Occurrences(count));
        self
    }

    /// Parse a recurrence expression.
    ///
    /// Supports `@once`, `@daily`, `@weekly`, `@monthly` and intervals such as
    /// `@every 5m` or `@every 1h30m`.
    pub fn parse(expression: &str) -> Result<Self, RecurrenceError> {
        let trimmed = expression.trim().to_lowercase();
        match trimmed.as_str() {
            "@once" | "none" | "" => Ok(Self::none()),
            "@daily" => Ok(Self::daily()),
            "@weekly" => Ok(Self::weekly()),
            "@monthly" => Ok(Self::monthly()),
            s if s.starts_with("@every ") => {
                let secs = parse_duration(&s[7..])?;
                Ok(Self::from_unit(RecurrenceUnit::Interval { seconds: secs }))
            }
            _ => Err(RecurrenceError::UnknownRecurrence(expression.to_string())),
        }
    }

    /// The repetition unit.
    pub fn unit(&self) -> RecurrenceUnit {
        self.unit
    }

    /// The end condition, if any.
    pub fn end(&self) -> Option<RecurrenceEnd> {
        self.end
    }

    /// The timezone used for calendar arithmetic.
    pub fn timezone(&self) -> &str {
        &self.timezone
    }

    /// Whether this rule schedules more than one run.
    pub fn is_recurring(&self) -> bool {
        self.unit != RecurrenceUnit::None
    }

    /// Check the rule is well formed relative to the first run time.
    pub fn validate(&self, first_run: DateTime<Utc>) -> Result<(), RecurrenceError> {
        self.tz()?;
        if let RecurrenceUnit::Interval { seconds } = self.unit {
            let step = interval_step(seconds)
                .map_err(|_| RecurrenceError::InvalidInterval(format!("{}s", seconds)))?;
            first_run
                .checked_add_signed(step)
                .ok_or(RecurrenceError::OutOfRange)?;
        }
        match self.end {
            Some(RecurrenceEnd::Until(until)) if until < first_run => {
                Err(RecurrenceError::Exhausted)
            }
            Some(RecurrenceEnd::Occurrences(0)) => Err(RecurrenceError::Exhausted),
            _ => Ok(()),
        }
    }

    fn tz(&self) -> Result<Tz, RecurrenceError> {
        self.timezone
            .parse()
            .map_err(|_| RecurrenceError::InvalidTimezone(self.timezone.clone()))
    }
}

impl Default for ScheduleRecurrence {
    fn default() -> Self {
        Self::none()
    }
}

impl FromStr for ScheduleRecurrence {
    type Err = RecurrenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ScheduleRecurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.unit {
            RecurrenceUnit::None => write!(f, "@once"),
            RecurrenceUnit::Daily => write!(f, "@daily"),
            RecurrenceUnit::Weekly => write!(f, "@weekly"),
            RecurrenceUnit::Monthly => write!(f, "@monthly"),
            RecurrenceUnit::Interval { seconds } => write!(f, "@every {}s", seconds),
        }
    }
}

/// Parse a duration string like "5m", "1h", "1h30m", "30s", "2d" into seconds.
fn parse_duration(s: &str) -> Result<u64, RecurrenceError> {
    let trimmed = s.trim();
    let mut total_secs: u64 = 0;
    let mut current_num = String::new();

    for c in trimmed.chars() {
        if c.is_ascii_digit() {
            current_num.push(c);
        } else {
            let num: u64 = current_num
                .parse()
                .map_err(|_| RecurrenceError::InvalidInterval(trimmed.to_string()))?;
            current_num.clear();

            let unit_secs = match c {
                's' => 1,
                'm' => 60,
                'h' => 3600,
                'd' => 86400,
                _ => return Err(RecurrenceError::InvalidInterval(trimmed.to_string())),
            };
            total_secs = num
                .checked_mul(unit_secs)
                .and_then(|secs| total_secs.checked_add(secs))
                .ok_or_else(|| RecurrenceError::InvalidInterval(trimmed.to_string()))?;
        }
    }

    if !current_num.is_empty() || interval_step(total_secs).is_err() {
        return Err(RecurrenceError::InvalidInterval(trimmed.to_string()));
    }

    Ok(total_secs)
}

/// Interval length as a signed duration. Zero and lengths chrono cannot
/// represent are rejected.
fn interval_step(seconds: u64) -> Result<chrono::Duration, RecurrenceError> {
    if seconds == 0 {
        return Err(RecurrenceError::InvalidInterval("0s".to_string()));
    }
    i64::try_from(seconds)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .ok_or(RecurrenceError::OutOfRange)
}

/// Result of advancing a recurring job past its current occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextRun {
    /// When the job should run next.
    pub run_at: DateTime<Utc>,
    /// Occurrences that fell due while the job was late and were folded into this run.
    pub skipped: u32,
}

/// Pure next-occurrence computation.
pub struct RecurrenceEngine;

impl RecurrenceEngine {
    /// Next occurrence strictly after `from`.
    ///
    /// Only the `Until` end condition is checked here; occurrence limits need
    /// the job's run count, see [`RecurrenceEngine::next_for`].
    pub fn next(
        recurrence: &ScheduleRecurrence,
        from: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, RecurrenceError> {
        let tz = recurrence.tz()?;
        let next = match recurrence.unit {
            RecurrenceUnit::None => return Err(RecurrenceError::NotRecurring),
            RecurrenceUnit::Daily => shift_local(from, tz, Step::Days(1))?,
            RecurrenceUnit::Weekly => shift_local(from, tz, Step::Days(7))?,
            RecurrenceUnit::Monthly => shift_local(from, tz, Step::Months(1))?,
            RecurrenceUnit::Interval { seconds } => from
                .checked_add_signed(interval_step(seconds)?)
                .ok_or(RecurrenceError::OutOfRange)?,
        };

        if let Some(RecurrenceEnd::Until(until)) = recurrence.end
            && next > until
        {
            return Err(RecurrenceError::Exhausted);
        }

        Ok(next)
    }

    /// Next occurrence after `from` for a job that has completed `completed` runs.
    pub fn next_for(
        recurrence: &ScheduleRecurrence,
        from: DateTime<Utc>,
        completed: u32,
    ) -> Result<DateTime<Utc>, RecurrenceError> {
        if let Some(RecurrenceEnd::Occurrences(limit)) = recurrence.end
            && completed >= limit
        {
            return Err(RecurrenceError::Exhausted);
        }
        Self::next(recurrence, from)
    }

    /// Advance a job that just completed its occurrence at `from`.
    ///
    /// When the job ran late and several occurrences already lie in the past,
    /// they are folded into a single run at the latest missed occurrence
    /// instead of firing once per occurrence. The calendar anchor is kept.
    pub fn advance(
        recurrence: &ScheduleRecurrence,
        from: DateTime<Utc>,
        now: DateTime<Utc>,
        completed: u32,
    ) -> Result<NextRun, RecurrenceError> {
        let mut run_at = Self::next_for(recurrence, from, completed)?;
        let mut skipped = 0;

        while run_at <= now && skipped < MAX_CATCH_UP_ITERATIONS {
            match Self::next(recurrence, run_at) {
                Ok(candidate) if candidate <= now => {
                    run_at = candidate;
                    skipped += 1;
                }
                _ => break,
            }
        }

        Ok(NextRun { run_at, skipped })
    }

    /// The next `n` occurrences after `from`, stopping early at the end condition.
    pub fn next_n(
        recurrence: &ScheduleRecurrence,
        from: DateTime<Utc>,
        n: usize,
    ) -> Result<Vec<DateTime<Utc>>, RecurrenceError> {
        let mut results = Vec::new();
        let mut current = from;
        for completed in 0..n {
            let completed = u32::try_from(completed).map_err(|_| RecurrenceError::OutOfRange)?;
            match Self::next_for(recurrence, current, completed + 1) {
                Ok(next) => {
                    results.push(next);
                    current = next;
                }
                Err(RecurrenceError::Exhausted) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(results)
    }
}

enum Step {
    Days(u64),
    Months(u32),
}

/// Add a calendar step in local time and map the result back to UTC.
fn shift_local(from: DateTime<Utc>, tz: Tz, step: Step) -> Result<DateTime<Utc>, RecurrenceError> {
    let local = from.with_timezone(&tz).naive_local();
    let shifted = match step {
        Step::Days(days) => local.checked_add_days(Days::new(days)),
        Step::Months(months) => local.checked_add_months(Months::new(months)),
    }
    .ok_or(RecurrenceError::OutOfRange)?;
    resolve_local(tz, shifted)
}

/// Map a local wall-clock time to UTC.
///
/// Ambiguous times (clocks fall back) take the earlier instant. Times inside
/// a gap (clocks spring forward) keep the offset in force before the gap,
/// which moves them forward by the gap length.
fn resolve_local(tz: Tz, local: NaiveDateTime) -> Result<DateTime<Utc>, RecurrenceError> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => Ok(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Ok(earliest.with_timezone(&Utc)),
        LocalResult::None => {
            let probe = local - chrono::Duration::hours(3);
            let offset = tz
                .offset_from_local_datetime(&probe)
                .earliest()
                .ok_or(RecurrenceError::OutOfRange)?
                .fix();
            Ok(Utc.from_utc_datetime(&(local - offset)))
        }
    }
}
