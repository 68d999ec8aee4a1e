//! Trigger cadence for the periodic sweep.
//!
//! Accepts 5- or 6-field cron expressions, the usual shortcuts (`@daily`,
//! `@hourly`, ...) and fixed intervals (`@every 6h`), evaluated in a named
//! timezone.

use chrono::{DateTime, TimeDelta, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur when parsing or evaluating a schedule.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// Invalid cron expression.
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    /// Invalid interval expression.
    #[error("invalid interval expression: {0}")]
    InvalidInterval(String),

    /// Invalid timezone.
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    /// No more occurrences.
    #[error("no more occurrences")]
    NoMoreOccurrences,
}

#[derive(Debug, Clone)]
enum Cadence {
    Cron(Box<CronSchedule>),
    Every(TimeDelta),
}

/// A parsed trigger schedule.
#[derive(Debug, Clone)]
pub struct Schedule {
    expression: String,
    timezone: Tz,
    cadence: Cadence,
}

impl Schedule {
    /// Parse `expression` in UTC.
    pub fn new(expression: impl Into<String>) -> Result<Self, ScheduleError> {
        Self::with_timezone(expression, "UTC")
    }

    /// Parse `expression` evaluated in the named IANA timezone.
    pub fn with_timezone(
        expression: impl Into<String>,
        timezone: &str,
    ) -> Result<Self, ScheduleError> {
        let expression = expression.into();
        let timezone: Tz = timezone
            .parse()
            .map_err(|_| ScheduleError::InvalidTimezone(timezone.to_string()))?;
        let cadence = parse_expression(expression.trim())?;

        Ok(Self {
            expression,
            timezone,
            cadence,
        })
    }

    /// First occurrence strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        match &self.cadence {
            Cadence::Cron(schedule) => schedule
                .after(&after.with_timezone(&self.timezone))
                .next()
                .map(|dt| dt.with_timezone(&Utc))
                .ok_or(ScheduleError::NoMoreOccurrences),
            Cadence::Every(step) => {
                // Ticks are aligned to the Unix epoch so the cadence does not
                // drift with the instant it is queried from.
                let step_ms = step.num_milliseconds().max(1);
                after
                    .timestamp_millis()
                    .div_euclid(step_ms)
                    .checked_add(1)
                    .and_then(|n| n.checked_mul(step_ms))
                    .and_then(DateTime::from_timestamp_millis)
                    .ok_or(ScheduleError::NoMoreOccurrences)
            }
        }
    }

    /// Number of occurrences in `(after, until]`, counting at most `cap`.
    pub fn occurrences_between(
        &self,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
        cap: usize,
    ) -> usize {
        let mut count = 0;
        let mut cursor = after;
        while count < cap {
            match self.next_after(cursor) {
                Ok(next) if next <= until => {
                    count += 1;
                    cursor = next;
                }
                _ => break,
            }
        }
        count
    }

    /// The expression as written.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// The timezone name.
    pub fn timezone(&self) -> &str {
        self.timezone.name()
    }
}

impl FromStr for Schedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

fn parse_expression(expression: &str) -> Result<Cadence, ScheduleError> {
    let lower = expression.to_lowercase();
    let cron_expr = match lower.as_str() {
        "@yearly" | "@annually" => "0 0 1 1 *",
        "@monthly" => "0 0 1 * *",
        "@weekly" => "0 0 * * SUN",
        "@daily" | "@midnight" => "0 0 * * *",
        "@hourly" => "0 * * * *",
        s if s.starts_with("@every ") => return parse_interval(&s["@every ".len()..]),
        s if s.starts_with('@') => {
            return Err(ScheduleError::InvalidCron(format!(
                "unknown shortcut: {}",
                expression
            )));
        }
        _ => expression,
    };
    parse_cron(cron_expr)
}

fn parse_cron(expression: &str) -> Result<Cadence, ScheduleError> {
    let fields = expression.split_whitespace().count();
    let full = match fields {
        5 => format!("0 {}", expression),
        6 => expression.to_string(),
        n => {
            return Err(ScheduleError::InvalidCron(format!(
                "expected 5 or 6 fields, got {}",
                n
            )));
        }
    };

    CronSchedule::from_str(&full)
        .map(|schedule| Cadence::Cron(Box::new(schedule)))
        .map_err(|e| ScheduleError::InvalidCron(e.to_string()))
}

fn parse_interval(interval: &str) -> Result<Cadence, ScheduleError> {
    let duration = parse_duration(interval.trim())
        .ok_or_else(|| ScheduleError::InvalidInterval(interval.to_string()))?;
    TimeDelta::from_std(duration)
        .map(Cadence::Every)
        .map_err(|_| ScheduleError::InvalidInterval(interval.to_string()))
}

/// Parse durations like `30s`, `5m`, `1h30m`, `2d`.
fn parse_duration(s: &str) -> Option<Duration> {
    let mut total: u64 = 0;
    let mut digits = String::new();

    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let n: u64 = digits.parse().ok()?;
        digits.clear();
        let unit = match c {
            's' => 1,
            'm' => 60,
            'h' => 3_600,
            'd' => 86_400,
            _ => return None,
        };
        total = total.checked_add(n.checked_mul(unit)?)?;
    }

    (digits.is_empty() && total > 0).then(|| Duration::from_secs(total))
}
