//! Schedule parsing and next occurrence calculation.
//!
//! Supports standard cron expressions, extended 6-field cron (with seconds),
//! shortcuts (@minutely, @hourly, @daily, ...), and interval expressions (@every).

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur when parsing or using schedules.
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

/// A parsed recurrence rule.
///
/// Serializes as its expression and timezone; deserializing re-parses both.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "ScheduleSpec", into = "ScheduleSpec")]
pub struct Schedule {
    expression: String,
    timezone: Tz,
    kind: ScheduleKind,
}

#[derive(Debug, Clone)]
enum ScheduleKind {
    Cron(Box<CronSchedule>),
    Interval(chrono::Duration),
}

#[derive(Serialize, Deserialize)]
struct ScheduleSpec {
    expression: String,
    #[serde(default = "default_timezone")]
    timezone: String,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl TryFrom<ScheduleSpec> for Schedule {
    type Error = ScheduleError;

    fn try_from(spec: ScheduleSpec) -> Result<Self, Self::Error> {
        Schedule::with_timezone(spec.expression, &spec.timezone)
    }
}

impl From<Schedule> for ScheduleSpec {
    fn from(schedule: Schedule) -> Self {
        ScheduleSpec {
            expression: schedule.expression,
            timezone: schedule.timezone.name().to_string(),
        }
    }
}

impl Schedule {
    /// Parse a schedule evaluated in UTC.
    ///
    /// Supports:
    /// - Standard 5-field cron: `minute hour day month weekday`
    /// - Extended 6-field cron: `second minute hour day month weekday`
    /// - Shortcuts: `@yearly`, `@monthly`, `@weekly`, `@daily`, `@hourly`, `@minutely`
    /// - Intervals: `@every 5m`, `@every 1h30m`
    pub fn new(expression: impl Into<String>) -> Result<Self, ScheduleError> {
        Self::with_timezone(expression, "UTC")
    }

    /// Parse a schedule evaluated in the given IANA timezone.
    pub fn with_timezone(
        expression: impl Into<String>,
        timezone: &str,
    ) -> Result<Self, ScheduleError> {
        let expression = expression.into();
        let timezone: Tz = timezone
            .parse()
            .map_err(|_| ScheduleError::InvalidTimezone(timezone.to_string()))?;
        let kind = parse_expression(&expression)?;

        Ok(Self {
            expression,
            timezone,
            kind,
        })
    }

    /// Get the first occurrence strictly after the given time.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        match &self.kind {
            ScheduleKind::Cron(schedule) => schedule
                .after(&after.with_timezone(&self.timezone))
                .next()
                .map(|dt| dt.with_timezone(&Utc))
                .ok_or(ScheduleError::NoMoreOccurrences),
            ScheduleKind::Interval(step) => after
                .checked_add_signed(*step)
                .ok_or(ScheduleError::NoMoreOccurrences),
        }
    }

    /// Get the next occurrence from now.
    pub fn next(&self) -> Result<DateTime<Utc>, ScheduleError> {
        self.next_after(Utc::now())
    }

    /// Get up to `n` consecutive occurrences after the given time.
    pub fn upcoming(
        &self,
        after: DateTime<Utc>,
        n: usize,
    ) -> Result<Vec<DateTime<Utc>>, ScheduleError> {
        let mut results = Vec::with_capacity(n);
        let mut current = after;
        for _ in 0..n {
            match self.next_after(current) {
                Ok(next) => {
                    results.push(next);
                    current = next;
                }
                Err(ScheduleError::NoMoreOccurrences) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(results)
    }

    /// Get the original expression string.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Get the timezone name.
    pub fn timezone(&self) -> &str {
        self.timezone.name()
    }
}

fn parse_expression(expression: &str) -> Result<ScheduleKind, ScheduleError> {
    let trimmed = expression.trim();
    if trimmed.starts_with('@') {
        parse_shortcut(trimmed)
    } else {
        parse_cron(trimmed)
    }
}

fn parse_shortcut(expression: &str) -> Result<ScheduleKind, ScheduleError> {
    let lowered = expression.to_lowercase();
    match lowered.as_str() {
        "@yearly" | "@annually" => parse_cron("0 0 1 1 *"),
        "@monthly" => parse_cron("0 0 1 * *"),
        "@weekly" => parse_cron("0 0 * * SUN"),
        "@daily" | "@midnight" => parse_cron("0 0 * * *"),
        "@hourly" => parse_cron("0 * * * *"),
        "@minutely" => parse_cron("* * * * *"),
        s => match s.strip_prefix("@every ") {
            Some(interval) => parse_interval(interval.trim()),
            None => Err(ScheduleError::InvalidCron(format!(
                "unknown shortcut: {}",
                expression
            ))),
        },
    }
}

/// Parse a duration string like "5m", "1h", "1h30m", "30s".
fn parse_interval(s: &str) -> Result<ScheduleKind, ScheduleError> {
    let invalid = || ScheduleError::InvalidInterval(s.to_string());
    let mut total_secs: u64 = 0;
    let mut current_num = String::new();

    for c in s.chars() {
        if c.is_ascii_digit() {
            current_num.push(c);
            continue;
        }
        let num: u64 = current_num.parse().map_err(|_| invalid())?;
        current_num.clear();
        let unit = match c {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            'd' => 86400,
            _ => return Err(invalid()),
        };
        total_secs = num
            .checked_mul(unit)
            .and_then(|secs| total_secs.checked_add(secs))
            .ok_or_else(invalid)?;
    }

    if !current_num.is_empty() || total_secs == 0 {
        return Err(invalid());
    }

    let step = chrono::Duration::from_std(Duration::from_secs(total_secs)).map_err(|_| invalid())?;
    Ok(ScheduleKind::Interval(step))
}

fn parse_cron(expression: &str) -> Result<ScheduleKind, ScheduleError> {
    let fields = expression.split_whitespace().count();
    let cron_expr = match fields {
        // The cron crate wants a leading seconds field.
        5 => format!("0 {}", expression),
        6 => expression.to_string(),
        _ => {
            return Err(ScheduleError::InvalidCron(format!(
                "expected 5 or 6 fields, got {}",
                fields
            )));
        }
    };

    let schedule = CronSchedule::from_str(&cron_expr)
        .map_err(|e| ScheduleError::InvalidCron(e.to_string()))?;
    Ok(ScheduleKind::Cron(Box::new(schedule)))
}
