//! Cron expressions evaluated in a timezone.
//!
//! Expressions use crontab conventions: 5 fields (minute precision) or 6
//! fields with a leading seconds field, day-of-week `0`-`7` with both `0` and
//! `7` meaning Sunday. A 7-field expression (trailing year) is passed to the
//! `cron` crate verbatim and uses its conventions (day-of-week `1` = Sunday).

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("cron expression {expression:?} has {count} fields, expected 5, 6 or 7")]
    FieldCount { expression: String, count: usize },

    #[error("invalid day-of-week {value:?} in cron expression {expression:?}")]
    DayOfWeek { expression: String, value: String },

    #[error("invalid cron expression {expression:?}: {message}")]
    InvalidExpression { expression: String, message: String },

    #[error("unknown timezone {0:?}")]
    UnknownTimezone(String),
}

/// A parsed cron schedule bound to a timezone.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: Schedule,
    timezone: Tz,
}

impl CronSchedule {
    /// Parses `expression` and resolves `timezone` (an IANA name such as
    /// `Europe/Rome`).
    pub fn parse(expression: &str, timezone: &str) -> Result<Self, ScheduleError> {
        let tz = Tz::from_str(timezone.trim())
            .map_err(|_| ScheduleError::UnknownTimezone(timezone.to_string()))?;
        Self::with_timezone(expression, tz)
    }

    pub fn with_timezone(expression: &str, timezone: Tz) -> Result<Self, ScheduleError> {
        let normalized = normalize_expression(expression)?;
        let schedule =
            Schedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidExpression {
                expression: expression.to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            expression: expression.trim().to_string(),
            schedule,
            timezone,
        })
    }

    /// The expression as configured.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// First firing strictly after `after`, in the schedule's timezone.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Tz>> {
        self.schedule
            .after(&after.with_timezone(&self.timezone))
            .next()
    }
}

impl std::fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.expression, self.timezone.name())
    }
}

/// Turns a crontab-style expression into the 6/7-field form the `cron` crate
/// parses.
fn normalize_expression(expression: &str) -> Result<String, ScheduleError> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    let mut fields: Vec<String> = match fields.len() {
        5 => std::iter::once("0")
            .chain(fields)
            .map(str::to_string)
            .collect(),
        6 => fields.into_iter().map(str::to_string).collect(),
        7 => return Ok(fields.join(" ")),
        count => {
            return Err(ScheduleError::FieldCount {
                expression: expression.to_string(),
                count,
            })
        }
    };

    fields[5] = translate_day_of_week(&fields[5]).map_err(|value| ScheduleError::DayOfWeek {
        expression: expression.to_string(),
        value,
    })?;
    Ok(fields.join(" "))
}

/// Maps a crontab day-of-week field (0/7 = Sunday) onto the `cron` crate's
/// numbering (1 = Sunday). Names (`MON-FRI`) are left alone.
fn translate_day_of_week(field: &str) -> Result<String, String> {
    field
        .split(',')
        .map(translate_day_of_week_item)
        .collect::<Result<Vec<_>, _>>()
        .map(|items| items.join(","))
}

fn translate_day_of_week_item(item: &str) -> Result<String, String> {
    let (range, step) = match item.split_once('/') {
        Some((range, step)) => (range, Some(step)),
        None => (item, None),
    };
    let suffix = step.map(|s| format!("/{}", s)).unwrap_or_default();

    if range == "*" || range == "?" {
        return Ok(item.to_string());
    }

    let number = |value: &str| -> Result<Option<u32>, String> {
        if value.is_empty() || !value.chars().all(|c| c.is_ascii_digit()) {
            return Ok(None);
        }
        match value.parse::<u32>() {
            Ok(n) if n <= 7 => Ok(Some(n)),
            _ => Err(item.to_string()),
        }
    };
    let shifted = |n: u32| if n == 7 { 1 } else { n + 1 };

    match range.split_once('-') {
        None => match number(range)? {
            Some(n) => Ok(format!("{}{}", shifted(n), suffix)),
            None => Ok(item.to_string()),
        },
        Some((start, end)) => match (number(start)?, number(end)?) {
            (Some(7), Some(7)) => Ok(format!("1{}", suffix)),
            (Some(0), Some(7)) => Ok(format!("1-7{}", suffix)),
            // e.g. 5-7 (Fri..Sun) becomes 6-7,1
            (Some(start), Some(7)) if step.is_none() => Ok(format!("{}-7,1", start + 1)),
            (Some(_), Some(7)) => Err(item.to_string()),
            (Some(start), Some(end)) if start <= end => {
                Ok(format!("{}-{}{}", shifted(start), shifted(end), suffix))
            }
            (None, None) => Ok(item.to_string()),
            _ => Err(item.to_string()),
        },
    }
}
