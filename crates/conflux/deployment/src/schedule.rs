//! Schedule evaluation
//!
//! Cron expressions accept the classic 5-field form (minute through day of
//! week) as well as the 6- and 7-field forms with seconds and year.
//! Evaluation happens in the schedule's timezone, so daylight saving
//! shifts follow local wall-clock time.

use crate::error::{DeploymentError, Result};
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use conflux_types::Schedule;
use std::str::FromStr;

/// Check that a schedule can be evaluated
pub fn validate(schedule: &Schedule) -> Result<()> {
    match schedule {
        Schedule::Cron {
            expression,
            timezone,
        } => {
            parse_cron(expression)?;
            parse_timezone(timezone.as_deref())?;
            Ok(())
        }
        Schedule::Interval { every, .. } => {
            if every.as_millis() == 0 {
                return Err(DeploymentError::InvalidSchedule(
                    "interval must be at least one millisecond".into(),
                ));
            }
            chrono::Duration::from_std(*every)
                .map(|_| ())
                .map_err(|e| DeploymentError::InvalidSchedule(e.to_string()))
        }
    }
}

/// First fire time strictly after `after`, if the schedule has one
pub fn next_after(schedule: &Schedule, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    match schedule {
        Schedule::Cron {
            expression,
            timezone,
        } => {
            let cron = parse_cron(expression)?;
            let tz = parse_timezone(timezone.as_deref())?;
            Ok(cron
                .after(&after.with_timezone(&tz))
                .next()
                .map(|t| t.with_timezone(&Utc)))
        }
        Schedule::Interval { every, anchor } => {
            validate(schedule)?;
            let every_ms = every.as_millis() as i64;
            let anchor = anchor
                .or_else(|| Utc.timestamp_opt(0, 0).single())
                .unwrap_or(after);
            if anchor > after {
                return Ok(Some(anchor));
            }
            let elapsed_ms = (after - anchor).num_milliseconds();
            let periods = elapsed_ms / every_ms + 1;
            Ok(periods
                .checked_mul(every_ms)
                .map(chrono::Duration::milliseconds)
                .and_then(|offset| anchor.checked_add_signed(offset)))
        }
    }
}

/// The next `count` fire times strictly after `after`
pub fn upcoming(
    schedule: &Schedule,
    after: DateTime<Utc>,
    count: usize,
) -> Result<Vec<DateTime<Utc>>> {
    let mut times = Vec::with_capacity(count);
    let mut cursor = after;
    while times.len() < count {
        match next_after(schedule, cursor)? {
            Some(next) => {
                times.push(next);
                cursor = next;
            }
            None => break,
        }
    }
    Ok(times)
}

fn parse_cron(expression: &str) -> Result<cron::Schedule> {
    let fields = expression.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {}", expression.trim())
    } else {
        expression.trim().to_string()
    };
    cron::Schedule::from_str(&normalized)
        .map_err(|e| DeploymentError::InvalidSchedule(format!("'{}': {}", expression, e)))
}

fn parse_timezone(timezone: Option<&str>) -> Result<Tz> {
    match timezone {
        None => Ok(Tz::UTC),
        Some(name) => name
            .parse()
            .map_err(|_| DeploymentError::InvalidSchedule(format!("unknown timezone '{}'", name))),
    }
}
