//! Cron expression parsing and next-run computation.
//!
//! Accepted grammar:
//!
//! ```text
//! [second] minute hour day-of-month month day-of-week
//! ```
//!
//! A 5-field expression fires at second 0. Day-of-week uses the usual
//! crontab numbering (`0`-`7`, both `0` and `7` are Sunday) or three-letter
//! names. Every field accepts `*`, lists, ranges and `/step`.

use std::str::FromStr;

use crate::error::{Result, SchedulerError};
use crate::types::Timestamp;

const DAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// A validated cron expression.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    inner: cron::Schedule,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let normalized = normalize(expression).map_err(|e| SchedulerError::schedule(expression, e))?;
        let inner = cron::Schedule::from_str(&normalized)
            .map_err(|e| SchedulerError::schedule(expression, e))?;
        Ok(Self {
            expression: expression.trim().to_string(),
            inner,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Smallest matching instant strictly after `reference`.
    pub fn next_after(&self, reference: Timestamp) -> Result<Timestamp> {
        self.inner
            .after(&reference)
            .find(|t| *t > reference)
            .ok_or_else(|| SchedulerError::schedule(&self.expression, "schedule never fires again"))
    }

    /// The next `count` matching instants after `reference`, ascending.
    pub fn upcoming(&self, reference: Timestamp, count: usize) -> Vec<Timestamp> {
        self.inner
            .after(&reference)
            .filter(|t| *t > reference)
            .take(count)
            .collect()
    }
}

/// Reject an expression before it reaches the store.
pub fn validate(expression: &str) -> Result<()> {
    CronSchedule::parse(expression).map(|_| ())
}

/// Compute the next run for `expression` relative to `reference`.
///
/// Pure and deterministic: identical inputs give identical outputs, and the
/// result is always strictly greater than `reference`.
pub fn compute_next_run(expression: &str, reference: Timestamp) -> Result<Timestamp> {
    CronSchedule::parse(expression)?.next_after(reference)
}

/// Rewrite a 5- or 6-field crontab expression into the 6-field form the
/// `cron` crate parses, translating numeric days of the week to names.
fn normalize(expression: &str) -> std::result::Result<String, String> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    let (second, rest) = match fields.len() {
        5 => ("0", &fields[..]),
        6 => (fields[0], &fields[1..]),
        0 => return Err("expression is empty".to_string()),
        n => return Err(format!("expected 5 or 6 fields, found {n}")),
    };
    let day_of_week = translate_day_of_week(rest[4])?;
    Ok(format!(
        "{second} {} {} {} {} {day_of_week}",
        rest[0], rest[1], rest[2], rest[3]
    ))
}

fn translate_day_of_week(field: &str) -> std::result::Result<String, String> {
    let mut days: Vec<String> = Vec::new();

    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => {
                let step: usize = step
                    .parse()
                    .map_err(|_| format!("invalid day-of-week step '{step}'"))?;
                if step == 0 {
                    return Err("day-of-week step must be positive".to_string());
                }
                (base, Some(step))
            }
            None => (item, None),
        };

        let span = match base.split_once('-') {
            Some((start, end)) => match (day_number(start)?, day_number(end)?) {
                (Some(start), Some(end)) => Some((start, end)),
                (None, None) => None,
                _ => return Err(format!("day-of-week range '{base}' mixes names and numbers")),
            },
            None if base == "*" => step.map(|_| (0, 6)),
            None => day_number(base)?.map(|day| (day, if step.is_some() { 6 } else { day })),
        };

        match span {
            Some((start, end)) => {
                if start > end {
                    return Err(format!("day-of-week range '{base}' runs backwards"));
                }
                for day in (start..=end).step_by(step.unwrap_or(1)) {
                    days.push(DAY_NAMES[day % 7].to_string());
                }
            }
            None => days.push(item.to_string()),
        }
    }

    let mut seen = std::collections::HashSet::new();
    days.retain(|d| seen.insert(d.clone()));
    Ok(days.join(","))
}

fn day_number(token: &str) -> std::result::Result<Option<usize>, String> {
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(None);
    }
    let day: usize = token
        .parse()
        .map_err(|_| format!("invalid day-of-week '{token}'"))?;
    if day > 7 {
        return Err(format!("day-of-week {day} is out of range 0-7"));
    }
    Ok(Some(day))
}
