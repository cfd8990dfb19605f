//! Cadence expressions.
//!
//! Jobs are configured with standard 5-field crontab expressions
//! (`min hour dom month dow`, Sunday = 0 or 7). The `cron` crate wants a
//! leading seconds field and numbers weekdays from 1 = Sunday, so 5-field
//! expressions are rewritten with a `0` seconds field and named weekdays.
//! 6/7-field expressions and `@daily`-style shorthands pass through as-is.
//!
//! Day-of-month and day-of-week restrictions are combined with AND, not the
//! crontab OR.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Local, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CadenceError {
    #[error("empty cadence expression")]
    Empty,

    #[error("expected 5, 6 or 7 fields, found {0}")]
    FieldCount(usize),

    #[error("day-of-week value '{0}' is outside 0-7")]
    Weekday(String),

    #[error("{0}")]
    Parse(String),
}

/// Time zone cadences are evaluated in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CadenceZone {
    #[default]
    Utc,
    Local,
}

/// A parsed cadence expression.
#[derive(Debug, Clone)]
pub struct Cadence {
    expr: String,
    schedule: Schedule,
    zone: CadenceZone,
}

impl Cadence {
    /// Parse an expression evaluated in UTC.
    pub fn parse(expr: &str) -> Result<Self, CadenceError> {
        Self::parse_in(expr, CadenceZone::Utc)
    }

    pub fn parse_in(expr: &str, zone: CadenceZone) -> Result<Self, CadenceError> {
        let normalized = normalize(expr)?;
        let schedule =
            Schedule::from_str(&normalized).map_err(|e| CadenceError::Parse(e.to_string()))?;
        Ok(Self {
            expr: expr.trim().to_string(),
            schedule,
            zone,
        })
    }

    /// The expression as configured.
    pub fn expr(&self) -> &str {
        &self.expr
    }

    pub fn zone(&self) -> CadenceZone {
        self.zone
    }

    /// First fire time strictly after `after`, or `None` if the cadence never fires again.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.zone {
            CadenceZone::Utc => self.schedule.after(&after).next(),
            CadenceZone::Local => self
                .schedule
                .after(&after.with_timezone(&Local))
                .next()
                .map(|t| t.with_timezone(&Utc)),
        }
    }

    /// The next `count` fire times after `after`.
    pub fn upcoming(&self, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut out = Vec::with_capacity(count);
        let mut cursor = after;
        while out.len() < count {
            match self.next_after(cursor) {
                Some(next) => {
                    out.push(next);
                    cursor = next;
                }
                None => break,
            }
        }
        out
    }
}

impl FromStr for Cadence {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expr)
    }
}

// ============================================================================
// Crontab translation
// ============================================================================

fn normalize(expr: &str) -> Result<String, CadenceError> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Err(CadenceError::Empty);
    }
    if expr.starts_with('@') {
        return Ok(expr.to_string());
    }

    let fields: Vec<&str> = expr.split_whitespace().collect();
    match fields.len() {
        5 => {
            let weekdays = translate_weekdays(fields[4])?;
            Ok(format!(
                "0 {} {} {} {} {}",
                fields[0], fields[1], fields[2], fields[3], weekdays
            ))
        }
        6 | 7 => Ok(fields.join(" ")),
        n => Err(CadenceError::FieldCount(n)),
    }
}

fn weekday_name(value: &str) -> Result<String, CadenceError> {
    match value.parse::<usize>() {
        Ok(n) if n <= 7 => Ok(WEEKDAYS[n % 7].to_string()),
        Ok(_) => Err(CadenceError::Weekday(value.to_string())),
        Err(_) => Ok(value.to_string()),
    }
}

fn translate_weekdays(field: &str) -> Result<String, CadenceError> {
    let mut items = Vec::new();

    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (item, None),
        };

        let translated = match range.split_once('-') {
            // A range ending on 7 wraps past Saturday; Sunday sorts first in cron.
            Some((start, "7")) => {
                let start_name = weekday_name(start)?;
                if start_name != "SUN" {
                    items.push("SUN".to_string());
                }
                format!("{start_name}-SAT")
            }
            Some((start, end)) => format!("{}-{}", weekday_name(start)?, weekday_name(end)?),
            None => weekday_name(range)?,
        };

        items.push(match step {
            Some(step) => format!("{translated}/{step}"),
            None => translated,
        });
    }

    Ok(items.join(","))
}
