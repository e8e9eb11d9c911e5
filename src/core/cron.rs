//! Six-field cron expression parsing and next-occurrence calculation.
//!
//! Expressions have the form `S M H DoM Mo DoW` (seconds through weekday,
//! 0 = Sunday), evaluated in UTC. Each field accepts `*`, single values,
//! inclusive ranges, `/step` variants, and comma-separated unions.
//!
//! Day-of-month and day-of-week combine with OR semantics when both are
//! restricted, matching the behaviour of classic cron: `0 0 0 1 * 1` fires
//! on the first of the month and on every Monday.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// How far ahead of the reference instant `next_after` will search before
/// declaring an expression unschedulable. Covers every leap-year pattern.
const HORIZON_DAYS: i64 = 366 * 5;

/// Errors that can occur when parsing or evaluating cron expressions.
#[derive(Debug, Error)]
pub enum CronError {
    /// The expression does not parse.
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidExpression { expression: String, reason: String },

    /// The expression parses but has no occurrence within the search horizon.
    #[error("unschedulable cron expression '{0}': no occurrence within the search horizon")]
    Unschedulable(String),
}

/// Value range of a single cron field.
#[derive(Debug, Clone, Copy)]
struct FieldRange {
    name: &'static str,
    min: u32,
    max: u32,
}

const SECONDS: FieldRange = FieldRange { name: "second", min: 0, max: 59 };
const MINUTES: FieldRange = FieldRange { name: "minute", min: 0, max: 59 };
const HOURS: FieldRange = FieldRange { name: "hour", min: 0, max: 23 };
const DAYS_OF_MONTH: FieldRange = FieldRange { name: "day-of-month", min: 1, max: 31 };
const MONTHS: FieldRange = FieldRange { name: "month", min: 1, max: 12 };
const DAYS_OF_WEEK: FieldRange = FieldRange { name: "day-of-week", min: 0, max: 6 };

/// Set of permitted values for one field, stored as a bitmask.
///
/// `wildcard` records whether the field was written as a bare `*`, which
/// matters for the DoM/DoW OR rule: only non-`*` fields count as restricted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet {
    bits: u64,
    wildcard: bool,
}

impl FieldSet {
    fn contains(&self, value: u32) -> bool {
        value < 64 && self.bits & (1u64 << value) != 0
    }

    fn is_wildcard(&self) -> bool {
        self.wildcard
    }
}

/// A parsed six-field cron expression, pinned to UTC.
#[derive(Debug, Clone)]
pub struct CronExpr {
    expression: String,
    seconds: FieldSet,
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
}

impl CronExpr {
    /// Parse a six-field cron expression.
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let invalid = |reason: String| CronError::InvalidExpression {
            expression: expression.to_string(),
            reason,
        };

        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 6 {
            return Err(invalid(format!("expected 6 fields, got {}", fields.len())));
        }

        Ok(Self {
            expression: expression.to_string(),
            seconds: parse_field(fields[0], SECONDS).map_err(&invalid)?,
            minutes: parse_field(fields[1], MINUTES).map_err(&invalid)?,
            hours: parse_field(fields[2], HOURS).map_err(&invalid)?,
            days_of_month: parse_field(fields[3], DAYS_OF_MONTH).map_err(&invalid)?,
            months: parse_field(fields[4], MONTHS).map_err(&invalid)?,
            days_of_week: parse_field(fields[5], DAYS_OF_WEEK).map_err(&invalid)?,
        })
    }

    /// Get the original expression string.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Find the smallest instant strictly greater than `after` whose UTC
    /// wall-clock fields satisfy the expression.
    ///
    /// The evaluator advances field by field in increasing significance,
    /// normalizing carries, so each iteration either matches or jumps the
    /// candidate past an entire non-matching month, day, hour, or minute.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, CronError> {
        let horizon = after + Duration::days(HORIZON_DAYS);
        let unschedulable = || CronError::Unschedulable(self.expression.clone());

        // Strictly greater than `after`, at whole-second resolution.
        let mut candidate = (after + Duration::seconds(1))
            .with_nanosecond(0)
            .unwrap_or(after + Duration::seconds(1));

        loop {
            if candidate > horizon {
                return Err(unschedulable());
            }

            if !self.months.contains(candidate.month()) {
                candidate = start_of_next_month(candidate).ok_or_else(unschedulable)?;
                continue;
            }

            if !self.day_matches(candidate.date_naive()) {
                candidate = start_of_next_day(candidate).ok_or_else(unschedulable)?;
                continue;
            }

            if !self.hours.contains(candidate.hour()) {
                candidate = start_of_next_hour(candidate);
                continue;
            }

            if !self.minutes.contains(candidate.minute()) {
                candidate = start_of_next_minute(candidate);
                continue;
            }

            if !self.seconds.contains(candidate.second()) {
                candidate += Duration::seconds(1);
                continue;
            }

            return Ok(candidate);
        }
    }

    /// Day matching with OR semantics: when both DoM and DoW are restricted,
    /// a day matches if either is satisfied; when only one is restricted, it
    /// alone applies.
    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom_ok = self.days_of_month.contains(date.day());
        let dow_ok = self.days_of_week.contains(date.weekday().num_days_from_sunday());

        match (self.days_of_month.is_wildcard(), self.days_of_week.is_wildcard()) {
            (true, true) => true,
            (false, true) => dom_ok,
            (true, false) => dow_ok,
            (false, false) => dom_ok || dow_ok,
        }
    }
}

impl FromStr for CronExpr {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expression)
    }
}

impl Serialize for CronExpr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.expression)
    }
}

impl<'de> Deserialize<'de> for CronExpr {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Parse one field into its permitted-value set.
fn parse_field(text: &str, range: FieldRange) -> Result<FieldSet, String> {
    if text.is_empty() {
        return Err(format!("empty {} field", range.name));
    }

    let mut bits = 0u64;
    for part in text.split(',') {
        if part.is_empty() {
            return Err(format!("empty value in {} field", range.name));
        }
        bits |= parse_part(part, range)?;
    }

    Ok(FieldSet {
        bits,
        wildcard: text == "*",
    })
}

/// Parse a single comma-separated part: `*`, `N`, `A-B`, or any of those
/// with a `/step` suffix.
fn parse_part(part: &str, range: FieldRange) -> Result<u64, String> {
    let (base, step) = match part.split_once('/') {
        Some((base, step_text)) => {
            let step: u32 = step_text
                .parse()
                .map_err(|_| format!("invalid step '{}' in {} field", step_text, range.name))?;
            if step == 0 {
                return Err(format!("step must be at least 1 in {} field", range.name));
            }
            (base, step)
        }
        None => (part, 1),
    };

    let (start, end) = if base == "*" {
        (range.min, range.max)
    } else if let Some((lo_text, hi_text)) = base.split_once('-') {
        let lo = parse_value(lo_text, range)?;
        let hi = parse_value(hi_text, range)?;
        if lo > hi {
            return Err(format!("inverted range {}-{} in {} field", lo, hi, range.name));
        }
        (lo, hi)
    } else {
        let value = parse_value(base, range)?;
        if part.contains('/') {
            // `N/step` means stepping from N to the field maximum.
            (value, range.max)
        } else {
            (value, value)
        }
    };

    let mut bits = 0u64;
    let mut v = start;
    while v <= end {
        bits |= 1u64 << v;
        v += step;
    }
    Ok(bits)
}

fn parse_value(text: &str, range: FieldRange) -> Result<u32, String> {
    let value: u32 = text
        .parse()
        .map_err(|_| format!("invalid value '{}' in {} field", text, range.name))?;
    if value < range.min || value > range.max {
        return Err(format!(
            "{} value {} out of range {}-{}",
            range.name, value, range.min, range.max
        ));
    }
    Ok(value)
}

fn start_of_next_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    let truncated = t.with_second(0).and_then(|t| t.with_nanosecond(0)).unwrap_or(t);
    truncated + Duration::minutes(1)
}

fn start_of_next_hour(t: DateTime<Utc>) -> DateTime<Utc> {
    let truncated = t
        .with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t);
    truncated + Duration::hours(1)
}

fn start_of_next_day(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let next = t.date_naive().succ_opt()?;
    Some(Utc.from_utc_datetime(&next.and_hms_opt(0, 0, 0)?))
}

fn start_of_next_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    Some(Utc.from_utc_datetime(&first.and_hms_opt(0, 0, 0)?))
}
