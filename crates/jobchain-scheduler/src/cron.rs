//! Lightweight cron expression parser.
//! Supports: "MIN HOUR DOM MON DOW" (5-field, no seconds), evaluated in UTC.
//! Per field: *, ?, N, A-B, lists (A,B,C) and steps (*/N, A-B/N, A/N).
//! Month (JAN-DEC) and weekday (SUN-SAT) names are accepted; 7 is Sunday.
//! A sixth field is accepted only as `*` (the year column of the
//! `00 12 ? * MON-FRI *` form).
//!
//! Example: "0 12 * * MON-FRI" = weekdays at 12:00 UTC

use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use jobchain_core::{JobchainError, Result};

/// How far ahead `next_after` searches before giving up (covers leap days).
const SEARCH_DAYS: u32 = 366 * 5;

const MONTHS: &[&str] = &["JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC"];
const WEEKDAYS: &[&str] = &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

struct Field {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    /// Value of the first name.
    name_base: u32,
}

const MINUTE: Field = Field { name: "minute", min: 0, max: 59, names: &[], name_base: 0 };
const HOUR: Field = Field { name: "hour", min: 0, max: 23, names: &[], name_base: 0 };
const DAY_OF_MONTH: Field = Field { name: "day-of-month", min: 1, max: 31, names: &[], name_base: 0 };
const MONTH: Field = Field { name: "month", min: 1, max: 12, names: MONTHS, name_base: 1 };
const DAY_OF_WEEK: Field = Field { name: "day-of-week", min: 0, max: 7, names: WEEKDAYS, name_base: 0 };

/// A parsed schedule. Each field is a bitmask of allowed values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        let parts = match parts.as_slice() {
            [fields @ .., "*"] if fields.len() == 5 => fields,
            fields if fields.len() == 5 => fields,
            _ => {
                return Err(JobchainError::Config(format!(
                    "invalid cron expression '{expression}' (need 5 fields: MIN HOUR DOM MON DOW)"
                )));
            }
        };

        let mut days_of_week = parse_field(parts[4], &DAY_OF_WEEK)?;
        if contains(days_of_week, 7) {
            days_of_week = (days_of_week & !(1u64 << 7)) | 1;
        }

        Ok(Self {
            expression: expression.trim().to_string(),
            minutes: parse_field(parts[0], &MINUTE)?,
            hours: parse_field(parts[1], &HOUR)?,
            days_of_month: parse_field(parts[2], &DAY_OF_MONTH)?,
            months: parse_field(parts[3], &MONTH)?,
            days_of_week,
            dom_restricted: is_restricted(parts[2]),
            dow_restricted: is_restricted(parts[4]),
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First fire time strictly after `after`, at whole-minute resolution.
    /// `None` when nothing matches within five years (e.g. "0 0 30 2 *").
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let first_day = start.date_naive();
        let mut day = first_day;

        for _ in 0..SEARCH_DAYS {
            if self.matches_day(day) {
                for hour in members(self.hours, &HOUR) {
                    if day == first_day && hour < start.hour() {
                        continue;
                    }
                    for minute in members(self.minutes, &MINUTE) {
                        if day == first_day && hour == start.hour() && minute < start.minute() {
                            continue;
                        }
                        return day.and_hms_opt(hour, minute, 0).map(|t| t.and_utc());
                    }
                }
            }
            day = day.succ_opt()?;
        }
        None
    }

    fn matches_day(&self, day: NaiveDate) -> bool {
        if !contains(self.months, day.month()) {
            return false;
        }
        let dom = contains(self.days_of_month, day.day());
        let dow = contains(self.days_of_week, day.weekday().num_days_from_sunday());
        // Classic cron: when both day fields are restricted, either may match.
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }
}

impl std::fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.expression)
    }
}

impl std::str::FromStr for CronSchedule {
    type Err = JobchainError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn is_restricted(field: &str) -> bool {
    !(field.starts_with('*') || field == "?")
}

fn contains(mask: u64, value: u32) -> bool {
    mask & (1u64 << value) != 0
}

fn members(mask: u64, field: &Field) -> impl Iterator<Item = u32> {
    (field.min..=field.max).filter(move |v| contains(mask, *v))
}

/// Parse a cron field into a bitmask of matching values.
fn parse_field(raw: &str, field: &Field) -> Result<u64> {
    let invalid = |why: &str| JobchainError::Config(format!("cron {} field '{raw}': {why}", field.name));

    let mut mask = 0u64;
    for item in raw.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let n: u32 = step.parse().map_err(|_| invalid("bad step"))?;
                if n == 0 {
                    return Err(invalid("step must be positive"));
                }
                (range, n)
            }
            None => (item, 1),
        };

        let (lo, hi) = if range == "*" || range == "?" {
            (field.min, field.max)
        } else if let Some((a, b)) = range.split_once('-') {
            let lo = value(a, field).ok_or_else(|| invalid("bad value"))?;
            let hi = value(b, field).ok_or_else(|| invalid("bad value"))?;
            (lo, hi)
        } else {
            let v = value(range, field).ok_or_else(|| invalid("bad value"))?;
            // "A/N" runs from A to the end of the field.
            if item.contains('/') { (v, field.max) } else { (v, v) }
        };
        if lo > hi {
            return Err(invalid("range start after end"));
        }

        for v in (lo..=hi).step_by(step as usize) {
            mask |= 1u64 << v;
        }
    }
    Ok(mask)
}

fn value(raw: &str, field: &Field) -> Option<u32> {
    let v = match raw.parse::<u32>() {
        Ok(v) => v,
        Err(_) => {
            let index = field.names.iter().position(|n| n.eq_ignore_ascii_case(raw))?;
            field.name_base + index as u32
        }
    };
    (field.min..=field.max).contains(&v).then_some(v)
}
