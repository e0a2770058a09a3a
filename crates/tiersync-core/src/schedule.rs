//! Parsed task schedules with next-due computation.
//!
//! Accepted forms:
//! - `manual`: only runs on explicit request
//! - `once`: due immediately after registration, never again
//! - `@every 30m`, `every 1h30m`: fixed interval (units `s`, `m`, `h`, `d`)
//! - `@hourly`, `@daily`, `@weekly`
//! - `daily 02:00`, `weekly sun 03:30`
//! - five-field cron: `minute hour day-of-month month day-of-week`
//!
//! All times are evaluated in UTC.

use std::fmt;
use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Upper bound on cron search steps; an expression that never matches
/// (e.g. `0 0 31 2 *`) yields no next time instead of looping.
const MAX_CRON_STEPS: usize = 20_000;

/// When a sync task becomes due.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Schedule {
    /// Runs only on an explicit run-now request.
    Manual,
    /// Due at registration, never again.
    Once,
    /// Due every fixed interval after the previous due time.
    Interval(StdDuration),
    /// Due at every minute matching the expression.
    Cron(CronExpr),
}

impl Schedule {
    /// Parses a schedule expression.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ValidationError` for unknown forms, zero intervals
    /// and out-of-range cron fields.
    pub fn parse(expr: &str) -> CoreResult<Self> {
        let trimmed = expr.trim();
        let lower = trimmed.to_ascii_lowercase();
        let mut words = lower.split_whitespace();
        let first = words
            .next()
            .ok_or_else(|| CoreError::validation("schedule expression is empty"))?;

        match first {
            "manual" => Ok(Self::Manual),
            "once" => Ok(Self::Once),
            "@hourly" => CronExpr::parse("0 * * * *").map(Self::Cron),
            "@daily" => CronExpr::parse("0 0 * * *").map(Self::Cron),
            "@weekly" => CronExpr::parse("0 0 * * 0").map(Self::Cron),
            "@every" | "every" => {
                let rest: Vec<&str> = words.collect();
                let interval = parse_interval(&rest.concat())?;
                Ok(Self::Interval(interval))
            }
            "daily" => {
                let (hour, minute) = parse_clock(words.next())?;
                CronExpr::parse(&format!("{minute} {hour} * * *")).map(Self::Cron)
            }
            "weekly" => {
                let day = words
                    .next()
                    .ok_or_else(|| CoreError::validation("weekly schedule needs a weekday"))?;
                let dow = parse_weekday(day)?;
                let (hour, minute) = parse_clock(words.next())?;
                CronExpr::parse(&format!("{minute} {hour} * * {dow}")).map(Self::Cron)
            }
            _ => CronExpr::parse(trimmed).map(Self::Cron),
        }
    }

    /// First due time for a schedule registered at `now`.
    #[must_use]
    pub fn first_due(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Manual => None,
            Self::Once => Some(now),
            Self::Interval(_) | Self::Cron(_) => self.next_after(now),
        }
    }

    /// Next due time strictly after `after`.
    #[must_use]
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Manual | Self::Once => None,
            Self::Interval(interval) => {
                let step = Duration::from_std(*interval).ok()?;
                after.checked_add_signed(step)
            }
            Self::Cron(expr) => expr.next_after(after),
        }
    }

    /// Whether the task is removed after its first completed run.
    #[must_use]
    pub fn is_one_shot(&self) -> bool {
        matches!(self, Self::Once)
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Manual => f.write_str("manual"),
            Self::Once => f.write_str("once"),
            Self::Interval(interval) => write!(f, "@every {}s", interval.as_secs()),
            Self::Cron(expr) => f.write_str(&expr.source),
        }
    }
}

impl FromStr for Schedule {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Schedule {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Schedule> for String {
    fn from(value: Schedule) -> Self {
        value.to_string()
    }
}

/// Five-field cron expression stored as per-field bitsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpr {
    /// Parses `minute hour day-of-month month day-of-week`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ValidationError` on a wrong field count or an
    /// out-of-range value.
    pub fn parse(expr: &str) -> CoreResult<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CoreError::validation(format!(
                "cron expression `{expr}` must have 5 fields, found {}",
                fields.len()
            )));
        }

        let mut days_of_week = parse_field(fields[4], 0, 7)?;
        // 7 is an alias for Sunday.
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Self {
            source: fields.join(" "),
            minutes: parse_field(fields[0], 0, 59)?,
            hours: parse_field(fields[1], 0, 23)?,
            days_of_month: parse_field(fields[2], 1, 31)?,
            months: parse_field(fields[3], 1, 12)?,
            days_of_week,
            dom_restricted: fields[2] != "*",
            dow_restricted: fields[4] != "*",
        })
    }

    fn day_matches(&self, day: u32, weekday: u32) -> bool {
        let dom = bit(self.days_of_month, day);
        let dow = bit(self.days_of_week, weekday);
        match (self.dom_restricted, self.dow_restricted) {
            // Classic cron: when both are restricted either may match.
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// Next matching minute strictly after `after`.
    #[must_use]
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = after.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);

        for _ in 0..MAX_CRON_STEPS {
            if !bit(self.months, t.month()) {
                let (year, month) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()?;
                continue;
            }
            if !self.day_matches(t.day(), t.weekday().num_days_from_sunday()) {
                let next_day = t.date_naive().succ_opt()?.and_hms_opt(0, 0, 0)?;
                t = Utc.from_utc_datetime(&next_day);
                continue;
            }
            if !bit(self.hours, t.hour()) {
                t = t.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if !bit(self.minutes, t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t);
        }

        None
    }
}

fn bit(set: u64, value: u32) -> bool {
    set & (1u64 << value) != 0
}

fn parse_field(field: &str, min: u32, max: u32) -> CoreResult<u64> {
    let mut set = 0u64;

    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| CoreError::validation(format!("invalid cron step `{part}`")))?;
                if step == 0 {
                    return Err(CoreError::validation(format!("cron step must be > 0 in `{part}`")));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, min, max)?, parse_value(b, min, max)?)
        } else {
            let value = parse_value(range, min, max)?;
            // `5/15` means "from 5 to the end of the range every 15".
            if step > 1 {
                (value, max)
            } else {
                (value, value)
            }
        };

        if start > end {
            return Err(CoreError::validation(format!("invalid cron range `{part}`")));
        }

        let mut value = start;
        while value <= end {
            set |= 1u64 << value;
            value += step;
        }
    }

    Ok(set)
}

fn parse_value(raw: &str, min: u32, max: u32) -> CoreResult<u32> {
    let value: u32 = raw
        .parse()
        .map_err(|_| CoreError::validation(format!("invalid cron value `{raw}`")))?;
    if value < min || value > max {
        return Err(CoreError::validation(format!(
            "cron value {value} outside {min}-{max}"
        )));
    }
    Ok(value)
}

fn parse_interval(raw: &str) -> CoreResult<StdDuration> {
    if raw.is_empty() {
        return Err(CoreError::validation("interval is empty"));
    }

    let mut total = 0u64;
    let mut digits = String::new();
    for ch in raw.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let amount: u64 = digits
            .parse()
            .map_err(|_| CoreError::validation(format!("invalid interval `{raw}`")))?;
        let unit = match ch {
            's' => 1,
            'm' => 60,
            'h' => 3_600,
            'd' => 86_400,
            _ => {
                return Err(CoreError::validation(format!(
                    "unknown interval unit `{ch}` in `{raw}`"
                )))
            }
        };
        total = total.saturating_add(amount.saturating_mul(unit));
        digits.clear();
    }
    if !digits.is_empty() {
        return Err(CoreError::validation(format!(
            "interval `{raw}` is missing a unit"
        )));
    }
    if total == 0 {
        return Err(CoreError::validation("interval must be > 0"));
    }

    Ok(StdDuration::from_secs(total))
}

fn parse_clock(raw: Option<&str>) -> CoreResult<(u32, u32)> {
    let raw = raw.ok_or_else(|| CoreError::validation("schedule needs a HH:MM time"))?;
    let (hour, minute) = raw
        .split_once(':')
        .ok_or_else(|| CoreError::validation(format!("invalid time `{raw}`")))?;
    let hour = parse_value(hour, 0, 23)?;
    let minute = parse_value(minute, 0, 59)?;
    Ok((hour, minute))
}

fn parse_weekday(raw: &str) -> CoreResult<u32> {
    let day = match raw {
        "sun" | "sunday" => 0,
        "mon" | "monday" => 1,
        "tue" | "tuesday" => 2,
        "wed" | "wednesday" => 3,
        "thu" | "thursday" => 4,
        "fri" | "friday" => 5,
        "sat" | "saturday" => 6,
        _ => return Err(CoreError::validation(format!("unknown weekday `{raw}`"))),
    };
    Ok(day)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_daily_schedule() {
        let schedule = Schedule::parse("daily 02:00").unwrap();
        assert_eq!(
            schedule.next_after(at(2024, 3, 10, 1, 30)),
            Some(at(2024, 3, 10, 2, 0))
        );
        assert_eq!(
            schedule.next_after(at(2024, 3, 10, 2, 0)),
            Some(at(2024, 3, 11, 2, 0))
        );
    }

    #[test]
    fn test_interval_schedule() {
        let schedule = Schedule::parse("@every 1h30m").unwrap();
        assert_eq!(schedule, Schedule::Interval(StdDuration::from_secs(5_400)));
        assert_eq!(
            schedule.first_due(at(2024, 1, 1, 0, 0)),
            Some(at(2024, 1, 1, 1, 30))
        );
    }

    #[test]
    fn test_weekly_and_month_rollover() {
        let schedule = Schedule::parse("weekly sun 03:30").unwrap();
        // 2024-03-13 is a Wednesday.
        assert_eq!(
            schedule.next_after(at(2024, 3, 13, 12, 0)),
            Some(at(2024, 3, 17, 3, 30))
        );

        let yearly = Schedule::parse("0 0 1 1 *").unwrap();
        assert_eq!(
            yearly.next_after(at(2024, 6, 1, 0, 0)),
            Some(at(2025, 1, 1, 0, 0))
        );
    }

    #[test]
    fn test_cron_steps_and_lists() {
        let schedule = Schedule::parse("*/15 9-17 * * 1-5").unwrap();
        // Saturday 2024-03-16 rolls to Monday 09:00.
        assert_eq!(
            schedule.next_after(at(2024, 3, 16, 10, 0)),
            Some(at(2024, 3, 18, 9, 0))
        );
        assert_eq!(
            schedule.next_after(at(2024, 3, 18, 9, 0)),
            Some(at(2024, 3, 18, 9, 15))
        );
    }

    #[test]
    fn test_manual_and_once() {
        let now = at(2024, 1, 1, 0, 0);
        assert_eq!(Schedule::parse("manual").unwrap().first_due(now), None);
        let once = Schedule::parse("once").unwrap();
        assert_eq!(once.first_due(now), Some(now));
        assert_eq!(once.next_after(now), None);
        assert!(once.is_one_shot());
    }

    #[test]
    fn test_impossible_cron_yields_none() {
        let schedule = Schedule::parse("0 0 31 2 *").unwrap();
        assert_eq!(schedule.next_after(at(2024, 1, 1, 0, 0)), None);
    }

    #[test]
    fn test_invalid_expressions() {
        assert!(Schedule::parse("").is_err());
        assert!(Schedule::parse("@every 0m").is_err());
        assert!(Schedule::parse("@every 10").is_err());
        assert!(Schedule::parse("daily 25:00").is_err());
        assert!(Schedule::parse("61 * * * *").is_err());
        assert!(Schedule::parse("* * *").is_err());
    }

    #[test]
    fn test_serde_roundtrip_uses_expression() {
        let schedule = Schedule::parse("daily 02:00").unwrap();
        let json = serde_json::to_string(&schedule).unwrap();
        assert_eq!(json, "\"0 2 * * *\"");
        let back: Schedule = serde_json::from_str(&json).unwrap();
        assert_eq!(back, schedule);
    }
}
