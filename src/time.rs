//! Time dimension handling: epoch rescaling, pattern parsing, truncation and rollup rules.
//!
//! Timestamps are stored as unsigned epoch values in the dimension's precision
//! (seconds, or microseconds for `microtime` dimensions).

use crate::error::DbError;
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};
use serde::Deserialize;

const MICROS_PER_SEC: u64 = 1_000_000;
const SECS_PER_DAY: u64 = 86_400;

/// Calendar unit used for truncation and rollups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl TimeUnit {
    pub fn parse(s: &str) -> Option<TimeUnit> {
        let s = s.trim().to_ascii_lowercase();
        let s = s.strip_suffix('s').unwrap_or(&s);
        Some(match s {
            "second" | "sec" => TimeUnit::Second,
            "minute" | "min" => TimeUnit::Minute,
            "hour" => TimeUnit::Hour,
            "day" => TimeUnit::Day,
            "week" => TimeUnit::Week,
            "month" => TimeUnit::Month,
            "year" => TimeUnit::Year,
            _ => return None,
        })
    }

    /// Nominal length in seconds; months and years are approximated (30 and 365 days).
    pub fn nominal_secs(self) -> u64 {
        match self {
            TimeUnit::Second => 1,
            TimeUnit::Minute => 60,
            TimeUnit::Hour => 3_600,
            TimeUnit::Day => SECS_PER_DAY,
            TimeUnit::Week => 7 * SECS_PER_DAY,
            TimeUnit::Month => 30 * SECS_PER_DAY,
            TimeUnit::Year => 365 * SECS_PER_DAY,
        }
    }
}

/// Unit of a numeric epoch input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochUnit {
    Seconds,
    Millis,
    Micros,
}

/// How a time dimension's input field is encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeFormat {
    /// Numeric input. `None` means the value is already in the dimension's precision.
    Epoch(Option<EpochUnit>),
    /// strptime-style pattern, e.g. `%Y-%m-%d %H:%M:%S`.
    Pattern(String),
}

impl TimeFormat {
    pub fn parse(format: Option<&str>) -> TimeFormat {
        match format.unwrap_or("") {
            "" => TimeFormat::Epoch(None),
            "posix" => TimeFormat::Epoch(Some(EpochUnit::Seconds)),
            "millis" => TimeFormat::Epoch(Some(EpochUnit::Millis)),
            "micros" => TimeFormat::Epoch(Some(EpochUnit::Micros)),
            pattern => TimeFormat::Pattern(pattern.to_string()),
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, TimeFormat::Epoch(_))
    }
}

/// Converts an epoch value in `input` units to seconds or microseconds.
pub fn rescale_epoch(value: u64, input: Option<EpochUnit>, micro_precision: bool) -> u64 {
    match (input, micro_precision) {
        (Some(EpochUnit::Seconds), true) => value.saturating_mul(MICROS_PER_SEC),
        (Some(EpochUnit::Millis), true) => value.saturating_mul(1_000),
        (Some(EpochUnit::Millis), false) => value / 1_000,
        (Some(EpochUnit::Micros), false) => value / MICROS_PER_SEC,
        _ => value,
    }
}

fn invalid(value: &str) -> DbError {
    DbError::InvalidTimeFormat {
        value: value.to_string(),
    }
}

fn to_epoch(dt: NaiveDateTime, micro_precision: bool, value: &str) -> Result<u64, DbError> {
    let utc = dt.and_utc();
    let ts = if micro_precision {
        utc.timestamp_micros()
    } else {
        utc.timestamp()
    };
    u64::try_from(ts).map_err(|_| invalid(value))
}

/// Parses a numeric epoch field (ingestion path).
pub fn parse_epoch(value: &str, input: Option<EpochUnit>, micro_precision: bool) -> Result<u64, DbError> {
    let raw = value.trim().parse::<u64>().map_err(|_| invalid(value))?;
    Ok(rescale_epoch(raw, input, micro_precision))
}

/// Parses `value` against a strptime-style pattern. Date-only patterns resolve to midnight UTC.
pub fn parse_pattern(value: &str, pattern: &str, micro_precision: bool) -> Result<u64, DbError> {
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, pattern) {
        return to_epoch(dt, micro_precision, value);
    }
    let date = NaiveDate::parse_from_str(value, pattern).map_err(|_| invalid(value))?;
    let dt = date.and_hms_opt(0, 0, 0).ok_or_else(|| invalid(value))?;
    to_epoch(dt, micro_precision, value)
}

/// Decodes a filter literal for a time dimension.
///
/// Accepted forms: a purely numeric epoch (rescaled from the dimension's input unit),
/// `YYYY-MM-DD HH:MM:SS` with an optional `.ffffff` suffix on microsecond dimensions,
/// and a bare `YYYY-MM-DD`.
pub fn parse_time_literal(value: &str, format: &TimeFormat, micro_precision: bool) -> Result<u64, DbError> {
    if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
        let raw = value.parse::<u64>().map_err(|_| invalid(value))?;
        let unit = match format {
            TimeFormat::Epoch(unit) => *unit,
            TimeFormat::Pattern(_) => None,
        };
        return fit_precision(rescale_epoch(raw, unit, micro_precision), micro_precision, value);
    }

    let (head, fraction) = match value.split_once('.') {
        Some((head, fraction)) => (head, Some(fraction)),
        None => (value, None),
    };
    if let Ok(dt) = NaiveDateTime::parse_from_str(head, "%Y-%m-%d %H:%M:%S") {
        let ts = to_epoch(dt, micro_precision, value)?;
        let ts = match fraction {
            None => ts,
            Some(digits) if micro_precision => ts + parse_fraction_micros(digits, value)?,
            Some(_) => return Err(invalid(value)),
        };
        return fit_precision(ts, micro_precision, value);
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|_| invalid(value))?;
    let dt = date.and_hms_opt(0, 0, 0).ok_or_else(|| invalid(value))?;
    fit_precision(to_epoch(dt, micro_precision, value)?, micro_precision, value)
}

/// Second-precision timestamps are stored in 32 bits.
fn fit_precision(ts: u64, micro_precision: bool, value: &str) -> Result<u64, DbError> {
    if !micro_precision && ts > u32::MAX as u64 {
        return Err(invalid(value));
    }
    Ok(ts)
}

fn parse_fraction_micros(digits: &str, value: &str) -> Result<u64, DbError> {
    if digits.is_empty() || digits.len() > 6 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid(value));
    }
    let parsed = digits.parse::<u64>().map_err(|_| invalid(value))?;
    Ok(parsed * 10u64.pow(6 - digits.len() as u32))
}

/// Rounds `ts` down to the start of its `unit` (UTC).
pub fn truncate(ts: u64, unit: TimeUnit, micro_precision: bool) -> u64 {
    let secs = if micro_precision { ts / MICROS_PER_SEC } else { ts };
    let truncated = match unit {
        TimeUnit::Second => secs,
        TimeUnit::Minute | TimeUnit::Hour | TimeUnit::Day => secs - secs % unit.nominal_secs(),
        TimeUnit::Week => {
            // 1970-01-01 was a Thursday; weeks start on Monday.
            let days = secs / SECS_PER_DAY;
            let monday = days.saturating_sub((days + 3) % 7);
            monday * SECS_PER_DAY
        }
        TimeUnit::Month | TimeUnit::Year => truncate_calendar(secs, unit),
    };
    if micro_precision {
        truncated * MICROS_PER_SEC
    } else {
        truncated
    }
}

fn truncate_calendar(secs: u64, unit: TimeUnit) -> u64 {
    let Some(dt) = i64::try_from(secs).ok().and_then(|s| DateTime::from_timestamp(s, 0)) else {
        return secs;
    };
    let date = dt.date_naive();
    let month = if unit == TimeUnit::Year { 1 } else { date.month() };
    NaiveDate::from_ymd_opt(date.year(), month, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|d| d.and_utc().timestamp() as u64)
        .unwrap_or(secs)
}

/// Parses a duration literal such as `"3 days"` or `"1 week"` into seconds.
pub fn parse_duration_secs(literal: &str) -> Result<u64, DbError> {
    let mut parts = literal.split_whitespace();
    let (Some(count), Some(unit), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(DbError::Config(format!("invalid duration: {literal:?}")));
    };
    let count = count
        .parse::<u64>()
        .map_err(|_| DbError::Config(format!("invalid duration: {literal:?}")))?;
    let unit = TimeUnit::parse(unit)
        .ok_or_else(|| DbError::Config(format!("invalid duration unit: {literal:?}")))?;
    count
        .checked_mul(unit.nominal_secs())
        .ok_or_else(|| DbError::Config(format!("duration out of range: {literal:?}")))
}

/// Once a timestamp is at least `after_secs` old, it is stored at `granularity`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollupRule {
    pub granularity: TimeUnit,
    pub after_secs: u64,
}

/// Truncation applied to a time dimension after parsing. Rollup rules win over the plain
/// granularity; the plain granularity covers timestamps younger than every rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimeReduction {
    pub granularity: Option<TimeUnit>,
    /// Sorted by `after_secs`, ascending.
    pub rollup_rules: Vec<RollupRule>,
}

impl TimeReduction {
    pub fn new(granularity: Option<TimeUnit>, mut rollup_rules: Vec<RollupRule>) -> Self {
        rollup_rules.sort_by_key(|r| r.after_secs);
        Self {
            granularity,
            rollup_rules,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.granularity.is_none() && self.rollup_rules.is_empty()
    }

    /// `now_secs` is the batch clock captured at batch start.
    pub fn apply(&self, ts: u64, now_secs: u64, micro_precision: bool) -> u64 {
        let ts_secs = if micro_precision { ts / MICROS_PER_SEC } else { ts };
        let age = now_secs.saturating_sub(ts_secs);
        let rule = self.rollup_rules.iter().rev().find(|r| age >= r.after_secs);
        match rule.map(|r| r.granularity).or(self.granularity) {
            Some(unit) => truncate(ts, unit, micro_precision),
            None => ts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JAN_1_2019: u64 = 1_546_300_800;

    #[test]
    fn micro_dimension_parses_datetime_literal_at_midnight() {
        let fmt = TimeFormat::parse(None);
        let ts = parse_time_literal("2019-01-01 00:00:00", &fmt, true).unwrap();
        assert_eq!(ts, JAN_1_2019 * MICROS_PER_SEC);
    }

    #[test]
    fn posix_seconds_field_is_left_unchanged() {
        let fmt = TimeFormat::parse(Some("posix"));
        let TimeFormat::Epoch(unit) = fmt else { panic!("posix must be numeric") };
        assert_eq!(parse_epoch("20191112", unit, false).unwrap(), 20_191_112);
    }

    #[test]
    fn epoch_rescaling_follows_precision_mismatch() {
        assert_eq!(rescale_epoch(5, Some(EpochUnit::Seconds), true), 5_000_000);
        assert_eq!(rescale_epoch(5_000, Some(EpochUnit::Millis), true), 5_000_000);
        assert_eq!(rescale_epoch(5_000, Some(EpochUnit::Millis), false), 5);
        assert_eq!(rescale_epoch(5_000_000, Some(EpochUnit::Micros), false), 5);
        assert_eq!(rescale_epoch(5, Some(EpochUnit::Micros), true), 5);
        assert_eq!(rescale_epoch(5, None, true), 5);
    }

    #[test]
    fn fractional_seconds_only_on_micro_dimensions() {
        let fmt = TimeFormat::parse(None);
        let ts = parse_time_literal("2019-01-01 00:00:01.25", &fmt, true).unwrap();
        assert_eq!(ts, (JAN_1_2019 + 1) * MICROS_PER_SEC + 250_000);
        assert!(matches!(
            parse_time_literal("2019-01-01 00:00:01.25", &fmt, false),
            Err(DbError::InvalidTimeFormat { .. })
        ));
    }

    #[test]
    fn bare_date_literal() {
        let fmt = TimeFormat::parse(None);
        assert_eq!(parse_time_literal("2019-01-01", &fmt, false).unwrap(), JAN_1_2019);
    }

    #[test]
    fn datetime_literal_past_32_bits_is_rejected_at_second_precision() {
        let fmt = TimeFormat::parse(Some("posix"));
        for literal in ["2200-01-01", "2200-01-01 00:00:00", "7258118400"] {
            assert!(
                matches!(
                    parse_time_literal(literal, &fmt, false),
                    Err(DbError::InvalidTimeFormat { .. })
                ),
                "{literal} should not fit a second-precision dimension"
            );
        }
        assert_eq!(
            parse_time_literal("2200-01-01", &fmt, true).unwrap(),
            7_258_118_400 * MICROS_PER_SEC
        );
        assert_eq!(parse_time_literal("2106-02-07 06:28:15", &fmt, false).unwrap(), u32::MAX as u64);
    }

    #[test]
    fn garbage_literal_is_an_input_error() {
        let fmt = TimeFormat::parse(None);
        let err = parse_time_literal("yesterday", &fmt, false).unwrap_err();
        assert!(err.to_string().contains("yesterday"));
    }

    #[test]
    fn pattern_parse_handles_date_only_patterns() {
        assert_eq!(parse_pattern("2019-01-01", "%Y-%m-%d", false).unwrap(), JAN_1_2019);
        assert_eq!(
            parse_pattern("2019-01-01T00:00:10", "%Y-%m-%dT%H:%M:%S", false).unwrap(),
            JAN_1_2019 + 10
        );
        assert!(parse_pattern("01/01/2019", "%Y-%m-%d", false).is_err());
    }

    #[test]
    fn day_truncation_zeroes_sub_day_components() {
        let ts = JAN_1_2019 + 13 * 3_600 + 17 * 60 + 5;
        assert_eq!(truncate(ts, TimeUnit::Day, false), JAN_1_2019);
        assert_eq!(
            truncate(ts * MICROS_PER_SEC + 42, TimeUnit::Day, true),
            JAN_1_2019 * MICROS_PER_SEC
        );
        assert_eq!(truncate(ts, TimeUnit::Hour, false), JAN_1_2019 + 13 * 3_600);
    }

    #[test]
    fn calendar_truncation() {
        // 2019-03-15 10:00:00 UTC
        let ts = 1_552_644_000;
        assert_eq!(truncate(ts, TimeUnit::Month, false), 1_551_398_400); // 2019-03-01
        assert_eq!(truncate(ts, TimeUnit::Year, false), JAN_1_2019);
        // 2019-01-01 was a Tuesday; its week starts Monday 2018-12-31.
        assert_eq!(truncate(JAN_1_2019 + 5, TimeUnit::Week, false), JAN_1_2019 - SECS_PER_DAY);
    }

    #[test]
    fn rollup_rules_take_precedence_over_granularity() {
        let reduction = TimeReduction::new(
            Some(TimeUnit::Hour),
            vec![
                RollupRule { granularity: TimeUnit::Month, after_secs: 30 * SECS_PER_DAY },
                RollupRule { granularity: TimeUnit::Day, after_secs: 7 * SECS_PER_DAY },
            ],
        );
        let now = JAN_1_2019 + 100 * SECS_PER_DAY;
        let fresh = now - 3_700;
        assert_eq!(reduction.apply(fresh, now, false), fresh - fresh % 3_600);
        let week_old = now - 8 * SECS_PER_DAY - 5;
        assert_eq!(reduction.apply(week_old, now, false), truncate(week_old, TimeUnit::Day, false));
        let old = now - 60 * SECS_PER_DAY;
        assert_eq!(reduction.apply(old, now, false), truncate(old, TimeUnit::Month, false));
    }

    #[test]
    fn duration_literals() {
        assert_eq!(parse_duration_secs("3 days").unwrap(), 3 * SECS_PER_DAY);
        assert_eq!(parse_duration_secs("1 week").unwrap(), 7 * SECS_PER_DAY);
        assert!(parse_duration_secs("soon").is_err());
        assert!(matches!(
            parse_duration_secs("100000000000000000 years"),
            Err(DbError::Config(msg)) if msg.contains("out of range")
        ));
    }
}
