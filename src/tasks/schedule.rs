//! Next-run computation for scheduled tasks.
//!
//! Cron expressions accept standard 5-field crontab syntax (normalized to
//! the crate's seconds-leading form) and evaluate in the configured IANA
//! timezone; intervals are millisecond counts; `once` values are RFC 3339
//! timestamps.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cron::Schedule as CronSchedule;
use std::str::FromStr;

use super::ScheduleType;

pub fn normalize_expression(expression: &str) -> Result<String> {
    let expression = expression.trim();
    let field_count = expression.split_whitespace().count();

    match field_count {
        // standard crontab syntax: minute hour day month weekday
        5 => Ok(format!("0 {expression}")),
        // crate-native syntax includes seconds (+ optional year)
        6 | 7 => Ok(expression.to_string()),
        _ => anyhow::bail!(
            "Invalid cron expression: {expression} (expected 5, 6, or 7 fields, got {field_count})"
        ),
    }
}

fn next_cron_after(
    expression: &str,
    tz: Option<&str>,
    from: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    let normalized = normalize_expression(expression)?;
    let schedule = CronSchedule::from_str(&normalized)
        .with_context(|| format!("Invalid cron expression: {expression}"))?;

    if let Some(tz_name) = tz {
        let timezone = chrono_tz::Tz::from_str(tz_name)
            .with_context(|| format!("Invalid IANA timezone: {tz_name}"))?;
        let localized_from = from.with_timezone(&timezone);
        let next_local = schedule
            .after(&localized_from)
            .next()
            .ok_or_else(|| anyhow::anyhow!("No future occurrence for expression: {expression}"))?;
        Ok(next_local.with_timezone(&Utc))
    } else {
        schedule
            .after(&from)
            .next()
            .ok_or_else(|| anyhow::anyhow!("No future occurrence for expression: {expression}"))
    }
}

fn interval_ms(value: &str) -> Result<i64> {
    let ms: i64 = value
        .trim()
        .parse()
        .with_context(|| format!("Invalid interval milliseconds: {value}"))?;
    if ms <= 0 {
        anyhow::bail!("Invalid interval: must be > 0 ms");
    }
    Ok(ms)
}

fn once_at(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|d| d.with_timezone(&Utc))
        .with_context(|| format!("Invalid RFC 3339 timestamp: {value}"))
}

/// Reject malformed schedule values at creation/tool-call time.
pub fn validate_schedule_value(
    schedule_type: ScheduleType,
    value: &str,
    tz: Option<&str>,
) -> Result<()> {
    match schedule_type {
        ScheduleType::Cron => {
            next_cron_after(value, tz, Utc::now())?;
            Ok(())
        }
        ScheduleType::Interval => interval_ms(value).map(|_| ()),
        ScheduleType::Once => once_at(value).map(|_| ()),
    }
}

/// First firing of a newly created task. A `once` timestamp in the past is
/// allowed: it fires on the next due scan.
pub fn initial_next_run(
    schedule_type: ScheduleType,
    value: &str,
    tz: Option<&str>,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    match schedule_type {
        ScheduleType::Cron => next_cron_after(value, tz, now),
        ScheduleType::Interval => Ok(now + ChronoDuration::milliseconds(interval_ms(value)?)),
        ScheduleType::Once => once_at(value),
    }
}

/// Firing after a completed run. `once` tasks have no further runs.
pub fn next_after_run(
    schedule_type: ScheduleType,
    value: &str,
    tz: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    match schedule_type {
        ScheduleType::Cron => Ok(Some(next_cron_after(value, tz, now)?)),
        ScheduleType::Interval => {
            Ok(Some(now + ChronoDuration::milliseconds(interval_ms(value)?)))
        }
        ScheduleType::Once => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn five_field_expression_is_normalized() {
        assert_eq!(normalize_expression("*/5 * * * *").unwrap(), "0 */5 * * * *");
        assert!(normalize_expression("* * *").is_err());
    }

    #[test]
    fn cron_next_run_respects_timezone() {
        let from = Utc.with_ymd_and_hms(2026, 2, 16, 0, 0, 0).unwrap();
        let next = next_cron_after("0 9 * * *", Some("America/Los_Angeles"), from).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 2, 16, 17, 0, 0).unwrap());
    }

    #[test]
    fn interval_next_run_adds_milliseconds() {
        let now = Utc::now();
        let next = initial_next_run(ScheduleType::Interval, "60000", None, now).unwrap();
        assert_eq!(next, now + ChronoDuration::seconds(60));
    }

    #[test]
    fn once_in_the_past_is_allowed_at_creation() {
        let past = (Utc::now() - ChronoDuration::hours(1)).to_rfc3339();
        let next = initial_next_run(ScheduleType::Once, &past, None, Utc::now()).unwrap();
        assert!(next < Utc::now());
    }

    #[test]
    fn once_has_no_next_after_run() {
        let at = Utc::now().to_rfc3339();
        assert_eq!(
            next_after_run(ScheduleType::Once, &at, None, Utc::now()).unwrap(),
            None
        );
    }

    #[test]
    fn validate_rejects_garbage() {
        assert!(validate_schedule_value(ScheduleType::Cron, "not a cron", None).is_err());
        assert!(validate_schedule_value(ScheduleType::Interval, "0", None).is_err());
        assert!(validate_schedule_value(ScheduleType::Interval, "-5", None).is_err());
        assert!(validate_schedule_value(ScheduleType::Once, "tomorrow", None).is_err());
        assert!(validate_schedule_value(ScheduleType::Cron, "*/5 * * * *", None).is_ok());
        assert!(validate_schedule_value(ScheduleType::Interval, "30000", None).is_ok());
    }

    #[test]
    fn invalid_timezone_is_rejected() {
        assert!(
            validate_schedule_value(ScheduleType::Cron, "0 9 * * *", Some("Mars/Olympus")).is_err()
        );
    }
}
