//! Cron evaluation: expression + timezone + reference instant → next fire time.
//!
//! Parsing is delegated to the `cron` crate after translating standard Unix
//! syntax into its dialect (leading seconds field, 1-based weekdays). The
//! calendar walk is done here in local wall-clock time so DST transitions can
//! be resolved explicitly:
//!
//! | Local time            | Resolution                                   |
//! |-----------------------|----------------------------------------------|
//! | exists once           | that instant                                 |
//! | repeated (fall-back)  | the earlier instant only, so it fires once   |
//! | skipped (spring-fwd)  | the first valid instant after the gap        |

use std::str::FromStr;

use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc,
};
use chrono_tz::Tz;
use cron::TimeUnitSpec;

use crate::error::{Result, SchedulerError};
use crate::types::{ScheduleDefinition, ScheduleSpec};

/// Give up looking for a match this many years past the reference instant.
/// Only reachable for expressions that can never fire (e.g. `0 0 30 2 *`).
const SEARCH_HORIZON_YEARS: i32 = 5;

const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// A parsed, validated cron expression.
#[derive(Debug, Clone)]
pub struct CronExpr {
    schedule: cron::Schedule,
    /// Vixie semantics: when both day fields are restricted, either may match.
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpr {
    /// Parse a 5-field (`min hour dom month dow`) or 6-field (leading seconds)
    /// expression, or one of the `@hourly`/`@daily`/... shorthands.
    pub fn parse(expr: &str) -> Result<Self> {
        let expanded = expand_macro(expr.trim());
        let fields: Vec<&str> = expanded.split_whitespace().collect();
        let (seconds, rest) = match fields.len() {
            5 => ("0", &fields[..]),
            6 => (fields[0], &fields[1..]),
            n => {
                return Err(SchedulerError::Validation(format!(
                    "cron expression {expr:?} has {n} fields, expected 5 or 6"
                )))
            }
        };
        if expanded.contains('#') {
            return Err(SchedulerError::Validation(format!(
                "cron expression {expr:?}: '#' (nth weekday) is not supported"
            )));
        }

        let (minute, hour, dom, month, dow) = (rest[0], rest[1], rest[2], rest[3], rest[4]);
        let dom = if dom == "?" { "*" } else { dom };
        let dow_translated = translate_weekdays(dow).map_err(|e| {
            SchedulerError::Validation(format!("cron expression {expr:?}: {e}"))
        })?;

        let normalized = format!("{seconds} {minute} {hour} {dom} {month} {dow_translated}");
        let schedule = cron::Schedule::from_str(&normalized).map_err(|e| {
            SchedulerError::Validation(format!("cron expression {expr:?}: {e}"))
        })?;

        Ok(Self {
            schedule,
            dom_restricted: is_restricted(dom),
            dow_restricted: is_restricted(dow),
        })
    }

    /// Earliest fire instant strictly after `after`, or `None` when nothing
    /// matches within the search horizon.
    pub fn next_after(&self, tz: Tz, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local_after = after.with_timezone(&tz).naive_local();
        let horizon = local_after.year() + SEARCH_HORIZON_YEARS;
        let mut t = local_after.with_nanosecond(0)? + Duration::seconds(1);

        while t.year() <= horizon {
            if !self.schedule.months().includes(t.month()) {
                t = first_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t.date()) {
                t = (t.date() + Duration::days(1)).and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.schedule.hours().includes(t.hour()) {
                t = t.date().and_hms_opt(t.hour(), 0, 0)? + Duration::hours(1);
                continue;
            }
            if !self.schedule.minutes().includes(t.minute()) {
                t = t.with_second(0)? + Duration::minutes(1);
                continue;
            }
            if !self.schedule.seconds().includes(t.second()) {
                t += Duration::seconds(1);
                continue;
            }
            if let Some(instant) = resolve_local(tz, t) {
                // An ambiguous time already fired in its first occurrence
                // resolves to an instant <= after and is skipped here.
                if instant > after {
                    return Some(instant);
                }
            }
            t += Duration::seconds(1);
        }
        None
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.schedule.days_of_month().includes(date.day());
        let dow = self
            .schedule
            .days_of_week()
            .includes(date.weekday().number_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }
}

/// Parse an IANA timezone name such as `Europe/Berlin` or `UTC`.
pub fn parse_timezone(timezone: &str) -> Result<Tz> {
    timezone
        .parse::<Tz>()
        .map_err(|_| SchedulerError::Validation(format!("unknown timezone: {timezone}")))
}

/// Next fire instant of `expr` in `timezone`, strictly after `after`.
///
/// Deterministic: the same inputs always produce the same output.
pub fn next_fire_time(expr: &str, timezone: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let cron = CronExpr::parse(expr)?;
    let tz = parse_timezone(timezone)?;
    cron.next_after(tz, after).ok_or_else(|| {
        SchedulerError::Validation(format!("cron expression {expr:?} never fires"))
    })
}

/// The next `count` fire instants after `after`; used for previews.
pub fn next_fire_times(
    expr: &str,
    timezone: &str,
    after: DateTime<Utc>,
    count: usize,
) -> Result<Vec<DateTime<Utc>>> {
    let cron = CronExpr::parse(expr)?;
    let tz = parse_timezone(timezone)?;
    let mut out = Vec::with_capacity(count);
    let mut cursor = after;
    while out.len() < count {
        match cron.next_after(tz, cursor) {
            Some(next) => {
                out.push(next);
                cursor = next;
            }
            None => break,
        }
    }
    Ok(out)
}

/// Validate the timing fields of a schedule and compute its initial
/// `next_run_at` as of `now`.
///
/// One-shot schedules bypass cron evaluation entirely: their first and only
/// fire time is `run_at`, even if it is already in the past.
pub fn initial_next_run(spec: &ScheduleSpec, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    match (spec.cron_expression.as_deref(), spec.run_at) {
        (Some(expr), None) => next_fire_time(expr, &spec.timezone, now),
        (None, Some(at)) => {
            parse_timezone(&spec.timezone)?;
            Ok(at)
        }
        (Some(_), Some(_)) => Err(SchedulerError::Validation(
            "exactly one of cron_expression and run_at may be set, got both".to_string(),
        )),
        (None, None) => Err(SchedulerError::Validation(
            "exactly one of cron_expression and run_at must be set, got neither".to_string(),
        )),
    }
}

/// The fire time following a dispatch at `now`. `None` for one-shot
/// schedules, which self-disable after their single firing.
pub fn following_run(
    schedule: &ScheduleDefinition,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    match schedule.cron_expression.as_deref() {
        Some(expr) => next_fire_time(expr, &schedule.timezone, now).map(Some),
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn resolve_local(tz: Tz, t: NaiveDateTime) -> Option<DateTime<Utc>> {
    match tz.from_local_datetime(&t) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
        LocalResult::None => {
            // Inside a spring-forward gap: walk to the first minute that exists.
            let mut probe = t.with_second(0)?;
            for _ in 0..(24 * 60) {
                probe += Duration::minutes(1);
                if let Some(dt) = tz.from_local_datetime(&probe).earliest() {
                    return Some(dt.with_timezone(&Utc));
                }
            }
            None
        }
    }
}

fn first_of_next_month(t: NaiveDateTime) -> Option<NaiveDateTime> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

fn is_restricted(field: &str) -> bool {
    !(field.starts_with('*') || field == "?")
}

fn expand_macro(expr: &str) -> String {
    match expr {
        "@yearly" | "@annually" => "0 0 1 1 *",
        "@monthly" => "0 0 1 * *",
        "@weekly" => "0 0 * * 0",
        "@daily" | "@midnight" => "0 0 * * *",
        "@hourly" => "0 * * * *",
        other => other,
    }
    .to_string()
}

/// Rewrite a Unix day-of-week field (0-7, Sunday = 0 or 7) into weekday names,
/// which the `cron` crate understands unambiguously.
///
/// Numeric ranges are expanded into explicit lists so `5-7` and `0-6/2`
/// survive the change of numbering base.
fn translate_weekdays(field: &str) -> std::result::Result<String, String> {
    if field == "?" {
        return Ok("*".to_string());
    }
    let mut items = Vec::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((r, s)) => (r, Some(s)),
            None => (item, None),
        };
        if range == "*" {
            // `*/n` selects the same weekdays under both numbering bases.
            items.push(item.to_string());
            continue;
        }
        let (lo, hi) = match range.split_once('-') {
            Some((lo, hi)) => (lo, Some(hi)),
            None => (range, None),
        };
        let lo_num = lo.parse::<u32>().ok();
        let hi_num = hi.and_then(|h| h.parse::<u32>().ok());

        match (lo_num, hi, hi_num) {
            (Some(lo), None, _) if step.is_none() => items.push(weekday_name(lo)?.to_string()),
            (Some(lo), hi_raw, hi_num) if hi_raw.is_none() || hi_num.is_some() => {
                let hi = hi_num.unwrap_or(6);
                let step = match step {
                    Some(s) => s
                        .parse::<usize>()
                        .ok()
                        .filter(|s| *s > 0)
                        .ok_or_else(|| format!("invalid weekday step {s:?}"))?,
                    None => 1,
                };
                if lo > hi {
                    return Err(format!("weekday range {range:?} is reversed"));
                }
                for day in (lo..=hi).step_by(step) {
                    items.push(weekday_name(day)?.to_string());
                }
            }
            _ => {
                // Named (or mixed) item: map any numeric endpoint, keep the rest.
                let map = |s: &str| match s.parse::<u32>() {
                    Ok(n) => weekday_name(n).map(str::to_string),
                    Err(_) => Ok(s.to_string()),
                };
                let mut out = map(lo)?;
                if let Some(hi) = hi {
                    out.push('-');
                    out.push_str(&map(hi)?);
                }
                if let Some(step) = step {
                    out.push('/');
                    out.push_str(step);
                }
                items.push(out);
            }
        }
    }
    items.dedup();
    Ok(items.join(","))
}

fn weekday_name(n: u32) -> std::result::Result<&'static str, String> {
    match n {
        0..=6 => Ok(WEEKDAY_NAMES[n as usize]),
        7 => Ok("SUN"),
        other => Err(format!("weekday {other} out of range 0-7")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn every_five_minutes_from_midnight() {
        let next = next_fire_time("*/5 * * * *", "UTC", utc("2024-01-01T00:00:00Z")).unwrap();
        assert_eq!(next, utc("2024-01-01T00:05:00Z"));
    }

    #[test]
    fn result_is_strictly_after_reference() {
        // The reference itself matches; it must not be returned.
        let after = utc("2024-01-01T00:05:00Z");
        let next = next_fire_time("*/5 * * * *", "UTC", after).unwrap();
        assert!(next > after);
        assert_eq!(next, utc("2024-01-01T00:10:00Z"));
    }

    #[test]
    fn evaluation_is_deterministic() {
        let after = utc("2024-03-15T13:37:42Z");
        let a = next_fire_time("15 9 * * 1-5", "Europe/Berlin", after).unwrap();
        let b = next_fire_time("15 9 * * 1-5", "Europe/Berlin", after).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn six_field_expression_honours_seconds() {
        let next = next_fire_time("30 * * * * *", "UTC", utc("2024-01-01T00:00:10Z")).unwrap();
        assert_eq!(next, utc("2024-01-01T00:00:30Z"));
    }

    #[test]
    fn lists_ranges_and_steps() {
        let times = next_fire_times("0 8-10/2,17 * * *", "UTC", utc("2024-01-01T00:00:00Z"), 4)
            .unwrap();
        assert_eq!(
            times,
            vec![
                utc("2024-01-01T08:00:00Z"),
                utc("2024-01-01T10:00:00Z"),
                utc("2024-01-01T17:00:00Z"),
                utc("2024-01-02T08:00:00Z"),
            ]
        );
    }

    #[test]
    fn sunday_is_zero_and_seven() {
        // 2024-01-07 is a Sunday.
        let from = utc("2024-01-01T00:00:00Z");
        let zero = next_fire_time("0 12 * * 0", "UTC", from).unwrap();
        let seven = next_fire_time("0 12 * * 7", "UTC", from).unwrap();
        assert_eq!(zero, utc("2024-01-07T12:00:00Z"));
        assert_eq!(zero, seven);
    }

    #[test]
    fn weekday_range_maps_to_monday_through_friday() {
        // 2024-01-05 is a Friday; next weekday slot after it is Monday the 8th.
        let next = next_fire_time("0 9 * * 1-5", "UTC", utc("2024-01-05T10:00:00Z")).unwrap();
        assert_eq!(next, utc("2024-01-08T09:00:00Z"));
    }

    #[test]
    fn restricted_day_fields_are_ored() {
        // Day 15 OR Monday: 2024-01-08 (Monday) comes before the 15th.
        let next = next_fire_time("0 0 15 * 1", "UTC", utc("2024-01-02T00:00:00Z")).unwrap();
        assert_eq!(next, utc("2024-01-08T00:00:00Z"));
    }

    #[test]
    fn shorthand_macros_expand() {
        let next = next_fire_time("@daily", "UTC", utc("2024-01-01T10:00:00Z")).unwrap();
        assert_eq!(next, utc("2024-01-02T00:00:00Z"));
    }

    #[test]
    fn timezone_offsets_apply() {
        // 09:00 in New York (EST, UTC-5) is 14:00 UTC.
        let next = next_fire_time("0 9 * * *", "America/New_York", utc("2024-01-10T00:00:00Z"))
            .unwrap();
        assert_eq!(next, utc("2024-01-10T14:00:00Z"));
    }

    #[test]
    fn spring_forward_gap_defers_to_first_valid_instant() {
        // 2024-03-10: New York clocks jump 02:00 EST -> 03:00 EDT (07:00 UTC).
        let next = next_fire_time("30 2 * * *", "America/New_York", utc("2024-03-10T05:00:00Z"))
            .unwrap();
        assert_eq!(next, utc("2024-03-10T07:00:00Z"));
        // And the day after it is back to normal 02:30 EDT.
        let after = next_fire_time("30 2 * * *", "America/New_York", next).unwrap();
        assert_eq!(after, utc("2024-03-11T06:30:00Z"));
    }

    #[test]
    fn fall_back_repeated_time_fires_once() {
        // 2024-11-03: New York repeats 01:00-01:59 (EDT 05:xx UTC, then EST 06:xx UTC).
        let first = next_fire_time("30 1 * * *", "America/New_York", utc("2024-11-03T04:00:00Z"))
            .unwrap();
        assert_eq!(first, utc("2024-11-03T05:30:00Z"));
        let second = next_fire_time("30 1 * * *", "America/New_York", first).unwrap();
        assert_eq!(second, utc("2024-11-04T06:30:00Z"));
    }

    #[test]
    fn malformed_expressions_are_validation_errors() {
        for expr in ["", "* * * *", "61 * * * *", "* * * * * * *", "0 0 * * 8", "0 0 1#2 * *"] {
            let err = next_fire_time(expr, "UTC", Utc::now()).unwrap_err();
            assert_eq!(err.code(), "VALIDATION_ERROR", "expression {expr:?}");
        }
    }

    #[test]
    fn unknown_timezone_is_rejected() {
        let err = next_fire_time("* * * * *", "Mars/Olympus", Utc::now()).unwrap_err();
        assert!(matches!(err, SchedulerError::Validation(_)));
    }

    #[test]
    fn impossible_date_never_fires() {
        let err = next_fire_time("0 0 30 2 *", "UTC", utc("2024-01-01T00:00:00Z")).unwrap_err();
        assert!(err.to_string().contains("never fires"));
    }

    #[test]
    fn one_shot_requires_exactly_one_timing_field() {
        use crate::types::OwnerDomain;
        let now = utc("2024-01-01T00:00:00Z");
        let once = ScheduleSpec::once(OwnerDomain::Export, utc("2024-02-01T00:00:00Z"));
        assert_eq!(initial_next_run(&once, now).unwrap(), utc("2024-02-01T00:00:00Z"));

        let mut both = once.clone();
        both.cron_expression = Some("* * * * *".to_string());
        assert!(initial_next_run(&both, now).is_err());

        let mut neither = once;
        neither.run_at = None;
        assert!(initial_next_run(&neither, now).is_err());
    }

    #[test]
    fn weekday_translation() {
        assert_eq!(translate_weekdays("1-5").unwrap(), "MON,TUE,WED,THU,FRI");
        assert_eq!(translate_weekdays("5-7").unwrap(), "FRI,SAT,SUN");
        assert_eq!(translate_weekdays("*/2").unwrap(), "*/2");
        assert_eq!(translate_weekdays("MON-FRI").unwrap(), "MON-FRI");
        assert_eq!(translate_weekdays("0,7").unwrap(), "SUN");
        assert!(translate_weekdays("9").is_err());
    }
}
