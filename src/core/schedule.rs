//! Recurrence grammar for repeating tasks.
//!
//! Four rule shapes are accepted, all evaluated in UTC:
//!
//! | Text | Meaning |
//! |---|---|
//! | `daily_HH:MM` | next time the clock reads HH:MM |
//! | `weekly_D_HH:MM` | next weekday `D` (0 = Monday .. 6 = Sunday) at HH:MM |
//! | `every_Xm` | `X` minutes after the reference time |
//! | `every_Xh` | `X` hours after the reference time |
//!
//! [`RecurringRule::next_occurrence`] is a pure function of `(rule, now)`, so
//! recurrence math is testable without a store.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveTime, TimeDelta, Utc, Weekday};
use serde::{Deserialize, Serialize};

use super::error::DaemonError;

/// A parsed recurring schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RecurringRule {
    /// Every day at `hour:minute`.
    Daily {
        /// Hour of day, 0..=23.
        hour: u32,
        /// Minute, 0..=59.
        minute: u32,
    },
    /// Every week on `weekday` at `hour:minute`.
    Weekly {
        /// Day of week.
        weekday: Weekday,
        /// Hour of day, 0..=23.
        hour: u32,
        /// Minute, 0..=59.
        minute: u32,
    },
    /// Every `n` minutes.
    EveryMinutes(u32),
    /// Every `n` hours.
    EveryHours(u32),
}

const WEEKDAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

impl RecurringRule {
    /// Compute the first occurrence strictly after `now`.
    ///
    /// Interval rules return `now + interval`. Clock rules return today's (or
    /// this week's) slot when it is still ahead of `now`, otherwise the next one.
    pub fn next_occurrence(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            Self::Daily { hour, minute } => {
                let candidate = at_time_of_day(now, 0, hour, minute);
                if candidate > now {
                    candidate
                } else {
                    at_time_of_day(now, 1, hour, minute)
                }
            }
            Self::Weekly {
                weekday,
                hour,
                minute,
            } => {
                let today = now.weekday().num_days_from_monday();
                let target = weekday.num_days_from_monday();
                let days_ahead = (target + 7 - today) % 7;
                let candidate = at_time_of_day(now, days_ahead, hour, minute);
                if candidate > now {
                    candidate
                } else {
                    at_time_of_day(now, days_ahead + 7, hour, minute)
                }
            }
            Self::EveryMinutes(n) => add_or_max(now, TimeDelta::minutes(i64::from(n))),
            Self::EveryHours(n) => add_or_max(now, TimeDelta::hours(i64::from(n))),
        }
    }
}

fn at_time_of_day(now: DateTime<Utc>, days_ahead: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    let midnight = now.date_naive().and_time(NaiveTime::MIN).and_utc();
    let offset = TimeDelta::days(i64::from(days_ahead))
        + TimeDelta::hours(i64::from(hour))
        + TimeDelta::minutes(i64::from(minute));
    add_or_max(midnight, offset)
}

fn add_or_max(at: DateTime<Utc>, delta: TimeDelta) -> DateTime<Utc> {
    at.checked_add_signed(delta)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn parse_clock(text: &str, original: &str) -> Result<(u32, u32), DaemonError> {
    let invalid = || DaemonError::InvalidSchedule(format!("bad time in `{original}`, expected HH:MM"));
    let (h, m) = text.split_once(':').ok_or_else(invalid)?;
    if h.is_empty() || h.len() > 2 || m.len() != 2 {
        return Err(invalid());
    }
    let hour: u32 = h.parse().map_err(|_| invalid())?;
    let minute: u32 = m.parse().map_err(|_| invalid())?;
    if hour > 23 || minute > 59 {
        return Err(invalid());
    }
    Ok((hour, minute))
}

fn parse_count(text: &str, original: &str) -> Result<u32, DaemonError> {
    let n: u32 = text
        .parse()
        .map_err(|_| DaemonError::InvalidSchedule(format!("bad interval in `{original}`")))?;
    if n == 0 {
        return Err(DaemonError::InvalidSchedule(format!(
            "interval in `{original}` must be at least 1"
        )));
    }
    Ok(n)
}

impl FromStr for RecurringRule {
    type Err = DaemonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        if let Some(rest) = text.strip_prefix("daily_") {
            let (hour, minute) = parse_clock(rest, text)?;
            return Ok(Self::Daily { hour, minute });
        }
        if let Some(rest) = text.strip_prefix("weekly_") {
            let (day, clock) = rest.split_once('_').ok_or_else(|| {
                DaemonError::InvalidSchedule(format!("`{text}` should look like weekly_D_HH:MM"))
            })?;
            let weekday = day
                .parse::<usize>()
                .ok()
                .and_then(|d| WEEKDAYS.get(d).copied())
                .ok_or_else(|| {
                    DaemonError::InvalidSchedule(format!("weekday in `{text}` must be 0-6"))
                })?;
            let (hour, minute) = parse_clock(clock, text)?;
            return Ok(Self::Weekly {
                weekday,
                hour,
                minute,
            });
        }
        if let Some(rest) = text.strip_prefix("every_") {
            if let Some(n) = rest.strip_suffix('m') {
                return Ok(Self::EveryMinutes(parse_count(n, text)?));
            }
            if let Some(n) = rest.strip_suffix('h') {
                return Ok(Self::EveryHours(parse_count(n, text)?));
            }
        }
        Err(DaemonError::InvalidSchedule(format!(
            "unrecognised rule `{text}`; use daily_HH:MM, weekly_D_HH:MM, every_Xm or every_Xh"
        )))
    }
}

impl fmt::Display for RecurringRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Daily { hour, minute } => write!(f, "daily_{hour:02}:{minute:02}"),
            Self::Weekly {
                weekday,
                hour,
                minute,
            } => write!(
                f,
                "weekly_{}_{hour:02}:{minute:02}",
                weekday.num_days_from_monday()
            ),
            Self::EveryMinutes(n) => write!(f, "every_{n}m"),
            Self::EveryHours(n) => write!(f, "every_{n}h"),
        }
    }
}

impl TryFrom<String> for RecurringRule {
    type Error = DaemonError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RecurringRule> for String {
    fn from(rule: RecurringRule) -> Self {
        rule.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn daily_after_slot_rolls_to_tomorrow() {
        let rule: RecurringRule = "daily_09:00".parse().unwrap();
        let next = rule.next_occurrence(at("2026-01-01T10:00:00Z"));
        assert_eq!(next, at("2026-01-02T09:00:00Z"));
    }

    #[test]
    fn daily_before_slot_stays_today() {
        let rule: RecurringRule = "daily_09:00".parse().unwrap();
        let next = rule.next_occurrence(at("2026-01-01T08:59:00Z"));
        assert_eq!(next, at("2026-01-01T09:00:00Z"));
    }

    #[test]
    fn daily_exactly_at_slot_moves_forward() {
        let rule: RecurringRule = "daily_09:00".parse().unwrap();
        let next = rule.next_occurrence(at("2026-01-01T09:00:00Z"));
        assert_eq!(next, at("2026-01-02T09:00:00Z"));
    }

    #[test]
    fn every_minutes_adds_interval() {
        let rule: RecurringRule = "every_30m".parse().unwrap();
        let now = at("2026-03-14T15:09:26Z");
        assert_eq!(rule.next_occurrence(now), now + TimeDelta::minutes(30));
        assert_eq!(rule.next_occurrence(now), rule.next_occurrence(now));
    }

    #[test]
    fn every_hours_adds_interval() {
        let rule: RecurringRule = "every_2h".parse().unwrap();
        let now = at("2026-03-14T23:30:00Z");
        assert_eq!(rule.next_occurrence(now), at("2026-03-15T01:30:00Z"));
    }

    #[test]
    fn weekly_picks_next_matching_weekday() {
        // 2026-01-01 is a Thursday; 0 = Monday.
        let rule: RecurringRule = "weekly_0_08:30".parse().unwrap();
        let next = rule.next_occurrence(at("2026-01-01T12:00:00Z"));
        assert_eq!(next, at("2026-01-05T08:30:00Z"));
        assert_eq!(next.weekday(), Weekday::Mon);
    }

    #[test]
    fn weekly_same_day_later_counts() {
        let rule: RecurringRule = "weekly_3_18:00".parse().unwrap();
        let next = rule.next_occurrence(at("2026-01-01T12:00:00Z"));
        assert_eq!(next, at("2026-01-01T18:00:00Z"));
    }

    #[test]
    fn weekly_same_day_passed_waits_a_week() {
        let rule: RecurringRule = "weekly_3_09:00".parse().unwrap();
        let next = rule.next_occurrence(at("2026-01-01T12:00:00Z"));
        assert_eq!(next, at("2026-01-08T09:00:00Z"));
    }

    #[test]
    fn parse_rejects_malformed_rules() {
        for bad in [
            "",
            "hourly",
            "daily_9",
            "daily_24:00",
            "daily_09:60",
            "daily_09:5",
            "weekly_7_09:00",
            "weekly_09:00",
            "every_0m",
            "every_m",
            "every_5d",
            "every_-5m",
        ] {
            let err = bad.parse::<RecurringRule>().unwrap_err();
            assert!(
                matches!(err, DaemonError::InvalidSchedule(_)),
                "expected InvalidSchedule for {bad:?}"
            );
        }
    }

    #[test]
    fn display_is_canonical() {
        let rule: RecurringRule = " daily_7:05 ".parse().unwrap();
        assert_eq!(rule.to_string(), "daily_07:05");
        let rule: RecurringRule = "weekly_6_23:59".parse().unwrap();
        assert_eq!(rule.to_string(), "weekly_6_23:59");
    }

    #[test]
    fn serde_uses_rule_text() {
        let rule = RecurringRule::EveryHours(4);
        assert_eq!(serde_json::to_string(&rule).unwrap(), "\"every_4h\"");
        let back: RecurringRule = serde_json::from_str("\"every_4h\"").unwrap();
        assert_eq!(back, rule);
        assert!(serde_json::from_str::<RecurringRule>("\"nope\"").is_err());
    }
}
