//! Typed schedules for periodic tasks.
//!
//! A [`Schedule`] is a pure value computing the next fire time from a
//! reference instant. All variants are finite, deterministic, and
//! idempotent: `next(t)` always returns an instant strictly after `t`,
//! and calling it twice with the same input yields the same output.
//!
//! Schedules are constructed from typed builders rather than cron
//! expressions, so an invalid schedule is unrepresentable. Out-of-range
//! components are clamped (minute 75 becomes 59, day 31 fires on the
//! last day of shorter months).

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc, Weekday};

/// A recurrence rule with a single capability: the next fire instant
/// after a reference instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Every fixed interval.
    Every(Duration),
    /// Once an hour at a fixed minute.
    Hourly { minute: u32 },
    /// Once a day at a fixed time.
    Daily { hour: u32, minute: u32 },
    /// Once a week on a fixed day and time.
    Weekly {
        weekday: Weekday,
        hour: u32,
        minute: u32,
    },
    /// Once a month on a fixed day-of-month and time.
    Monthly { day: u32, hour: u32, minute: u32 },
}

impl Schedule {
    /// Fire every `interval`; sub-second intervals round up to 1s.
    pub fn every(interval: Duration) -> Self {
        Schedule::Every(interval.max(Duration::from_secs(1)))
    }

    /// Fire every `n` minutes (at least one).
    pub fn every_minutes(n: u64) -> Self {
        Schedule::Every(Duration::from_secs(n.max(1) * 60))
    }

    /// Fire every `n` hours (at least one).
    pub fn every_hours(n: u64) -> Self {
        Schedule::Every(Duration::from_secs(n.max(1) * 3600))
    }

    /// Fire once a minute.
    pub fn every_minute() -> Self {
        Schedule::Every(Duration::from_secs(60))
    }

    /// Fire at the top of every hour.
    pub fn hourly() -> Self {
        Schedule::Hourly { minute: 0 }
    }

    /// Fire every hour at the given minute.
    pub fn hourly_at(minute: u32) -> Self {
        Schedule::Hourly {
            minute: minute.min(59),
        }
    }

    /// Fire every day at midnight UTC.
    pub fn daily() -> Self {
        Schedule::Daily { hour: 0, minute: 0 }
    }

    /// Fire every day at the given time.
    pub fn daily_at(hour: u32, minute: u32) -> Self {
        Schedule::Daily {
            hour: hour.min(23),
            minute: minute.min(59),
        }
    }

    /// Fire every week on the given day at midnight UTC.
    pub fn weekly(weekday: Weekday) -> Self {
        Schedule::Weekly {
            weekday,
            hour: 0,
            minute: 0,
        }
    }

    /// Fire every week on the given day and time.
    pub fn weekly_on(weekday: Weekday, hour: u32, minute: u32) -> Self {
        Schedule::Weekly {
            weekday,
            hour: hour.min(23),
            minute: minute.min(59),
        }
    }

    /// Fire every month on the given day at midnight UTC.
    pub fn monthly(day: u32) -> Self {
        Schedule::Monthly {
            day: day.clamp(1, 31),
            hour: 0,
            minute: 0,
        }
    }

    /// Fire every month on the given day and time.
    pub fn monthly_on(day: u32, hour: u32, minute: u32) -> Self {
        Schedule::Monthly {
            day: day.clamp(1, 31),
            hour: hour.min(23),
            minute: minute.min(59),
        }
    }

    /// The next fire instant strictly after `from`.
    pub fn next(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            Schedule::Every(interval) => {
                from + chrono::Duration::from_std(interval)
                    .unwrap_or_else(|_| chrono::Duration::seconds(1))
            }
            Schedule::Hourly { minute } => {
                let candidate = at(from.date_naive(), from.hour(), minute);
                if candidate > from {
                    candidate
                } else {
                    candidate + chrono::Duration::hours(1)
                }
            }
            Schedule::Daily { hour, minute } => {
                let candidate = at(from.date_naive(), hour, minute);
                if candidate > from {
                    candidate
                } else {
                    candidate + chrono::Duration::days(1)
                }
            }
            Schedule::Weekly {
                weekday,
                hour,
                minute,
            } => {
                let ahead = i64::from(weekday.num_days_from_monday())
                    - i64::from(from.weekday().num_days_from_monday());
                let date = from.date_naive() + chrono::Duration::days(ahead.rem_euclid(7));
                let candidate = at(date, hour, minute);
                if candidate > from {
                    candidate
                } else {
                    candidate + chrono::Duration::weeks(1)
                }
            }
            Schedule::Monthly { day, hour, minute } => {
                let candidate = at(month_day(from.year(), from.month(), day), hour, minute);
                if candidate > from {
                    candidate
                } else {
                    let (year, month) = if from.month() == 12 {
                        (from.year() + 1, 1)
                    } else {
                        (from.year(), from.month() + 1)
                    };
                    at(month_day(year, month, day), hour, minute)
                }
            }
        }
    }
}

/// The given day of the month, clamped to the month's length.
fn month_day(year: i32, month: u32, day: u32) -> NaiveDate {
    let last = days_in_month(year, month);
    NaiveDate::from_ymd_opt(year, month, day.clamp(1, last))
        .unwrap_or_else(|| NaiveDate::from_ymd_opt(year, month, 1).expect("month in 1..=12"))
}

fn days_in_month(year: i32, month: u32) -> u32 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        _ => {
            if NaiveDate::from_ymd_opt(year, 2, 29).is_some() {
                29
            } else {
                28
            }
        }
    }
}

fn at(date: NaiveDate, hour: u32, minute: u32) -> DateTime<Utc> {
    date.and_hms_opt(hour.min(23), minute.min(59), 0)
        .expect("clamped time components are valid")
        .and_utc()
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Schedule::Every(interval) => write!(f, "every {}", format_interval(interval)),
            Schedule::Hourly { minute } => write!(f, "hourly at :{minute:02}"),
            Schedule::Daily { hour, minute } => write!(f, "daily at {hour:02}:{minute:02}"),
            Schedule::Weekly {
                weekday,
                hour,
                minute,
            } => write!(f, "weekly on {weekday} at {hour:02}:{minute:02}"),
            Schedule::Monthly { day, hour, minute } => {
                write!(f, "monthly on day {day} at {hour:02}:{minute:02}")
            }
        }
    }
}

fn format_interval(interval: Duration) -> String {
    let secs = interval.as_secs();
    if secs >= 3600 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs >= 60 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn every_advances_by_interval() {
        let from = utc(2025, 3, 10, 12, 0, 0);
        let next = Schedule::every_minutes(5).next(from);
        assert_eq!(next, utc(2025, 3, 10, 12, 5, 0));
    }

    #[test]
    fn every_is_strictly_after_from() {
        let from = utc(2025, 3, 10, 12, 0, 0);
        assert!(Schedule::every_minute().next(from) > from);
    }

    #[test]
    fn hourly_rolls_to_next_hour_when_minute_passed() {
        let schedule = Schedule::hourly_at(15);
        assert_eq!(
            schedule.next(utc(2025, 3, 10, 12, 10, 0)),
            utc(2025, 3, 10, 12, 15, 0)
        );
        assert_eq!(
            schedule.next(utc(2025, 3, 10, 12, 15, 0)),
            utc(2025, 3, 10, 13, 15, 0)
        );
        assert_eq!(
            schedule.next(utc(2025, 3, 10, 12, 40, 0)),
            utc(2025, 3, 10, 13, 15, 0)
        );
    }

    #[test]
    fn daily_rolls_to_tomorrow_when_time_passed() {
        let schedule = Schedule::daily_at(9, 30);
        assert_eq!(
            schedule.next(utc(2025, 3, 10, 8, 0, 0)),
            utc(2025, 3, 10, 9, 30, 0)
        );
        assert_eq!(
            schedule.next(utc(2025, 3, 10, 9, 30, 0)),
            utc(2025, 3, 11, 9, 30, 0)
        );
    }

    #[test]
    fn weekly_targets_the_requested_weekday() {
        // 2025-03-10 is a Monday.
        let schedule = Schedule::weekly_on(Weekday::Wed, 6, 0);
        assert_eq!(
            schedule.next(utc(2025, 3, 10, 0, 0, 0)),
            utc(2025, 3, 12, 6, 0, 0)
        );
        // From Wednesday after the fire time, next week.
        assert_eq!(
            schedule.next(utc(2025, 3, 12, 7, 0, 0)),
            utc(2025, 3, 19, 6, 0, 0)
        );
    }

    #[test]
    fn monthly_clamps_day_to_month_length() {
        let schedule = Schedule::monthly(31);
        // April has 30 days.
        assert_eq!(
            schedule.next(utc(2025, 4, 1, 0, 0, 0)),
            utc(2025, 4, 30, 0, 0, 0)
        );
        // February 2024 is a leap month.
        assert_eq!(
            schedule.next(utc(2024, 2, 1, 0, 0, 0)),
            utc(2024, 2, 29, 0, 0, 0)
        );
    }

    #[test]
    fn monthly_rolls_over_the_year() {
        let schedule = Schedule::monthly_on(15, 12, 0);
        assert_eq!(
            schedule.next(utc(2025, 12, 20, 0, 0, 0)),
            utc(2026, 1, 15, 12, 0, 0)
        );
    }

    #[test]
    fn next_is_idempotent() {
        let from = utc(2025, 3, 10, 12, 34, 56);
        for schedule in [
            Schedule::every_minutes(7),
            Schedule::hourly_at(5),
            Schedule::daily_at(23, 59),
            Schedule::weekly(Weekday::Sun),
            Schedule::monthly(1),
        ] {
            assert_eq!(schedule.next(from), schedule.next(from));
            assert!(schedule.next(from) > from);
        }
    }

    #[test]
    fn out_of_range_components_are_clamped() {
        assert_eq!(Schedule::hourly_at(75), Schedule::Hourly { minute: 59 });
        assert_eq!(
            Schedule::daily_at(30, 99),
            Schedule::Daily {
                hour: 23,
                minute: 59
            }
        );
        assert_eq!(
            Schedule::monthly(0),
            Schedule::Monthly {
                day: 1,
                hour: 0,
                minute: 0
            }
        );
    }

    #[test]
    fn display_forms_are_stable() {
        assert_eq!(Schedule::every_minutes(5).to_string(), "every 5m");
        assert_eq!(Schedule::every_hours(2).to_string(), "every 2h");
        assert_eq!(
            Schedule::every(Duration::from_secs(90)).to_string(),
            "every 90s"
        );
        assert_eq!(Schedule::hourly_at(15).to_string(), "hourly at :15");
        assert_eq!(Schedule::daily_at(9, 30).to_string(), "daily at 09:30");
        assert_eq!(
            Schedule::weekly_on(Weekday::Mon, 8, 0).to_string(),
            "weekly on Mon at 08:00"
        );
        assert_eq!(
            Schedule::monthly_on(1, 0, 0).to_string(),
            "monthly on day 1 at 00:00"
        );
    }
}
