use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::Deserialize;

use crate::models::Period;

/// How often a batch runs and how long a reporting period is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleMode {
    Weekly,
    Monthly,
}

impl ScheduleMode {
    /// Window length used by the rolling policy.
    pub fn rolling_days(self) -> i64 {
        match self {
            ScheduleMode::Weekly => 7,
            ScheduleMode::Monthly => 30,
        }
    }
}

/// How period boundaries are drawn. One policy per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodPolicy {
    /// Whole calendar months, or whole Monday–Sunday weeks.
    Calendar,
    /// N-day windows ending today (exclusive).
    Rolling,
}

#[derive(Debug, Clone, Copy)]
pub struct PeriodCalculator {
    pub mode: ScheduleMode,
    pub policy: PeriodPolicy,
}

impl PeriodCalculator {
    pub fn new(mode: ScheduleMode, policy: PeriodPolicy) -> Self {
        Self { mode, policy }
    }

    pub fn current(&self, today: NaiveDate) -> Period {
        match (self.policy, self.mode) {
            (PeriodPolicy::Calendar, ScheduleMode::Monthly) => {
                let end = first_of_month(today) - Duration::days(1);
                month_period(end)
            }
            (PeriodPolicy::Calendar, ScheduleMode::Weekly) => {
                let since_monday = today.weekday().num_days_from_monday() as i64;
                week_period(today - Duration::days(since_monday + 1))
            }
            (PeriodPolicy::Rolling, mode) => {
                let n = mode.rolling_days();
                rolling_period(today - Duration::days(n), today - Duration::days(1))
            }
        }
    }

    pub fn prior(&self, today: NaiveDate) -> Period {
        let current = self.current(today);
        match (self.policy, self.mode) {
            (PeriodPolicy::Calendar, ScheduleMode::Monthly) => month_period(current.start - Duration::days(1)),
            (PeriodPolicy::Calendar, ScheduleMode::Weekly) => week_period(current.start - Duration::days(1)),
            (PeriodPolicy::Rolling, mode) => {
                let n = mode.rolling_days();
                rolling_period(current.start - Duration::days(n), current.start - Duration::days(1))
            }
        }
    }

    /// Whether a scheduled batch should run, given the latest processed period end.
    ///
    /// Calendar periods are due once a newer period has closed. Rolling windows are
    /// due once the next window starts after the last processed date.
    pub fn is_due(&self, today: NaiveDate, last_processed: Option<NaiveDate>) -> bool {
        let Some(last) = last_processed else {
            return true;
        };
        match self.policy {
            PeriodPolicy::Calendar => last < self.current(today).end,
            PeriodPolicy::Rolling => today - Duration::days(self.mode.rolling_days()) > last,
        }
    }
}

/// Wall-clock date in the configured timezone.
pub fn today_in(tz: Tz, now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(&tz).date_naive()
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.day0() as i64)
}

/// Calendar month containing `end`, where `end` is the month's last day.
fn month_period(end: NaiveDate) -> Period {
    Period {
        year: Some(end.year()),
        index: Some(end.month()),
        start: first_of_month(end),
        end,
    }
}

/// Monday–Sunday week ending on `end` (a Sunday), indexed by ISO week.
fn week_period(end: NaiveDate) -> Period {
    let iso = end.iso_week();
    Period {
        year: Some(iso.year()),
        index: Some(iso.week()),
        start: end - Duration::days(6),
        end,
    }
}

fn rolling_period(start: NaiveDate, end: NaiveDate) -> Period {
    Period {
        year: None,
        index: None,
        start,
        end,
    }
}
