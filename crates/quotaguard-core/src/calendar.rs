//! Quota days in the provider's reset timezone.
//!
//! The provider resets the budget at local midnight in its own timezone
//! (Pacific time for the default provider), which moves relative to UTC across
//! daylight-saving changes. Everything here goes through `chrono-tz` so that
//! the date and the next reset instant are always computed on the calendar.

use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Reset timezone of the default provider.
pub const DEFAULT_QUOTA_TIMEZONE: Tz = chrono_tz::America::Los_Angeles;

/// Maps instants onto quota days.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaCalendar {
    tz: Tz,
}

impl Default for QuotaCalendar {
    fn default() -> Self {
        Self::new(DEFAULT_QUOTA_TIMEZONE)
    }
}

impl QuotaCalendar {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Quota day that `now` falls in.
    pub fn date_at(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.tz).date_naive()
    }

    /// First instant of the next quota day after `now`.
    pub fn next_reset(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = self.date_at(now);
        let tomorrow = today.succ_opt().unwrap_or(today);
        self.start_of(tomorrow)
    }

    /// First instant of `date` in the quota timezone.
    ///
    /// Zones that skip midnight on a transition day start the day at the
    /// first local time that exists.
    pub fn start_of(&self, date: NaiveDate) -> DateTime<Utc> {
        let mut local = NaiveDateTime::new(date, NaiveTime::MIN);
        for _ in 0..48 {
            match self.tz.from_local_datetime(&local) {
                LocalResult::Single(dt) => return dt.with_timezone(&Utc),
                LocalResult::Ambiguous(earliest, _) => return earliest.with_timezone(&Utc),
                LocalResult::None => local += Duration::minutes(30),
            }
        }
        // No zone has a day-long gap; treat the date as UTC.
        Utc.from_utc_datetime(&NaiveDateTime::new(date, NaiveTime::MIN))
    }

    /// Advisory lock key for a quota day.
    pub fn lock_key(&self, date: NaiveDate) -> i64 {
        lock_key_for(&date.format("%Y-%m-%d").to_string())
    }
}

/// Stable non-negative 64-bit key for an arbitrary string.
///
/// Uses the 31-multiplier string hash so every process derives the same key
/// for the same day.
pub fn lock_key_for(name: &str) -> i64 {
    let hash = name
        .chars()
        .fold(0i64, |acc, c| acc.wrapping_mul(31).wrapping_add(c as i64));
    hash.checked_abs().unwrap_or(i64::MAX)
}
