//! Day bucketing for daily pools and allocations.
//!
//! A [`DayKey`] is a calendar date in a fixed UTC offset. Both the token
//! economy and the daily scheduler derive keys through a single
//! [`DayCalendar`] so they can never disagree about which day it is.

use std::fmt;

use chrono::{Datelike, Duration, FixedOffset, NaiveDate, Offset, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::Timestamp;

/// Seconds per hour.
const SECS_PER_HOUR: i32 = 3600;

/// Largest UTC offset accepted, in hours.
const MAX_OFFSET_HOURS: i32 = 14;

/// Stable identifier of one day bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DayKey(NaiveDate);

impl DayKey {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    /// Build a key from year/month/day, rejecting impossible dates.
    pub fn from_ymd(year: i32, month: u32, day: u32) -> Result<Self, CoreError> {
        NaiveDate::from_ymd_opt(year, month, day)
            .map(Self)
            .ok_or_else(|| CoreError::Validation(format!("Invalid day key {year}-{month}-{day}")))
    }

    pub fn date(self) -> NaiveDate {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0 + Duration::days(1))
    }

    pub fn previous(self) -> Self {
        Self(self.0 - Duration::days(1))
    }
}

impl fmt::Display for DayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.0.year(), self.0.month(), self.0.day())
    }
}

impl From<NaiveDate> for DayKey {
    fn from(date: NaiveDate) -> Self {
        Self(date)
    }
}

/// Converts instants into day keys for a fixed timezone.
#[derive(Debug, Clone, Copy)]
pub struct DayCalendar {
    offset: FixedOffset,
}

impl DayCalendar {
    /// Calendar in UTC.
    pub fn utc() -> Self {
        Self {
            offset: Utc.fix(),
        }
    }

    /// Calendar for a whole-hour UTC offset (e.g. `9` for UTC+9).
    pub fn with_offset_hours(hours: i32) -> Result<Self, CoreError> {
        if hours.abs() > MAX_OFFSET_HOURS {
            return Err(CoreError::Config(format!(
                "Day key offset must be within +/-{MAX_OFFSET_HOURS} hours, got {hours}"
            )));
        }
        let offset = FixedOffset::east_opt(hours * SECS_PER_HOUR)
            .ok_or_else(|| CoreError::Config(format!("Invalid UTC offset: {hours}")))?;
        Ok(Self { offset })
    }

    /// The day bucket containing `at`.
    pub fn day_key(&self, at: Timestamp) -> DayKey {
        DayKey(at.with_timezone(&self.offset).date_naive())
    }

    /// The instant a given day starts, expressed in UTC.
    pub fn start_of(&self, day: DayKey) -> Timestamp {
        self.at_hour(day, 0)
    }

    /// The instant `hour:00` local time on `day`, in UTC.
    ///
    /// Hours past 23 roll into the following day.
    pub fn at_hour(&self, day: DayKey, hour: u32) -> Timestamp {
        let midnight = day.0.and_hms_opt(0, 0, 0).unwrap_or_default();
        let local = self
            .offset
            .from_local_datetime(&midnight)
            .single()
            .unwrap_or_else(|| self.offset.from_utc_datetime(&midnight));
        (local + Duration::hours(i64::from(hour))).with_timezone(&Utc)
    }

    /// First instant of the day after the one containing `at`.
    pub fn next_boundary(&self, at: Timestamp) -> Timestamp {
        self.start_of(self.day_key(at).next())
    }
}

impl Default for DayCalendar {
    fn default() -> Self {
        Self::utc()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utc_day_key_is_calendar_date() {
        let cal = DayCalendar::utc();
        let at = Utc.with_ymd_and_hms(2026, 5, 4, 23, 59, 59).unwrap();
        assert_eq!(cal.day_key(at).to_string(), "2026-05-04");
    }

    #[test]
    fn positive_offset_moves_late_utc_into_next_day() {
        let cal = DayCalendar::with_offset_hours(9).unwrap();
        let at = Utc.with_ymd_and_hms(2026, 5, 4, 16, 0, 0).unwrap();
        assert_eq!(cal.day_key(at), DayKey::from_ymd(2026, 5, 5).unwrap());
    }

    #[test]
    fn negative_offset_keeps_early_utc_in_previous_day() {
        let cal = DayCalendar::with_offset_hours(-5).unwrap();
        let at = Utc.with_ymd_and_hms(2026, 5, 4, 3, 0, 0).unwrap();
        assert_eq!(cal.day_key(at), DayKey::from_ymd(2026, 5, 3).unwrap());
    }

    #[test]
    fn next_boundary_is_local_midnight() {
        let cal = DayCalendar::with_offset_hours(2).unwrap();
        let at = Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap();
        // Local midnight of 2026-05-05 at UTC+2 is 22:00 UTC on the 4th.
        assert_eq!(
            cal.next_boundary(at),
            Utc.with_ymd_and_hms(2026, 5, 4, 22, 0, 0).unwrap()
        );
    }

    #[test]
    fn at_hour_converts_to_utc() {
        let cal = DayCalendar::utc();
        let day = DayKey::from_ymd(2026, 1, 31).unwrap();
        assert_eq!(
            cal.at_hour(day, 23),
            Utc.with_ymd_and_hms(2026, 1, 31, 23, 0, 0).unwrap()
        );
    }

    #[test]
    fn offset_out_of_range_rejected() {
        assert!(DayCalendar::with_offset_hours(15).is_err());
    }

    #[test]
    fn impossible_date_rejected() {
        assert!(DayKey::from_ymd(2026, 2, 30).is_err());
    }

    #[test]
    fn next_and_previous_are_inverse() {
        let day = DayKey::from_ymd(2026, 12, 31).unwrap();
        assert_eq!(day.next().to_string(), "2027-01-01");
        assert_eq!(day.next().previous(), day);
    }
}
