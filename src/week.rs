//! Week arithmetic anchored on a group's tracking day.
//!
//! A week is identified by its start date; the window is the seven days
//! `[start, start + 6]`, interpreted as UTC calendar days.

use chrono::{Datelike, Days, NaiveDate, Weekday};

use crate::chart::ValidationError;

/// Convert a stored tracking day (0 = Monday .. 6 = Sunday) into a weekday.
pub fn tracking_weekday(day: i64) -> Result<Weekday, ValidationError> {
    match day {
        0 => Ok(Weekday::Mon),
        1 => Ok(Weekday::Tue),
        2 => Ok(Weekday::Wed),
        3 => Ok(Weekday::Thu),
        4 => Ok(Weekday::Fri),
        5 => Ok(Weekday::Sat),
        6 => Ok(Weekday::Sun),
        other => Err(ValidationError::TrackingDay(other)),
    }
}

/// Start of the week containing `date`: the latest `anchor` weekday on or before it.
pub fn week_start_for(date: NaiveDate, anchor: Weekday) -> NaiveDate {
    let back = (7 + date.weekday().num_days_from_monday() - anchor.num_days_from_monday()) % 7;
    date - Days::new(back as u64)
}

/// Last day of the week window starting at `start`.
pub fn week_end(start: NaiveDate) -> NaiveDate {
    start + Days::new(6)
}

pub fn next_week(start: NaiveDate) -> NaiveDate {
    start + Days::new(7)
}

/// Whether the windows starting at `a` and `b` share at least one day.
pub fn windows_overlap(a: NaiveDate, b: NaiveDate) -> bool {
    a <= week_end(b) && b <= week_end(a)
}

/// First week to generate after `last_start` once the group is anchored on `anchor`.
///
/// This is the first `anchor` weekday strictly after `last_start`; with an
/// unchanged anchor it is simply the following week.
pub fn upcoming_week_start(last_start: NaiveDate, anchor: Weekday) -> NaiveDate {
    week_start_for(last_start + Days::new(7), anchor)
}

/// All week starts on `anchor` whose windows end on or before `through`,
/// beginning with the week that contains `from`.
pub fn completed_weeks(from: NaiveDate, through: NaiveDate, anchor: Weekday) -> Vec<NaiveDate> {
    let mut weeks = Vec::new();
    let mut start = week_start_for(from, anchor);
    while week_end(start) <= through {
        weeks.push(start);
        start = next_week(start);
    }
    weeks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_week_start_for() {
        // 2024-01-03 is a Wednesday
        assert_eq!(week_start_for(d("2024-01-03"), Weekday::Mon), d("2024-01-01"));
        assert_eq!(week_start_for(d("2024-01-03"), Weekday::Wed), d("2024-01-03"));
        assert_eq!(week_start_for(d("2024-01-03"), Weekday::Thu), d("2023-12-28"));
        assert_eq!(week_start_for(d("2024-01-07"), Weekday::Sun), d("2024-01-07"));
    }

    #[test]
    fn test_tracking_weekday() {
        assert_eq!(tracking_weekday(0).unwrap(), Weekday::Mon);
        assert_eq!(tracking_weekday(6).unwrap(), Weekday::Sun);
        assert!(tracking_weekday(7).is_err());
        assert!(tracking_weekday(-1).is_err());
    }

    #[test]
    fn test_upcoming_week_same_anchor() {
        assert_eq!(upcoming_week_start(d("2024-01-01"), Weekday::Mon), d("2024-01-08"));
    }

    #[test]
    fn test_upcoming_week_after_anchor_change_overlaps() {
        // Monday week 2024-01-01..07, re-anchored on Wednesday
        let upcoming = upcoming_week_start(d("2024-01-01"), Weekday::Wed);
        assert_eq!(upcoming, d("2024-01-03"));
        assert!(windows_overlap(upcoming, d("2024-01-01")));
        assert!(!windows_overlap(d("2024-01-08"), d("2024-01-01")));
    }

    #[test]
    fn test_completed_weeks() {
        let weeks = completed_weeks(d("2024-01-03"), d("2024-01-21"), Weekday::Mon);
        assert_eq!(weeks, vec![d("2024-01-01"), d("2024-01-08"), d("2024-01-15")]);
        // A window ending after `through` is not complete
        let weeks = completed_weeks(d("2024-01-03"), d("2024-01-20"), Weekday::Mon);
        assert_eq!(weeks.len(), 2);
    }
}
