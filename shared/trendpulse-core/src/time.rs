//! Hour and day bucketing helpers
//!
//! All aggregates are keyed in UTC. An hourly bucket is identified by the
//! timestamp truncated to the start of its hour, a daily bucket by its
//! calendar date.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};

/// Truncate a timestamp to the start of its hour
pub fn truncate_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    let secs = ts.timestamp();
    let hour_start = secs - secs.rem_euclid(3600);
    Utc.timestamp_opt(hour_start, 0).single().unwrap_or(ts)
}

/// Calendar date (UTC) a timestamp falls on
pub fn truncate_to_day(ts: DateTime<Utc>) -> NaiveDate {
    ts.date_naive()
}

/// Half-open bounds `[date 00:00, date+1 00:00)` of a day
pub fn day_bounds(date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN));
    (start, start + Duration::days(1))
}

/// Hour of day (0..24) used to index the daily breakdown
pub fn hour_of_day(ts: DateTime<Utc>) -> usize {
    ts.hour() as usize
}
