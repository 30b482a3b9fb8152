use chrono::{DateTime, NaiveDate, Utc};

/// Returns every date in the inclusive range [start, end].
pub fn days(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    start
        .iter_days()
        .take_while(|d| *d <= end)
        .collect()
}

/// UTC dates touched by the instant range [start, end].
pub fn utc_days(start: &DateTime<Utc>, end: &DateTime<Utc>) -> Vec<NaiveDate> {
    days(start.date_naive(), end.date_naive())
}
