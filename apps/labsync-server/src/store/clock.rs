//! Store-wide `updated_at` stamps
//!
//! Every entity write takes the next stamp from a single clock so that no two
//! writes share an `updated_at`. Pull watermarks rely on this: resuming at the
//! last included stamp cannot skip a record that tied with it.

use chrono::{DateTime, Duration, Utc};

use super::StoreError;

/// Next stamp after `last`, never behind `now`, at microsecond precision.
pub fn next_stamp(last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    let now = truncate_micros(now);
    match last {
        Some(last) if last >= now => last + Duration::microseconds(1),
        _ => now,
    }
}

pub fn truncate_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(ts.timestamp_micros()).unwrap_or(ts)
}

pub fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

pub fn from_micros(micros: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {}", micros)))
}
