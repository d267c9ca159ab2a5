//! Wall-clock helpers
//!
//! Samples and durable rows carry milliseconds since the Unix epoch.

use chrono::{DateTime, Utc};

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Convert an epoch-millisecond timestamp into a UTC date, if representable
pub fn to_datetime(millis: u64) -> Option<DateTime<Utc>> {
    i64::try_from(millis)
        .ok()
        .and_then(DateTime::from_timestamp_millis)
}
