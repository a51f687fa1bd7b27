//! Wall-clock helpers.
//!
//! Domain rules take `now` as a parameter; only the service edges read the
//! clock, through [`now_millis`].

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Get current time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Convert a duration to whole milliseconds, saturating at `i64::MAX`.
pub fn duration_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// `at + d`, saturating.
pub fn add_duration(at: i64, d: Duration) -> i64 {
    at.saturating_add(duration_millis(d))
}
