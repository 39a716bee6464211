//! Time utilities for activity bookkeeping
//!
//! Timestamps are unix milliseconds throughout.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current unix timestamp in milliseconds.
///
/// Returns 0 on a clock set before the epoch.
pub fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Merge an activity report into the stored value.
///
/// Activity only moves forward; an older report leaves `stored` unchanged.
/// Returns true if `stored` was advanced.
pub fn advance_activity(stored: &mut Option<u64>, reported: u64) -> bool {
    match stored {
        Some(current) if *current >= reported => false,
        _ => {
            *stored = Some(reported);
            true
        }
    }
}

/// Whether `last_activity` is older than `idle_for` as of `now`.
///
/// A record with no activity at all is never idle by this measure.
pub fn is_idle(last_activity: Option<u64>, idle_for: Duration, now: u64) -> bool {
    match last_activity {
        Some(last) => now.saturating_sub(last) > idle_for.as_millis() as u64,
        None => false,
    }
}
