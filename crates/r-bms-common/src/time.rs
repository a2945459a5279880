//! ---
//! bms_section: "01-core-functionality"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Shared primitives and utilities for the core runtime."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
//! Helpers for the explicit `now` clock threaded through the protection core.
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// Point in time `delay` after `now`, saturating at the end of the representable range.
pub fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Time elapsed from `since` to `now`, or zero when `since` lies in the future.
pub fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

/// Convert a telemetry millisecond timestamp.
pub fn from_millis(timestamp_ms: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
}

pub fn minutes(count: u64) -> Duration {
    Duration::from_secs(count.saturating_mul(60))
}
