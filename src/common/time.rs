//! Time utilities for timestamping chat and heartbeat frames.

use chrono::{TimeZone, Utc};

/// Current Unix timestamp in milliseconds (UTC).
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Render a millisecond Unix timestamp as an RFC 3339 string for display.
///
/// Falls back to the raw number when the timestamp is out of chrono's range.
pub fn format_millis(timestamp_millis: i64) -> String {
    match Utc.timestamp_millis_opt(timestamp_millis).single() {
        Some(dt) => dt.to_rfc3339(),
        None => timestamp_millis.to_string(),
    }
}
