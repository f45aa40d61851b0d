// src/timestamp.rs

use chrono::{Local, TimeZone, Utc};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix timestamp in seconds, used to stamp `started_at`/`exited_at`/
/// `last_updated` fields across the job table.
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_secs()
}

/// Renders a Unix timestamp in the local timezone, e.g. "2026-07-28 14:05:00".
/// Used by job snapshots and operator-facing logs.
pub fn format_unix_timestamp(timestamp: u64) -> String {
    match Utc.timestamp_opt(timestamp as i64, 0).single() {
        Some(dt_utc) => dt_utc
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
        None => "invalid timestamp".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_timestamp_is_plausible() {
        // Some time after this document was written.
        assert!(current_timestamp() > 1_700_000_000);
    }

    #[test]
    fn format_round_trips_a_known_instant() {
        let rendered = format_unix_timestamp(0);
        assert!(rendered.contains("1970") || rendered.contains("1969"));
    }
}
