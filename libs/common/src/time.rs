//! Wall-clock helpers shared by the services.

use chrono::{DateTime, Utc};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert epoch milliseconds back into a UTC timestamp.
///
/// Out-of-range values clamp to the Unix epoch.
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
