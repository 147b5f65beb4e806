//! Timestamp utilities
//!
//! Timestamps are persisted as fixed-width RFC 3339 strings with microsecond
//! precision and a `Z` suffix, so lexicographic order in SQL matches
//! chronological order.

use crate::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};

/// Get current UTC timestamp, truncated to the persisted precision
pub fn now() -> DateTime<Utc> {
    truncate_micros(Utc::now())
}

/// Convert milliseconds to duration
pub fn millis_to_duration(millis: u64) -> std::time::Duration {
    std::time::Duration::from_millis(millis)
}

/// Drop sub-microsecond precision so values survive a database round trip
pub fn truncate_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(ts.timestamp_micros()).unwrap_or(ts)
}

/// Format a timestamp for storage
pub fn to_db(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Format an optional timestamp for storage
pub fn opt_to_db(ts: Option<&DateTime<Utc>>) -> Option<String> {
    ts.map(to_db)
}

/// Parse a stored timestamp
pub fn from_db(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Invalid stored timestamp '{}': {}", value, e)))
}

/// Parse an optional stored timestamp; empty strings read as `None`
pub fn opt_from_db(value: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    match value {
        Some(s) if !s.is_empty() => from_db(s).map(Some),
        _ => Ok(None),
    }
}
