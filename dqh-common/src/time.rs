//! Timestamp utilities
//!
//! Timestamps are persisted as RFC 3339 text with millisecond precision and a
//! `Z` suffix, so lexical order in SQL equals chronological order.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::{Error, Result};

/// Get current UTC timestamp, truncated to what the database stores
pub fn now() -> DateTime<Utc> {
    let now = Utc::now();
    // Round-trip through the stored format so in-memory and persisted values agree
    DateTime::parse_from_rfc3339(&to_db(&now))
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(now)
}

/// Format a timestamp for storage
pub fn to_db(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored timestamp
pub fn from_db(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Failed to parse timestamp '{}': {}", value, e)))
}

/// Parse an optional stored timestamp
pub fn from_db_opt(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(from_db).transpose()
}

/// Milliseconds between two timestamps, clamped at zero
pub fn elapsed_ms(start: &DateTime<Utc>, end: &DateTime<Utc>) -> i64 {
    (*end - *start).num_milliseconds().max(0)
}
