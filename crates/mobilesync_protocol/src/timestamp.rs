//! Server timestamp parsing and formatting.
//!
//! Servers return modification dates either as RFC 3339 strings
//! (`2024-03-01T10:00:00.000Z`) or with a compact offset
//! (`2024-03-01T10:00:00.000+0000`). Sync checkpoints are kept as
//! milliseconds since the Unix epoch.

use crate::error::{ProtocolError, ProtocolResult};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

/// Parses a server timestamp into milliseconds since the epoch.
pub fn parse_millis(timestamp: &str) -> ProtocolResult<i64> {
    DateTime::parse_from_rfc3339(timestamp)
        .or_else(|_| DateTime::parse_from_str(timestamp, "%Y-%m-%dT%H:%M:%S%.f%z"))
        .map(|dt| dt.timestamp_millis())
        .map_err(|_| ProtocolError::InvalidTimestamp(timestamp.to_string()))
}

/// Formats milliseconds since the epoch the way SOQL date literals expect.
pub fn format_millis(millis: i64) -> ProtocolResult<String> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .ok_or_else(|| ProtocolError::InvalidTimestamp(millis.to_string()))
}

/// Compares two server timestamps.
///
/// Parsed instants are compared when both parse; otherwise the raw strings
/// are compared, which orders ISO 8601 values correctly within one format.
pub fn compare(left: &str, right: &str) -> std::cmp::Ordering {
    match (parse_millis(left), parse_millis(right)) {
        (Ok(l), Ok(r)) => l.cmp(&r),
        _ => left.cmp(right),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    #[test]
    fn parses_both_server_formats() {
        let a = parse_millis("2024-03-01T10:00:00.000Z").unwrap();
        let b = parse_millis("2024-03-01T10:00:00.000+0000").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, 1_709_287_200_000);
    }

    #[test]
    fn formats_as_soql_literal() {
        assert_eq!(
            format_millis(1_709_287_200_123).unwrap(),
            "2024-03-01T10:00:00.123Z"
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            parse_millis("yesterday"),
            Err(ProtocolError::InvalidTimestamp(_))
        ));
    }

    #[test]
    fn compare_mixed_formats() {
        assert_eq!(
            compare("2024-03-01T10:00:00.000Z", "2024-03-01T09:00:00.000+0000"),
            Ordering::Greater
        );
        assert_eq!(
            compare("2024-03-01T10:00:00.000Z", "2024-03-01T10:00:00.000+0000"),
            Ordering::Equal
        );
    }
}
