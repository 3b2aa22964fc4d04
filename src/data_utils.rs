//! Shared parsing helpers for heterogeneous extract values.

use crate::error::{DwhError, Result};
use chrono::{NaiveDate, NaiveDateTime};

/// Timestamp layouts seen across the source extracts.
const TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S%.f",
];

/// Parse an event timestamp. Date-only values resolve to midnight. A value
/// none of the known layouts accept is a per-row validation failure.
pub fn parse_event_timestamp(raw: &str) -> Result<NaiveDateTime> {
    let trimmed = raw.trim();
    for format in TIMESTAMP_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(parsed);
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(midnight);
        }
    }
    Err(DwhError::Validation(format!(
        "Malformed timestamp: '{}'",
        raw
    )))
}

/// Parse a required timestamp field: absent and malformed are both per-row
/// validation failures.
pub fn required_timestamp(raw: Option<&str>, field: &str) -> Result<NaiveDateTime> {
    match raw {
        Some(value) => parse_event_timestamp(value),
        None => Err(DwhError::Validation(format!(
            "Missing required field '{}'",
            field
        ))),
    }
}
