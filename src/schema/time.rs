//! UTC timestamp handling.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::ValidationError;

/// Format of date partition directory names.
pub const PARTITION_DATE_FORMAT: &str = "%Y-%m-%d";

/// Parse an RFC 3339 timestamp that is explicitly UTC.
///
/// `Z` and `+00:00` are accepted. `-00:00` (unknown local offset), any other
/// offset, and naive timestamps are rejected.
pub fn parse_utc_timestamp(value: &str) -> Result<DateTime<Utc>, ValidationError> {
    let trimmed = value.trim();
    if trimmed.ends_with("-00:00") {
        return Err(ValidationError::InvalidTimestamp {
            value: value.to_string(),
            reason: "offset -00:00 denotes an unknown local offset".to_string(),
        });
    }

    let parsed = DateTime::parse_from_rfc3339(trimmed).map_err(|e| {
        ValidationError::InvalidTimestamp {
            value: value.to_string(),
            reason: format!("not an RFC 3339 timestamp with offset: {}", e),
        }
    })?;

    if parsed.offset().local_minus_utc() != 0 {
        return Err(ValidationError::InvalidTimestamp {
            value: value.to_string(),
            reason: "timestamp must be UTC".to_string(),
        });
    }

    Ok(parsed.with_timezone(&Utc))
}

/// Canonical textual form used in every document.
pub fn format_utc(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Partition directory name for a timestamp.
pub fn partition_date(ts: &DateTime<Utc>) -> String {
    ts.format(PARTITION_DATE_FORMAT).to_string()
}
