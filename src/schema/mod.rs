//! Record shapes and boundary validation.
//!
//! Every persisted document carries `schema_version` and `schema_id`
//! (`run-artifacts/<type>@<major>`). Readers accept any document whose major
//! version matches and reject the rest as corrupt.

mod advisory;
mod record;
mod run_id;
mod time;

pub use advisory::{
    validate_advisory_id, AdvisoryKind, AdvisoryRecord, AdvisoryRef, ExplanationRecord,
    ExplanationStatus, ADVISORY_SCHEMA_ID, EXPLANATION_SCHEMA_ID,
};
pub use record::{
    Decision, Hashes, RiskLevel, RunArtifact, RunArtifactBuilder, RunStatus, RUN_ARTIFACT_SCHEMA_ID,
};
pub use run_id::{RunId, RUN_ID_HEX_LEN, RUN_ID_PREFIX};
pub use time::{format_utc, parse_utc_timestamp, partition_date, PARTITION_DATE_FORMAT};

/// Major version shared by every document this crate writes.
pub const SCHEMA_VERSION: u32 = 1;

/// Check that `schema_id` names the expected document type at the current major.
pub fn check_schema_id(expected: &str, actual: &str) -> Result<(), String> {
    if expected == actual {
        return Ok(());
    }
    let (expected_prefix, _) = expected.rsplit_once('@').unwrap_or((expected, ""));
    match actual.rsplit_once('@') {
        Some((prefix, major)) if prefix == expected_prefix => Err(format!(
            "unsupported schema major version {} (expected {})",
            major, expected
        )),
        _ => Err(format!("schema_id '{}' is not '{}'", actual, expected)),
    }
}
