//! Advisory references and explanation status.
//!
//! Both live in side files next to the core record; neither is ever written
//! into the core record itself.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use super::{RunId, SCHEMA_VERSION};
use crate::error::ValidationError;

/// Schema identifier for `{run_id}_advisory_{advisory_id}.json`.
pub const ADVISORY_SCHEMA_ID: &str = "run-artifacts/advisory@1";

/// Schema identifier for `{run_id}_explanation.json`.
pub const EXPLANATION_SCHEMA_ID: &str = "run-artifacts/explanation@1";

fn advisory_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").expect("advisory_id pattern is a valid regex")
    })
}

/// Validate an advisory id; it becomes part of a side-file name.
pub fn validate_advisory_id(value: &str) -> Result<(), ValidationError> {
    if advisory_id_pattern().is_match(value) {
        Ok(())
    } else {
        Err(ValidationError::InvalidIdentifier {
            field: "advisory_id",
            value: value.to_string(),
        })
    }
}

/// Kind of advisory asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdvisoryKind {
    Explanation,
    Advisory,
    Note,
    #[serde(other)]
    Unknown,
}

impl AdvisoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Explanation => "explanation",
            Self::Advisory => "advisory",
            Self::Note => "note",
            Self::Unknown => "unknown",
        }
    }
}

impl FromStr for AdvisoryKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "explanation" => Self::Explanation,
            "advisory" => Self::Advisory,
            "note" => Self::Note,
            _ => Self::Unknown,
        })
    }
}

impl fmt::Display for AdvisoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pointer from a run artifact to an externally generated advisory asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvisoryRef {
    pub advisory_id: String,
    pub kind: AdvisoryKind,
    pub engine_id: String,
    pub engine_version: String,
    pub request_id: String,
    pub created_at: DateTime<Utc>,
}

/// On-disk form of an advisory side file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvisoryRecord {
    pub schema_version: u32,
    pub schema_id: String,
    pub run_id: RunId,
    #[serde(flatten)]
    pub advisory: AdvisoryRef,
}

impl AdvisoryRecord {
    pub fn new(run_id: RunId, advisory: AdvisoryRef) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            schema_id: ADVISORY_SCHEMA_ID.to_string(),
            run_id,
            advisory,
        }
    }
}

/// Lifecycle of the explanation attached to a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExplanationStatus {
    #[default]
    None,
    Pending,
    Ready,
    Error,
}

impl FromStr for ExplanationStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NONE" => Ok(Self::None),
            "PENDING" => Ok(Self::Pending),
            "READY" => Ok(Self::Ready),
            "ERROR" => Ok(Self::Error),
            other => Err(ValidationError::InvalidValue {
                field: "explanation_status".to_string(),
                reason: format!("'{}' is not one of NONE, PENDING, READY, ERROR", other),
            }),
        }
    }
}

/// On-disk form of the explanation side file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplanationRecord {
    pub schema_version: u32,
    pub schema_id: String,
    pub run_id: RunId,
    pub status: ExplanationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ExplanationRecord {
    pub fn new(run_id: RunId, status: ExplanationStatus, summary: Option<String>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            schema_id: EXPLANATION_SCHEMA_ID.to_string(),
            run_id,
            status,
            summary,
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advisory_id_validation() {
        assert!(validate_advisory_id("adv_001").is_ok());
        assert!(validate_advisory_id("A-1").is_ok());
        assert!(validate_advisory_id("").is_err());
        assert!(validate_advisory_id("_leading").is_err());
        assert!(validate_advisory_id("../x").is_err());
        assert!(validate_advisory_id("a.json").is_err());
        assert!(validate_advisory_id(&"a".repeat(65)).is_err());
    }

    #[test]
    fn test_unknown_kind_deserializes() {
        let kind: AdvisoryKind = serde_json::from_str("\"hologram\"").unwrap();
        assert_eq!(kind, AdvisoryKind::Unknown);
        assert_eq!("Explanation".parse::<AdvisoryKind>().unwrap(), AdvisoryKind::Explanation);
    }

    #[test]
    fn test_advisory_record_is_flat() {
        let record = AdvisoryRecord::new(
            RunId::parse("run_abc123def456").unwrap(),
            AdvisoryRef {
                advisory_id: "adv_001".to_string(),
                kind: AdvisoryKind::Explanation,
                engine_id: "explainer".to_string(),
                engine_version: "1.2.0".to_string(),
                request_id: "req-9".to_string(),
                created_at: Utc::now(),
            },
        );
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["schema_id"], ADVISORY_SCHEMA_ID);
        assert_eq!(value["advisory_id"], "adv_001");
        assert_eq!(value["kind"], "explanation");
    }

    #[test]
    fn test_explanation_status_parse() {
        assert_eq!("ready".parse::<ExplanationStatus>().unwrap(), ExplanationStatus::Ready);
        assert!("DONE".parse::<ExplanationStatus>().is_err());
        assert_eq!(serde_json::to_string(&ExplanationStatus::None).unwrap(), "\"NONE\"");
    }
}
