//! The canonical run artifact record.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::advisory::{AdvisoryRef, ExplanationStatus};
use super::{format_utc, parse_utc_timestamp, partition_date, RunId, SCHEMA_VERSION};
use crate::error::ValidationError;
use crate::hashing::{digest_of_canonical, HashError};

/// Schema identifier for core run artifact files.
pub const RUN_ARTIFACT_SCHEMA_ID: &str = "run-artifacts/run_artifact@1";

/// Mode recorded when the caller does not name one.
const UNSPECIFIED: &str = "unknown";

/// Terminal outcome of a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Ok,
    Blocked,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Blocked => "BLOCKED",
            Self::Error => "ERROR",
        }
    }

    /// Status implied by a decision when the caller does not state one.
    pub fn implied_by(risk_level: RiskLevel, block_reason: Option<&str>) -> Self {
        match risk_level {
            RiskLevel::Error => Self::Error,
            RiskLevel::Red => Self::Blocked,
            _ if block_reason.is_some() => Self::Blocked,
            _ => Self::Ok,
        }
    }
}

impl FromStr for RunStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OK" => Ok(Self::Ok),
            "BLOCKED" => Ok(Self::Blocked),
            "ERROR" => Ok(Self::Error),
            other => Err(ValidationError::InvalidValue {
                field: "status".to_string(),
                reason: format!("'{}' is not one of OK, BLOCKED, ERROR", other),
            }),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Risk classification produced by the feasibility engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Green,
    Yellow,
    Red,
    Unknown,
    Error,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Green => "GREEN",
            Self::Yellow => "YELLOW",
            Self::Red => "RED",
            Self::Unknown => "UNKNOWN",
            Self::Error => "ERROR",
        }
    }
}

impl FromStr for RiskLevel {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GREEN" => Ok(Self::Green),
            "YELLOW" => Ok(Self::Yellow),
            "RED" => Ok(Self::Red),
            "UNKNOWN" => Ok(Self::Unknown),
            "ERROR" => Ok(Self::Error),
            other => Err(ValidationError::InvalidValue {
                field: "risk_level".to_string(),
                reason: format!("'{}' is not one of GREEN, YELLOW, RED, UNKNOWN, ERROR", other),
            }),
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Feasibility decision embedded in a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub risk_level: RiskLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Digests binding a record to its inputs and outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hashes {
    /// Digest of the input that determined the decision.
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toolpath_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_hash: Option<String>,
}

/// Immutable record of one manufacturing decision event.
///
/// `advisory_refs`, `explanation_status` and `explanation_summary` form the
/// merged view: they are filled from side files at read time and are never
/// part of the core file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunArtifact {
    pub schema_version: u32,
    pub schema_id: String,
    pub run_id: RunId,
    pub created_at: DateTime<Utc>,
    pub mode: String,
    pub tool_id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub request_summary: Map<String, Value>,
    pub decision: Decision,
    pub hashes: Hashes,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub advisory_refs: Vec<AdvisoryRef>,
    #[serde(default)]
    pub explanation_status: ExplanationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation_summary: Option<String>,
    #[serde(default)]
    pub meta: Map<String, Value>,
}

impl RunArtifact {
    pub fn builder() -> RunArtifactBuilder {
        RunArtifactBuilder::default()
    }

    /// Re-check the required-field invariants on an already-typed record.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.hashes.content_hash.trim().is_empty() {
            return Err(ValidationError::MissingField { field: "content_hash" });
        }
        if let Some(score) = self.decision.score {
            if !score.is_finite() {
                return Err(ValidationError::InvalidValue {
                    field: "decision.score".to_string(),
                    reason: "score must be a finite number".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Whether the merged-view fields are all at their core defaults.
    pub fn is_core_only(&self) -> bool {
        self.advisory_refs.is_empty()
            && self.explanation_status == ExplanationStatus::None
            && self.explanation_summary.is_none()
    }

    /// Copy of this record with the merged view stripped.
    pub fn core(&self) -> Self {
        let mut core = self.clone();
        core.advisory_refs.clear();
        core.explanation_status = ExplanationStatus::None;
        core.explanation_summary = None;
        core
    }

    /// Canonical digest of the core record.
    pub fn core_digest(&self) -> Result<String, HashError> {
        digest_of_canonical(&self.core())
    }

    /// Name of the date partition this record lives in.
    pub fn partition_date(&self) -> String {
        partition_date(&self.created_at)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct DecisionInput {
    risk_level: Option<String>,
    score: Option<f64>,
    block_reason: Option<String>,
    warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct HashesInput {
    content_hash: Option<String>,
    toolpath_hash: Option<String>,
    program_hash: Option<String>,
    preview_hash: Option<String>,
}

/// Loosely-typed construction input for a [`RunArtifact`].
///
/// Deserializes from caller JSON with every field optional; [`build`] is the
/// single place where presence and format are enforced.
///
/// [`build`]: RunArtifactBuilder::build
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RunArtifactBuilder {
    run_id: Option<String>,
    created_at: Option<String>,
    mode: Option<String>,
    tool_id: Option<String>,
    status: Option<String>,
    request_summary: Option<Map<String, Value>>,
    decision: Option<DecisionInput>,
    hashes: Option<HashesInput>,
    outputs: Option<BTreeMap<String, String>>,
    meta: Option<Map<String, Value>>,
    // Present only so inline attempts can be refused.
    advisory_refs: Option<Value>,
    explanation_status: Option<Value>,
}

impl RunArtifactBuilder {
    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(format_utc(&created_at));
        self
    }

    /// Set `created_at` from caller text; validated in `build`.
    pub fn created_at_str(mut self, created_at: impl Into<String>) -> Self {
        self.created_at = Some(created_at.into());
        self
    }

    pub fn mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    pub fn tool_id(mut self, tool_id: impl Into<String>) -> Self {
        self.tool_id = Some(tool_id.into());
        self
    }

    pub fn status(mut self, status: RunStatus) -> Self {
        self.status = Some(status.as_str().to_string());
        self
    }

    pub fn risk_level(mut self, risk_level: RiskLevel) -> Self {
        self.decision_mut().risk_level = Some(risk_level.as_str().to_string());
        self
    }

    /// Set the risk level from caller text; validated in `build`.
    pub fn risk_level_str(mut self, risk_level: impl Into<String>) -> Self {
        self.decision_mut().risk_level = Some(risk_level.into());
        self
    }

    pub fn score(mut self, score: f64) -> Self {
        self.decision_mut().score = Some(score);
        self
    }

    pub fn block_reason(mut self, reason: impl Into<String>) -> Self {
        self.decision_mut().block_reason = Some(reason.into());
        self
    }

    pub fn warning(mut self, warning: impl Into<String>) -> Self {
        self.decision_mut().warnings.push(warning.into());
        self
    }

    pub fn content_hash(mut self, hash: impl Into<String>) -> Self {
        self.hashes_mut().content_hash = Some(hash.into());
        self
    }

    pub fn toolpath_hash(mut self, hash: impl Into<String>) -> Self {
        self.hashes_mut().toolpath_hash = Some(hash.into());
        self
    }

    pub fn program_hash(mut self, hash: impl Into<String>) -> Self {
        self.hashes_mut().program_hash = Some(hash.into());
        self
    }

    pub fn preview_hash(mut self, hash: impl Into<String>) -> Self {
        self.hashes_mut().preview_hash = Some(hash.into());
        self
    }

    pub fn request_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.request_summary
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }

    pub fn output(mut self, name: impl Into<String>, reference: impl Into<String>) -> Self {
        self.outputs
            .get_or_insert_with(BTreeMap::new)
            .insert(name.into(), reference.into());
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.meta.get_or_insert_with(Map::new).insert(key.into(), value);
        self
    }

    fn decision_mut(&mut self) -> &mut DecisionInput {
        self.decision.get_or_insert_with(DecisionInput::default)
    }

    fn hashes_mut(&mut self) -> &mut HashesInput {
        self.hashes.get_or_insert_with(HashesInput::default)
    }

    /// Validate and construct the record.
    ///
    /// Missing `run_id` and `created_at` are generated; missing `status` is
    /// implied by the decision. `content_hash` and `risk_level` have no
    /// default and must be present and non-blank.
    pub fn build(self) -> Result<RunArtifact, ValidationError> {
        if self.advisory_refs.is_some() {
            return Err(ValidationError::InvalidValue {
                field: "advisory_refs".to_string(),
                reason: "advisories are attached after creation, never inline".to_string(),
            });
        }
        if self.explanation_status.is_some() {
            return Err(ValidationError::InvalidValue {
                field: "explanation_status".to_string(),
                reason: "explanation status is set after creation, never inline".to_string(),
            });
        }

        let decision = self.decision.unwrap_or_default();
        let hashes = self.hashes.unwrap_or_default();

        let content_hash = required_text(hashes.content_hash, "content_hash")?;
        let risk_level: RiskLevel = required_text(decision.risk_level, "risk_level")?.parse()?;

        let run_id = match self.run_id {
            Some(id) => RunId::parse(&id)?,
            None => RunId::generate(),
        };
        let created_at = match self.created_at {
            Some(ts) => parse_utc_timestamp(&ts)?,
            None => Utc::now(),
        };

        if let Some(score) = decision.score {
            if !score.is_finite() {
                return Err(ValidationError::InvalidValue {
                    field: "decision.score".to_string(),
                    reason: "score must be a finite number".to_string(),
                });
            }
        }

        let block_reason = optional_text(decision.block_reason);
        let status = match self.status {
            Some(status) => status.parse()?,
            None => RunStatus::implied_by(risk_level, block_reason.as_deref()),
        };

        let artifact = RunArtifact {
            schema_version: SCHEMA_VERSION,
            schema_id: RUN_ARTIFACT_SCHEMA_ID.to_string(),
            run_id,
            created_at,
            mode: optional_text(self.mode).unwrap_or_else(|| UNSPECIFIED.to_string()),
            tool_id: optional_text(self.tool_id).unwrap_or_else(|| UNSPECIFIED.to_string()),
            status,
            request_summary: self.request_summary.unwrap_or_default(),
            decision: Decision {
                risk_level,
                score: decision.score,
                block_reason,
                warnings: decision.warnings,
            },
            hashes: Hashes {
                content_hash,
                toolpath_hash: optional_text(hashes.toolpath_hash),
                program_hash: optional_text(hashes.program_hash),
                preview_hash: optional_text(hashes.preview_hash),
            },
            outputs: self.outputs.unwrap_or_default(),
            advisory_refs: Vec::new(),
            explanation_status: ExplanationStatus::None,
            explanation_summary: None,
            meta: self.meta.unwrap_or_default(),
        };
        artifact.validate()?;
        Ok(artifact)
    }
}

fn required_text(value: Option<String>, field: &'static str) -> Result<String, ValidationError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(ValidationError::MissingField { field }),
    }
}

fn optional_text(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn content_hash() -> String {
        "ab".repeat(32)
    }

    #[test]
    fn test_build_minimal() {
        let artifact = RunArtifact::builder()
            .run_id("run_abc123def456")
            .risk_level(RiskLevel::Green)
            .content_hash(content_hash())
            .build()
            .unwrap();

        assert_eq!(artifact.run_id.as_str(), "run_abc123def456");
        assert_eq!(artifact.status, RunStatus::Ok);
        assert_eq!(artifact.schema_id, RUN_ARTIFACT_SCHEMA_ID);
        assert_eq!(artifact.mode, "unknown");
        assert!(artifact.is_core_only());
    }

    #[test]
    fn test_missing_content_hash_fails() {
        let err = RunArtifact::builder()
            .risk_level(RiskLevel::Green)
            .build()
            .unwrap_err();
        assert_eq!(err, ValidationError::MissingField { field: "content_hash" });
    }

    #[test]
    fn test_blank_required_fields_fail() {
        let err = RunArtifact::builder()
            .risk_level(RiskLevel::Yellow)
            .content_hash("   ")
            .build()
            .unwrap_err();
        assert_eq!(err, ValidationError::MissingField { field: "content_hash" });

        let err = RunArtifact::builder()
            .risk_level_str("\t")
            .content_hash(content_hash())
            .build()
            .unwrap_err();
        assert_eq!(err, ValidationError::MissingField { field: "risk_level" });
    }

    #[test]
    fn test_unknown_risk_level_fails() {
        let err = RunArtifact::builder()
            .risk_level_str("PURPLE")
            .content_hash(content_hash())
            .build()
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidValue { ref field, .. } if field == "risk_level"));
    }

    #[test]
    fn test_non_utc_timestamp_fails() {
        let err = RunArtifact::builder()
            .risk_level(RiskLevel::Green)
            .content_hash(content_hash())
            .created_at_str("2026-01-01T10:00:00+05:30")
            .build()
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidTimestamp { .. }));
    }

    #[test]
    fn test_bad_run_id_fails() {
        let err = RunArtifact::builder()
            .run_id("run_../../etc")
            .risk_level(RiskLevel::Green)
            .content_hash(content_hash())
            .build()
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidRunId { .. }));
    }

    #[test]
    fn test_status_implied_by_decision() {
        let red = RunArtifact::builder()
            .risk_level(RiskLevel::Red)
            .content_hash(content_hash())
            .build()
            .unwrap();
        assert_eq!(red.status, RunStatus::Blocked);

        let err = RunArtifact::builder()
            .risk_level(RiskLevel::Error)
            .content_hash(content_hash())
            .build()
            .unwrap();
        assert_eq!(err.status, RunStatus::Error);

        let explicit = RunArtifact::builder()
            .risk_level(RiskLevel::Red)
            .status(RunStatus::Ok)
            .content_hash(content_hash())
            .build()
            .unwrap();
        assert_eq!(explicit.status, RunStatus::Ok);
    }

    #[test]
    fn test_builder_from_json() {
        let builder: RunArtifactBuilder = serde_json::from_value(json!({
            "run_id": "run_0123456789ab",
            "created_at": "2026-02-03T04:05:06Z",
            "mode": "router",
            "tool_id": "saw_lab",
            "status": "blocked",
            "request_summary": {"blade_mm": 254},
            "decision": {"risk_level": "red", "score": 12.5, "block_reason": "kickback", "warnings": ["feed"]},
            "hashes": {"content_hash": content_hash(), "program_hash": "cd".repeat(32)},
            "meta": {"operator": "night-shift"}
        }))
        .unwrap();
        let artifact = builder.build().unwrap();

        assert_eq!(artifact.status, RunStatus::Blocked);
        assert_eq!(artifact.decision.risk_level, RiskLevel::Red);
        assert_eq!(artifact.decision.score, Some(12.5));
        assert_eq!(artifact.hashes.program_hash.as_deref(), Some("cd".repeat(32).as_str()));
        assert_eq!(artifact.partition_date(), "2026-02-03");
    }

    #[test]
    fn test_inline_advisories_rejected() {
        let builder: RunArtifactBuilder = serde_json::from_value(json!({
            "decision": {"risk_level": "GREEN"},
            "hashes": {"content_hash": content_hash()},
            "advisory_refs": []
        }))
        .unwrap();
        let err = builder.build().unwrap_err();
        assert!(matches!(err, ValidationError::InvalidValue { ref field, .. } if field == "advisory_refs"));
    }

    #[test]
    fn test_non_finite_score_rejected() {
        let err = RunArtifact::builder()
            .risk_level(RiskLevel::Green)
            .content_hash(content_hash())
            .score(f64::NAN)
            .build()
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidValue { .. }));
    }

    #[test]
    fn test_core_digest_ignores_merged_view() {
        let artifact = RunArtifact::builder()
            .risk_level(RiskLevel::Green)
            .content_hash(content_hash())
            .build()
            .unwrap();
        let mut merged = artifact.clone();
        merged.explanation_status = ExplanationStatus::Ready;
        merged.explanation_summary = Some("fine".to_string());
        assert!(!merged.is_core_only());
        assert_eq!(artifact.core_digest().unwrap(), merged.core_digest().unwrap());
        assert_eq!(merged.core(), artifact);
    }

    #[test]
    fn test_serialized_shape() {
        let artifact = RunArtifact::builder()
            .run_id("run_abc123def456")
            .risk_level(RiskLevel::Yellow)
            .content_hash(content_hash())
            .build()
            .unwrap();
        let value = serde_json::to_value(&artifact).unwrap();
        assert_eq!(value["status"], "OK");
        assert_eq!(value["decision"]["risk_level"], "YELLOW");
        assert_eq!(value["explanation_status"], "NONE");
        assert!(value.get("advisory_refs").is_none());
        assert!(value.get("outputs").is_none());
    }
}
