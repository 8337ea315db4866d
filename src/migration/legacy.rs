//! Reader for the legacy single-file store.
//!
//! The legacy file is a JSON array of records or an object with a `runs`
//! array. Every field in a legacy record is optional and loosely typed; this
//! module reshapes each record into the current builder input and lets
//! [`RunArtifactBuilder::build`] make the accept/reject decision.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::MigrationError;
use crate::error::ValidationError;
use crate::schema::{format_utc, AdvisoryKind, ExplanationStatus, RunArtifact, RunArtifactBuilder};
use crate::store::AdvisoryRequest;

/// Top-level decision keys that may appear flattened onto the record.
const FLAT_DECISION_KEYS: &[&str] = &["risk_level", "score", "block_reason", "warnings"];

/// Top-level hash keys that may appear flattened onto the record.
const FLAT_HASH_KEYS: &[&str] = &["content_hash", "toolpath_hash", "program_hash", "preview_hash"];

/// One raw legacy record and the identifier used to report on it.
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyRecord {
    pub legacy_id: String,
    pub value: Value,
}

/// A legacy record converted to the current shape.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    pub artifact: RunArtifact,
    pub advisories: Vec<AdvisoryRequest>,
    pub explanation: Option<(ExplanationStatus, Option<String>)>,
}

/// Read every record from the legacy file at `path`.
///
/// A missing file yields no records.
pub fn read_legacy_file(path: &Path) -> Result<Vec<LegacyRecord>, MigrationError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(MigrationError::LegacyRead {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    parse_legacy(&bytes).map_err(|reason| MigrationError::LegacyParse {
        path: path.to_path_buf(),
        reason,
    })
}

/// Parse legacy file contents.
pub fn parse_legacy(bytes: &[u8]) -> Result<Vec<LegacyRecord>, String> {
    let root: Value = serde_json::from_slice(bytes).map_err(|e| format!("invalid JSON: {}", e))?;
    let runs = match root {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("runs") {
            Some(Value::Array(items)) => items,
            _ => return Err("expected an array or an object with a 'runs' array".to_string()),
        },
        _ => return Err("expected an array or an object with a 'runs' array".to_string()),
    };

    Ok(runs
        .into_iter()
        .enumerate()
        .map(|(index, value)| LegacyRecord {
            legacy_id: legacy_id(&value, index),
            value,
        })
        .collect())
}

fn legacy_id(value: &Value, index: usize) -> String {
    ["run_id", "id"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| format!("#{}", index))
}

/// Convert a legacy record into a validated artifact.
///
/// Unlike fresh creates, a migrated record must carry its own `run_id` and
/// `created_at`; generating either would make the conversion irreproducible.
pub fn normalize(record: &LegacyRecord) -> Result<NormalizedRecord, ValidationError> {
    let Value::Object(src) = &record.value else {
        return Err(ValidationError::InvalidValue {
            field: "record".to_string(),
            reason: "legacy record is not a JSON object".to_string(),
        });
    };

    let run_id = text(src, "run_id")
        .or_else(|| text(src, "id"))
        .ok_or(ValidationError::MissingField { field: "run_id" })?;
    let created_at = created_at(src)?;

    let mut input = Map::new();
    input.insert("run_id".into(), Value::String(run_id));
    input.insert("created_at".into(), Value::String(created_at));
    for key in ["mode", "tool_id", "status"] {
        if let Some(v) = text(src, key) {
            input.insert(key.into(), Value::String(v));
        }
    }
    if let Some(summary) = src.get("request_summary").or_else(|| src.get("request")) {
        if summary.is_object() {
            input.insert("request_summary".into(), summary.clone());
        }
    }
    input.insert("decision".into(), Value::Object(decision(src)));
    input.insert("hashes".into(), Value::Object(hashes(src)));
    if let Some(Value::Object(outputs)) = src.get("outputs") {
        let outputs: Map<String, Value> = outputs
            .iter()
            .filter_map(|(k, v)| scalar_text(v).map(|s| (k.clone(), Value::String(s))))
            .collect();
        input.insert("outputs".into(), Value::Object(outputs));
    }
    if let Some(meta) = src.get("meta").filter(|m| m.is_object()) {
        input.insert("meta".into(), meta.clone());
    }

    let builder: RunArtifactBuilder =
        serde_json::from_value(Value::Object(input)).map_err(|e| ValidationError::InvalidValue {
            field: "record".to_string(),
            reason: e.to_string(),
        })?;
    let artifact = builder.build()?;

    Ok(NormalizedRecord {
        advisories: advisories(src)?,
        explanation: explanation(src)?,
        artifact,
    })
}

fn text(src: &Map<String, Value>, key: &str) -> Option<String> {
    src.get(key).and_then(scalar_text)
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn created_at(src: &Map<String, Value>) -> Result<String, ValidationError> {
    match src.get("created_at") {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(Value::Number(n)) => {
            let secs = n.as_i64().ok_or_else(|| ValidationError::InvalidTimestamp {
                value: n.to_string(),
                reason: "unix timestamp must be an integer".to_string(),
            })?;
            let ts = DateTime::<Utc>::from_timestamp(secs, 0).ok_or_else(|| {
                ValidationError::InvalidTimestamp {
                    value: n.to_string(),
                    reason: "unix timestamp out of range".to_string(),
                }
            })?;
            Ok(format_utc(&ts))
        }
        _ => Err(ValidationError::MissingField { field: "created_at" }),
    }
}

fn decision(src: &Map<String, Value>) -> Map<String, Value> {
    let mut out = match src.get("decision") {
        Some(Value::Object(nested)) => nested.clone(),
        _ => Map::new(),
    };
    for key in FLAT_DECISION_KEYS {
        if !out.contains_key(*key) {
            if let Some(v) = src.get(*key) {
                out.insert((*key).to_string(), v.clone());
            }
        }
    }
    if let Some(Value::String(s)) = out.get("score") {
        // Legacy writers sometimes stored the score as text.
        let parsed = s.trim().parse::<f64>().ok().and_then(serde_json::Number::from_f64);
        match parsed {
            Some(n) => {
                out.insert("score".into(), Value::Number(n));
            }
            None => {
                out.remove("score");
            }
        }
    }
    if matches!(out.get("score"), Some(Value::Null)) {
        out.remove("score");
    }
    if matches!(out.get("warnings"), Some(Value::Null)) {
        out.remove("warnings");
    }
    out
}

fn hashes(src: &Map<String, Value>) -> Map<String, Value> {
    let mut out = match src.get("hashes") {
        Some(Value::Object(nested)) => nested.clone(),
        _ => Map::new(),
    };
    for key in FLAT_HASH_KEYS {
        if !out.contains_key(*key) {
            if let Some(v) = src.get(*key) {
                out.insert((*key).to_string(), v.clone());
            }
        }
    }
    if !out.contains_key("content_hash") {
        if let Some(v) = src.get("request_hash").or_else(|| out.get("request_hash")).cloned() {
            out.insert("content_hash".into(), v);
        }
    }
    out.remove("request_hash");
    out
}

fn advisories(src: &Map<String, Value>) -> Result<Vec<AdvisoryRequest>, ValidationError> {
    let Some(Value::Array(items)) = src.get("advisory_refs") else {
        return Ok(Vec::new());
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let Value::Object(item) = item else {
            return Err(ValidationError::InvalidValue {
                field: "advisory_refs".to_string(),
                reason: "advisory reference is not an object".to_string(),
            });
        };
        let advisory_id = text(item, "advisory_id")
            .ok_or(ValidationError::MissingField { field: "advisory_id" })?;
        let kind = text(item, "kind")
            .map(|k| k.parse::<AdvisoryKind>().unwrap_or(AdvisoryKind::Unknown))
            .unwrap_or(AdvisoryKind::Unknown);
        let request = AdvisoryRequest::new(
            advisory_id,
            kind,
            text(item, "engine_id").unwrap_or_else(|| "legacy".to_string()),
        )
        .with_engine_version(text(item, "engine_version").unwrap_or_default())
        .with_request_id(text(item, "request_id").unwrap_or_default());
        request.validate()?;
        out.push(request);
    }
    Ok(out)
}

fn explanation(
    src: &Map<String, Value>,
) -> Result<Option<(ExplanationStatus, Option<String>)>, ValidationError> {
    let status = match text(src, "explanation_status") {
        Some(s) => s.parse::<ExplanationStatus>()?,
        None => ExplanationStatus::None,
    };
    let summary = text(src, "explanation_summary");
    if status == ExplanationStatus::None && summary.is_none() {
        return Ok(None);
    }
    Ok(Some((status, summary)))
}
