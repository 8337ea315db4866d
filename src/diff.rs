//! Severity-classified structural diff between two run artifacts.
//!
//! Both records are flattened to dotted field paths (`decision.risk_level`,
//! `hashes.content_hash`, `meta.operator`); arrays compare as whole values.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::hashing::is_sha256_hex;
use crate::schema::RunArtifact;

/// Default absolute score drift that counts as significant.
pub const DEFAULT_SCORE_DRIFT_THRESHOLD: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
        })
    }
}

/// One differing field. Absent values are `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub field: String,
    pub a_value: Value,
    pub b_value: Value,
    pub severity: Severity,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DiffOptions {
    /// Absolute score change at or above which drift is a warning.
    pub score_drift_threshold: f64,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            score_drift_threshold: DEFAULT_SCORE_DRIFT_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub critical: usize,
    pub warning: usize,
    pub info: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffReport {
    pub a_run_id: String,
    pub b_run_id: String,
    pub entries: Vec<DiffEntry>,
    /// `None` when the records are identical.
    pub max_severity: Option<Severity>,
    pub counts: SeverityCounts,
}

impl DiffReport {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Differences between `a` and `b`, most severe first, then by field path.
pub fn diff(a: &RunArtifact, b: &RunArtifact, options: &DiffOptions) -> serde_json::Result<Vec<DiffEntry>> {
    let mut left = BTreeMap::new();
    let mut right = BTreeMap::new();
    flatten("", &serde_json::to_value(a)?, &mut left);
    flatten("", &serde_json::to_value(b)?, &mut right);

    let mut fields: Vec<&String> = left.keys().chain(right.keys()).collect();
    fields.sort();
    fields.dedup();

    let mut entries = Vec::new();
    for field in fields {
        let a_value = left.get(field).cloned().unwrap_or(Value::Null);
        let b_value = right.get(field).cloned().unwrap_or(Value::Null);
        if a_value == b_value {
            continue;
        }
        let severity = classify(field, &a_value, &b_value, options);
        entries.push(DiffEntry {
            field: field.clone(),
            a_value,
            b_value,
            severity,
        });
    }

    entries.sort_by(|x, y| y.severity.cmp(&x.severity).then_with(|| x.field.cmp(&y.field)));
    Ok(entries)
}

/// [`diff`] plus summary counts.
pub fn diff_report(a: &RunArtifact, b: &RunArtifact, options: &DiffOptions) -> serde_json::Result<DiffReport> {
    let entries = diff(a, b, options)?;
    let mut counts = SeverityCounts::default();
    for entry in &entries {
        match entry.severity {
            Severity::Critical => counts.critical += 1,
            Severity::Warning => counts.warning += 1,
            Severity::Info => counts.info += 1,
        }
    }
    Ok(DiffReport {
        a_run_id: a.run_id.to_string(),
        b_run_id: b.run_id.to_string(),
        max_severity: entries.iter().map(|e| e.severity).max(),
        entries,
        counts,
    })
}

fn classify(field: &str, a: &Value, b: &Value, options: &DiffOptions) -> Severity {
    if field.starts_with("hashes.") {
        return Severity::Critical;
    }
    if field.starts_with("outputs.") && [a, b].iter().any(|v| v.as_str().map_or(false, is_sha256_hex)) {
        return Severity::Critical;
    }
    match field {
        "status" => {
            let touches_error = [a, b].iter().any(|v| v.as_str() == Some("ERROR"));
            if touches_error {
                Severity::Critical
            } else {
                Severity::Warning
            }
        }
        "decision.risk_level" => Severity::Warning,
        "decision.score" => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) if (x - y).abs() < options.score_drift_threshold => Severity::Info,
            _ => Severity::Warning,
        },
        _ => Severity::Info,
    }
}

fn flatten(prefix: &str, value: &Value, out: &mut BTreeMap<String, Value>) {
    match value {
        Value::Object(map) if !map.is_empty() || prefix.is_empty() => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten(&path, child, out);
            }
        }
        leaf => {
            out.insert(prefix.to_string(), leaf.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{RiskLevel, RunStatus};
    use serde_json::json;

    fn base() -> RunArtifact {
        RunArtifact::builder()
            .run_id("run_aaaaaaaaaaaa")
            .created_at_str("2025-01-15T10:30:00Z")
            .tool_id("T1")
            .mode("router")
            .risk_level(RiskLevel::Green)
            .score(90.0)
            .content_hash("a".repeat(64))
            .meta("operator", json!("kim"))
            .build()
            .unwrap()
    }

    fn opts() -> DiffOptions {
        DiffOptions::default()
    }

    #[test]
    fn test_self_diff_is_empty() {
        let a = base();
        assert!(diff(&a, &a, &opts()).unwrap().is_empty());
        let report = diff_report(&a, &a, &opts()).unwrap();
        assert!(report.is_empty());
        assert_eq!(report.max_severity, None);
    }

    #[test]
    fn test_meta_only_is_info() {
        let a = base();
        let mut b = base();
        b.meta.insert("operator".into(), json!("lee"));
        b.meta.insert("shift".into(), json!(2));

        let entries = diff(&a, &b, &opts()).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.severity == Severity::Info));
        assert_eq!(entries[0].field, "meta.operator");
        assert_eq!(entries[1].a_value, Value::Null);
    }

    #[test]
    fn test_hash_change_is_critical_and_sorted_first() {
        let a = base();
        let mut b = base();
        b.hashes.content_hash = "b".repeat(64);
        b.tool_id = "T2".into();

        let entries = diff(&a, &b, &opts()).unwrap();
        assert_eq!(entries[0].field, "hashes.content_hash");
        assert_eq!(entries[0].severity, Severity::Critical);
        assert_eq!(entries[1].field, "tool_id");
        assert_eq!(entries[1].severity, Severity::Info);
    }

    #[test]
    fn test_added_optional_hash_is_critical() {
        let a = base();
        let mut b = base();
        b.hashes.program_hash = Some("c".repeat(64));
        let entries = diff(&a, &b, &opts()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].field, "hashes.program_hash");
        assert_eq!(entries[0].severity, Severity::Critical);
    }

    #[test]
    fn test_status_transitions() {
        let a = base();
        let mut b = base();
        b.status = RunStatus::Blocked;
        assert_eq!(diff(&a, &b, &opts()).unwrap()[0].severity, Severity::Warning);

        b.status = RunStatus::Error;
        assert_eq!(diff(&a, &b, &opts()).unwrap()[0].severity, Severity::Critical);
        assert_eq!(diff(&b, &a, &opts()).unwrap()[0].severity, Severity::Critical);
    }

    #[test]
    fn test_risk_and_score_drift() {
        let a = base();
        let mut b = base();
        b.decision.risk_level = RiskLevel::Yellow;
        b.decision.score = Some(92.0);

        let report = diff_report(&a, &b, &opts()).unwrap();
        let score = report.entries.iter().find(|e| e.field == "decision.score").unwrap();
        assert_eq!(score.severity, Severity::Info);
        let risk = report.entries.iter().find(|e| e.field == "decision.risk_level").unwrap();
        assert_eq!(risk.severity, Severity::Warning);
        assert_eq!(report.max_severity, Some(Severity::Warning));
        assert_eq!(report.counts, SeverityCounts { critical: 0, warning: 1, info: 1 });

        b.decision.score = Some(80.0);
        let entries = diff(&a, &b, &opts()).unwrap();
        let score = entries.iter().find(|e| e.field == "decision.score").unwrap();
        assert_eq!(score.severity, Severity::Warning);
    }

    #[test]
    fn test_empty_object_is_a_field() {
        let a = base();
        let mut b = base();
        b.meta.insert("fixture".into(), json!({}));

        let entries = diff(&a, &b, &opts()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].field, "meta.fixture");
        assert_eq!(entries[0].a_value, Value::Null);
        assert_eq!(entries[0].b_value, json!({}));

        let mut c = base();
        c.meta.insert("fixture".into(), json!({"x": {}}));
        let entries = diff(&b, &c, &opts()).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().any(|e| e.field == "meta.fixture.x" && e.b_value == json!({})));
    }

    #[test]
    fn test_output_digest_change_is_critical() {
        let mut a = base();
        a.outputs.insert("gcode".into(), "d".repeat(64));
        a.outputs.insert("label".into(), "preview".into());
        let mut b = a.clone();
        b.outputs.insert("gcode".into(), "e".repeat(64));
        b.outputs.insert("label".into(), "final".into());

        let entries = diff(&a, &b, &opts()).unwrap();
        assert_eq!(entries[0].field, "outputs.gcode");
        assert_eq!(entries[0].severity, Severity::Critical);
        assert_eq!(entries[1].field, "outputs.label");
        assert_eq!(entries[1].severity, Severity::Info);
    }

    #[test]
    fn test_identity_fields_are_info() {
        let a = base();
        let mut b = base();
        b.run_id = crate::schema::RunId::parse("run_bbbbbbbbbbbb").unwrap();
        let entries = diff(&a, &b, &opts()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].severity, Severity::Info);
    }
}
