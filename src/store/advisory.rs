//! Append-only side channel for advisories and explanations.
//!
//! The linker only ever creates side files next to a core record. It never
//! opens the core file for writing, so immutability of core records can be
//! checked by inspecting this module alone.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::atomic::write_atomic;
use super::lock::LockDir;
use crate::error::{StoreResult, ValidationError};
use crate::schema::{
    validate_advisory_id, AdvisoryKind, AdvisoryRecord, AdvisoryRef, ExplanationRecord,
    ExplanationStatus, RunId,
};

/// Caller input for attaching an advisory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvisoryRequest {
    pub advisory_id: String,
    #[serde(default = "default_kind")]
    pub kind: AdvisoryKind,
    pub engine_id: String,
    #[serde(default)]
    pub engine_version: String,
    #[serde(default)]
    pub request_id: String,
}

fn default_kind() -> AdvisoryKind {
    AdvisoryKind::Advisory
}

impl AdvisoryRequest {
    pub fn new(advisory_id: impl Into<String>, kind: AdvisoryKind, engine_id: impl Into<String>) -> Self {
        Self {
            advisory_id: advisory_id.into(),
            kind,
            engine_id: engine_id.into(),
            engine_version: String::new(),
            request_id: String::new(),
        }
    }

    pub fn with_engine_version(mut self, version: impl Into<String>) -> Self {
        self.engine_version = version.into();
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_advisory_id(&self.advisory_id)?;
        if self.engine_id.trim().is_empty() {
            return Err(ValidationError::MissingField { field: "engine_id" });
        }
        Ok(())
    }
}

/// Side-file name for an advisory.
pub(crate) fn advisory_file_name(run_id: &RunId, advisory_id: &str) -> String {
    format!("{}_advisory_{}.json", run_id, advisory_id)
}

/// Prefix shared by every advisory side file of a run.
pub(crate) fn advisory_file_prefix(run_id: &RunId) -> String {
    format!("{}_advisory_", run_id)
}

/// Side-file name for the explanation.
pub(crate) fn explanation_file_name(run_id: &RunId) -> String {
    format!("{}_explanation.json", run_id)
}

/// Writes advisory and explanation side files.
#[derive(Debug, Clone)]
pub struct AdvisoryLinker {
    locks: LockDir,
}

impl AdvisoryLinker {
    pub fn new(locks: LockDir) -> Self {
        Self { locks }
    }

    /// Create the advisory side file next to `core_path` unless it exists.
    ///
    /// Returns `true` when a new side file was written.
    pub fn attach(&self, core_path: &Path, run_id: &RunId, request: &AdvisoryRequest) -> StoreResult<bool> {
        request.validate()?;
        let side_path = sibling(core_path, &advisory_file_name(run_id, &request.advisory_id));
        let _lock = self.locks.lock(&format!("{}_advisory_{}", run_id, request.advisory_id))?;

        if side_path.exists() {
            debug!(run_id = %run_id, advisory_id = %request.advisory_id, "advisory already attached");
            return Ok(false);
        }

        let record = AdvisoryRecord::new(
            run_id.clone(),
            AdvisoryRef {
                advisory_id: request.advisory_id.clone(),
                kind: request.kind,
                engine_id: request.engine_id.trim().to_string(),
                engine_version: request.engine_version.trim().to_string(),
                request_id: request.request_id.trim().to_string(),
                created_at: Utc::now(),
            },
        );
        write_atomic(&side_path, &serde_json::to_vec_pretty(&record)?)?;
        info!(run_id = %run_id, advisory_id = %request.advisory_id, kind = %request.kind, "advisory attached");
        Ok(true)
    }

    /// Write or replace the explanation side file next to `core_path`.
    pub fn set_explanation(
        &self,
        core_path: &Path,
        run_id: &RunId,
        status: ExplanationStatus,
        summary: Option<String>,
    ) -> StoreResult<()> {
        let side_path = sibling(core_path, &explanation_file_name(run_id));
        let _lock = self.locks.lock(&format!("{}_explanation", run_id))?;

        let summary = summary.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        let record = ExplanationRecord::new(run_id.clone(), status, summary);
        write_atomic(&side_path, &serde_json::to_vec_pretty(&record)?)?;
        info!(run_id = %run_id, status = ?status, "explanation status recorded");
        Ok(())
    }
}

fn sibling(core_path: &Path, name: &str) -> PathBuf {
    core_path.with_file_name(name)
}

/// Read a side file, returning `None` (and logging) if it is unreadable.
pub(crate) fn read_side_file<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read side file");
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "skipping unparsable side file");
            None
        }
    }
}
