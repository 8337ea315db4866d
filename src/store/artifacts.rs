//! The run artifact store.
//!
//! Core records are written exactly once into the partition named by their
//! `created_at` date. Reads return the merged view: the core record plus any
//! advisory and explanation side files found next to it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::advisory::{
    advisory_file_prefix, explanation_file_name, read_side_file, AdvisoryLinker, AdvisoryRequest,
};
use super::atomic::{cleanup_orphaned_temps, is_temp_name, write_atomic};
use super::lock::LockDir;
use crate::error::{StoreError, StoreResult, ValidationError};
use crate::schema::{
    check_schema_id, AdvisoryRecord, ExplanationRecord, ExplanationStatus, RiskLevel, RunArtifact,
    RunId, RunStatus, ADVISORY_SCHEMA_ID, EXPLANATION_SCHEMA_ID, PARTITION_DATE_FORMAT,
    RUN_ARTIFACT_SCHEMA_ID, SCHEMA_VERSION,
};

/// Tunables shared by the on-disk stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    /// How long a writer waits for a per-key lock.
    pub lock_timeout: Duration,
    /// Temp files older than this are removed when the store is opened.
    pub orphan_temp_max_age: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(5000),
            orphan_temp_max_age: Duration::from_secs(3600),
        }
    }
}

/// Query over stored artifacts. Every criterion is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListFilter {
    /// First partition date to include.
    pub from: Option<NaiveDate>,
    /// Last partition date to include.
    pub to: Option<NaiveDate>,
    #[serde(deserialize_with = "parse_optional")]
    pub status: Option<RunStatus>,
    #[serde(deserialize_with = "parse_optional")]
    pub risk_level: Option<RiskLevel>,
    /// Exact match on `tool_id`.
    pub tool_id: Option<String>,
    /// Exact match on `mode`.
    pub mode: Option<String>,
    /// Stop after this many matches.
    pub limit: Option<usize>,
}

/// Filter enums accept the same spellings as the CLI (`error`, `Error`, `ERROR`).
fn parse_optional<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    Option::<String>::deserialize(deserializer)?
        .map(|s| s.parse::<T>().map_err(serde::de::Error::custom))
        .transpose()
}

impl ListFilter {
    fn includes_date(&self, date: NaiveDate) -> bool {
        self.from.map_or(true, |from| date >= from) && self.to.map_or(true, |to| date <= to)
    }

    fn matches(&self, artifact: &RunArtifact) -> bool {
        self.status.map_or(true, |s| artifact.status == s)
            && self.risk_level.map_or(true, |r| artifact.decision.risk_level == r)
            && self.tool_id.as_deref().map_or(true, |t| artifact.tool_id == t)
            && self.mode.as_deref().map_or(true, |m| artifact.mode == m)
    }

    fn is_full(&self, count: usize) -> bool {
        self.limit.map_or(false, |limit| count >= limit)
    }
}

/// A record a listing could not read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedRecord {
    /// Core record file that was left out.
    pub path: PathBuf,
    /// Parse or integrity failure, as logged.
    pub reason: String,
}

/// Artifacts matched by a listing, newest first, plus anything skipped.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ListResult {
    pub artifacts: Vec<RunArtifact>,
    pub skipped: Vec<SkippedRecord>,
}

impl ListResult {
    /// Whether corrupt records were left out of the result.
    pub fn is_partial(&self) -> bool {
        !self.skipped.is_empty()
    }
}

/// Date-partitioned store of immutable run artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    locks: LockDir,
    linker: AdvisoryLinker,
}

impl ArtifactStore {
    /// Open (creating if needed) a store rooted at `root`.
    ///
    /// Orphaned temp files left by crashed writers are removed.
    pub fn open(root: impl AsRef<Path>, options: StoreOptions) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let removed = cleanup_orphaned_temps(&root, options.orphan_temp_max_age)?;
        if removed > 0 {
            info!(root = %root.display(), removed, "removed orphaned temp files");
        }

        let locks = LockDir::new(&root, options.lock_timeout);
        Ok(Self {
            linker: AdvisoryLinker::new(locks.clone()),
            locks,
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path at which `artifact` is (or would be) stored.
    pub fn path_for(&self, artifact: &RunArtifact) -> PathBuf {
        self.root
            .join(artifact.partition_date())
            .join(core_file_name(&artifact.run_id))
    }

    /// Persist a new core record.
    ///
    /// Fails with [`StoreError::ImmutabilityViolation`] if a record with the
    /// same run id exists in any partition. Concurrent puts of the same run id
    /// are serialized; exactly one succeeds.
    pub fn put(&self, artifact: &RunArtifact) -> StoreResult<PathBuf> {
        artifact.validate()?;
        if artifact.schema_version != SCHEMA_VERSION {
            return Err(ValidationError::InvalidValue {
                field: "schema_version".to_string(),
                reason: format!("expected {}, got {}", SCHEMA_VERSION, artifact.schema_version),
            }
            .into());
        }
        check_schema_id(RUN_ARTIFACT_SCHEMA_ID, &artifact.schema_id).map_err(|reason| {
            ValidationError::InvalidValue {
                field: "schema_id".to_string(),
                reason,
            }
        })?;
        if !artifact.is_core_only() {
            return Err(ValidationError::InvalidValue {
                field: "advisory_refs".to_string(),
                reason: "core records cannot carry advisories or explanation status".to_string(),
            }
            .into());
        }

        let _lock = self.locks.lock(artifact.run_id.as_str())?;

        if let Some(existing) = self.locate(&artifact.run_id)? {
            warn!(run_id = %artifact.run_id, "rejected create of existing artifact");
            return Err(StoreError::ImmutabilityViolation {
                run_id: artifact.run_id.to_string(),
                path: existing,
            });
        }

        let path = self.path_for(artifact);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_atomic(&path, &serde_json::to_vec_pretty(artifact)?)?;

        info!(
            run_id = %artifact.run_id,
            partition = %artifact.partition_date(),
            status = %artifact.status,
            "artifact created"
        );
        Ok(path)
    }

    /// Fetch the merged view of a run.
    ///
    /// Returns `Ok(None)` for an unknown run and `CorruptRecord` when the core
    /// file exists but cannot be trusted.
    pub fn get(&self, run_id: &str) -> StoreResult<Option<RunArtifact>> {
        let run_id = RunId::parse(run_id)?;
        let Some(path) = self.locate(&run_id)? else {
            return Ok(None);
        };

        let mut artifact = read_core(&path, &run_id).map_err(|reason| {
            warn!(path = %path.display(), reason = %reason, "corrupt core record");
            StoreError::CorruptRecord {
                path: path.clone(),
                reason,
            }
        })?;

        let dir = partition_dir_of(&path);
        let names = dir_listing(dir)?;
        merge_side_files(&mut artifact, dir, &names);
        Ok(Some(artifact))
    }

    /// Path of the core record for `run_id`, searching every partition.
    pub fn locate(&self, run_id: &RunId) -> StoreResult<Option<PathBuf>> {
        let file_name = core_file_name(run_id);
        for (_, dir) in self.partitions()? {
            let candidate = dir.join(&file_name);
            if candidate.is_file() {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    pub fn exists(&self, run_id: &RunId) -> StoreResult<bool> {
        Ok(self.locate(run_id)?.is_some())
    }

    /// List artifacts matching `filter`, newest first.
    ///
    /// Corrupt core records are skipped and reported in the result rather
    /// than failing the whole listing.
    pub fn list(&self, filter: &ListFilter) -> StoreResult<ListResult> {
        let mut result = ListResult::default();

        for (date, dir) in self.partitions()? {
            if !filter.includes_date(date) {
                continue;
            }
            if filter.is_full(result.artifacts.len()) {
                break;
            }

            let names = match dir_listing(&dir) {
                Ok(names) => names,
                Err(e) => {
                    warn!(partition = %dir.display(), error = %e, "skipping unreadable partition");
                    result.skipped.push(SkippedRecord {
                        path: dir.clone(),
                        reason: format!("unreadable partition: {}", e),
                    });
                    continue;
                }
            };

            let mut in_partition = Vec::new();
            for name in &names {
                let Some(run_id) = core_run_id(name) else {
                    continue;
                };
                let path = dir.join(name);
                match read_core(&path, &run_id) {
                    Ok(mut artifact) => {
                        if filter.matches(&artifact) {
                            merge_side_files(&mut artifact, &dir, &names);
                            in_partition.push(artifact);
                        }
                    }
                    Err(reason) => {
                        warn!(path = %path.display(), reason = %reason, "skipping corrupt record");
                        result.skipped.push(SkippedRecord { path, reason });
                    }
                }
            }

            in_partition.sort_by(|a, b| {
                b.created_at
                    .cmp(&a.created_at)
                    .then_with(|| b.run_id.cmp(&a.run_id))
            });
            result.artifacts.extend(in_partition);
        }

        if let Some(limit) = filter.limit {
            result.artifacts.truncate(limit);
        }
        debug!(
            count = result.artifacts.len(),
            skipped = result.skipped.len(),
            "listed artifacts"
        );
        Ok(result)
    }

    /// Link an advisory to an existing run.
    ///
    /// Returns `true` if a new link was created and `false` if the same
    /// advisory id was already attached.
    pub fn attach_advisory(&self, run_id: &str, request: &AdvisoryRequest) -> StoreResult<bool> {
        let run_id = RunId::parse(run_id)?;
        let core_path = self.require(&run_id)?;
        self.linker.attach(&core_path, &run_id, request)
    }

    /// Record the explanation status of an existing run.
    pub fn set_explanation(
        &self,
        run_id: &str,
        status: ExplanationStatus,
        summary: Option<String>,
    ) -> StoreResult<()> {
        let run_id = RunId::parse(run_id)?;
        let core_path = self.require(&run_id)?;
        self.linker.set_explanation(&core_path, &run_id, status, summary)
    }

    /// Delete a run's core record and side files.
    ///
    /// Reserved for migration rollback of records the migration itself
    /// created; there is no public delete.
    pub(crate) fn remove_run(&self, run_id: &RunId) -> StoreResult<bool> {
        let _lock = self.locks.lock(run_id.as_str())?;
        let Some(core_path) = self.locate(run_id)? else {
            return Ok(false);
        };
        let dir = partition_dir_of(&core_path).to_path_buf();
        let prefix = advisory_file_prefix(run_id);
        let explanation = explanation_file_name(run_id);
        for name in dir_listing(&dir)? {
            if name.starts_with(&prefix) || name == explanation {
                fs::remove_file(dir.join(&name))?;
            }
        }
        fs::remove_file(&core_path)?;
        warn!(run_id = %run_id, "removed artifact during rollback");
        Ok(true)
    }

    fn require(&self, run_id: &RunId) -> StoreResult<PathBuf> {
        self.locate(run_id)?.ok_or_else(|| StoreError::RunNotFound {
            run_id: run_id.to_string(),
        })
    }

    /// Partition directories, newest first.
    fn partitions(&self) -> StoreResult<Vec<(NaiveDate, PathBuf)>> {
        let mut partitions = Vec::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(partitions),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(date) = name.to_str().and_then(parse_partition_name) else {
                continue;
            };
            partitions.push((date, entry.path()));
        }
        partitions.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(partitions)
    }
}

fn core_file_name(run_id: &RunId) -> String {
    format!("{}.json", run_id)
}

/// Run id named by a core file name, if `name` is one.
fn core_run_id(name: &str) -> Option<RunId> {
    if is_temp_name(name) {
        return None;
    }
    RunId::parse(name.strip_suffix(".json")?).ok()
}

fn parse_partition_name(name: &str) -> Option<NaiveDate> {
    let date = NaiveDate::parse_from_str(name, PARTITION_DATE_FORMAT).ok()?;
    // Reject unpadded forms such as 2024-1-5.
    (date.format(PARTITION_DATE_FORMAT).to_string() == name).then_some(date)
}

fn partition_dir_of(core_path: &Path) -> &Path {
    core_path.parent().unwrap_or(core_path)
}

fn dir_listing(dir: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Ok(name) = entry.file_name().into_string() {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// Read and check a core record.
///
/// The error is a human-readable reason for treating the file as corrupt.
fn read_core(path: &Path, run_id: &RunId) -> Result<RunArtifact, String> {
    let bytes = fs::read(path).map_err(|e| format!("unreadable: {}", e))?;
    let value: Value = serde_json::from_slice(&bytes).map_err(|e| format!("invalid JSON: {}", e))?;

    let schema_id = value
        .get("schema_id")
        .and_then(Value::as_str)
        .ok_or_else(|| "missing schema_id".to_string())?;
    check_schema_id(RUN_ARTIFACT_SCHEMA_ID, schema_id)?;

    let artifact: RunArtifact =
        serde_json::from_value(value).map_err(|e| format!("schema mismatch: {}", e))?;

    if artifact.schema_version != SCHEMA_VERSION {
        return Err(format!("unsupported schema_version {}", artifact.schema_version));
    }
    if &artifact.run_id != run_id {
        return Err(format!("run_id '{}' does not match file name", artifact.run_id));
    }
    let partition = partition_dir_of(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    if artifact.partition_date() != partition {
        return Err(format!(
            "created_at {} does not belong to partition {}",
            artifact.created_at, partition
        ));
    }
    if !artifact.is_core_only() {
        return Err("core record carries advisory or explanation fields".to_string());
    }
    artifact.validate().map_err(|e| e.to_string())?;
    Ok(artifact)
}

/// Fold advisory and explanation side files from `dir` into `artifact`.
///
/// Side files that cannot be trusted are logged and ignored; they never make
/// the core record unreadable.
fn merge_side_files(artifact: &mut RunArtifact, dir: &Path, names: &[String]) {
    let prefix = advisory_file_prefix(&artifact.run_id);
    for name in names {
        if is_temp_name(name) || !name.starts_with(&prefix) || !name.ends_with(".json") {
            continue;
        }
        let path = dir.join(name);
        let Some(record) = read_side_file::<AdvisoryRecord>(&path) else {
            continue;
        };
        if record.schema_id != ADVISORY_SCHEMA_ID || record.run_id != artifact.run_id {
            warn!(path = %path.display(), "skipping advisory side file for another record");
            continue;
        }
        artifact.advisory_refs.push(record.advisory);
    }
    artifact.advisory_refs.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.advisory_id.cmp(&b.advisory_id))
    });

    let explanation = explanation_file_name(&artifact.run_id);
    if names.iter().any(|n| n == &explanation) {
        let path = dir.join(&explanation);
        if let Some(record) = read_side_file::<ExplanationRecord>(&path) {
            if record.schema_id == EXPLANATION_SCHEMA_ID && record.run_id == artifact.run_id {
                artifact.explanation_status = record.status;
                artifact.explanation_summary = record.summary;
            } else {
                warn!(path = %path.display(), "skipping explanation side file for another record");
            }
        }
    }
}
