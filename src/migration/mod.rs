//! One-way migration from the legacy single-file store.
//!
//! Modes:
//! - `status`: count legacy records and how many are already migrated.
//! - `dry_run`: validate every legacy record; write nothing.
//! - `migrate`: back up the legacy file, then convert record by record.
//! - `verify`: compare every valid legacy record with its migrated copy.
//! - `rollback`: restore the legacy file from a backup and remove exactly the
//!   records that backup's migration created.
//!
//! A record that fails validation is logged, counted and skipped; it never
//! aborts the run.

mod legacy;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

pub use legacy::{normalize, parse_legacy, read_legacy_file, LegacyRecord, NormalizedRecord};

use crate::diff::{diff, DiffOptions};
use crate::error::StoreError;
use crate::hashing::digest_of_bytes;
use crate::schema::{RunArtifact, RunId, SCHEMA_VERSION};
use crate::store::atomic::write_atomic;
use crate::store::ArtifactStore;

/// Schema identifier for `migration_manifest.json`.
pub const MANIFEST_SCHEMA_ID: &str = "run-artifacts/migration_manifest@1";

/// File name of the legacy copy inside a backup directory.
pub const BACKUP_FILE_NAME: &str = "legacy_store.json";

/// File name of the manifest inside a backup directory.
pub const MANIFEST_FILE_NAME: &str = "migration_manifest.json";

/// Errors that stop a migration mode as a whole.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("failed to read legacy store {}: {source}", path.display())]
    LegacyRead { path: PathBuf, source: io::Error },

    #[error("legacy store {} is not readable as legacy format: {reason}", path.display())]
    LegacyParse { path: PathBuf, reason: String },

    #[error("no migration backup found under {}", dir.display())]
    NoBackup { dir: PathBuf },

    #[error("invalid migration manifest {}: {reason}", path.display())]
    InvalidManifest { path: PathBuf, reason: String },

    #[error("backup failed: {0}")]
    Backup(io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A legacy record that could not be migrated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationFailure {
    pub legacy_id: String,
    pub reason: String,
}

/// Outcome of `dry_run` or `migrate`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationReport {
    pub dry_run: bool,
    pub total: usize,
    /// Records written (or, in a dry run, that would be written).
    pub migrated: usize,
    pub already_present: usize,
    pub failed: usize,
    /// Advisories or explanations of migrated runs that could not be written.
    #[serde(default)]
    pub side_data_failed: usize,
    pub failures: Vec<MigrationFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_dir: Option<PathBuf>,
}

impl MigrationReport {
    pub fn has_failures(&self) -> bool {
        self.failed > 0 || self.side_data_failed > 0
    }

    fn fail(&mut self, legacy_id: &str, reason: String) {
        warn!(legacy_id = %legacy_id, reason = %reason, "legacy record failed migration");
        self.failed += 1;
        self.failures.push(MigrationFailure {
            legacy_id: legacy_id.to_string(),
            reason,
        });
    }

    fn fail_side_data(&mut self, legacy_id: &str, reason: String) {
        warn!(legacy_id = %legacy_id, reason = %reason, "side data of migrated record was not written");
        self.side_data_failed += 1;
        self.failures.push(MigrationFailure {
            legacy_id: legacy_id.to_string(),
            reason,
        });
    }

    fn log_summary(&self, mode: &str) {
        if self.has_failures() {
            warn!(
                mode,
                total = self.total,
                migrated = self.migrated,
                already_present = self.already_present,
                failed = self.failed,
                side_data_failed = self.side_data_failed,
                "migration finished with failures"
            );
        } else {
            info!(
                mode,
                total = self.total,
                migrated = self.migrated,
                already_present = self.already_present,
                "migration finished"
            );
        }
    }
}

/// Counts from `status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationStatus {
    pub legacy_path: PathBuf,
    pub legacy_present: bool,
    pub legacy_total: usize,
    pub already_migrated: usize,
    pub pending: usize,
    pub invalid: usize,
    pub backups: Vec<String>,
}

/// A migrated record that does not match its legacy source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyMismatch {
    pub legacy_id: String,
    pub fields: Vec<String>,
}

/// Outcome of `verify`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    pub checked: usize,
    pub matched: usize,
    pub missing: Vec<String>,
    pub mismatched: Vec<VerifyMismatch>,
    /// Legacy records skipped because they never validated.
    pub skipped_invalid: usize,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.mismatched.is_empty()
    }
}

/// Outcome of `rollback`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackReport {
    pub backup: String,
    pub restored_legacy_path: PathBuf,
    pub removed: Vec<String>,
    pub already_absent: Vec<String>,
}

/// Written next to each backup; lists what the migration created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationManifest {
    pub schema_version: u32,
    pub schema_id: String,
    pub created_at: DateTime<Utc>,
    pub legacy_path: PathBuf,
    pub legacy_sha256: String,
    pub created_run_ids: Vec<String>,
}

/// Drives migration of one legacy file into an [`ArtifactStore`].
#[derive(Debug, Clone)]
pub struct Migrator {
    store: ArtifactStore,
    legacy_path: PathBuf,
    backup_dir: PathBuf,
}

impl Migrator {
    pub fn new(store: ArtifactStore, legacy_path: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            legacy_path: legacy_path.into(),
            backup_dir: backup_dir.into(),
        }
    }

    pub fn legacy_path(&self) -> &Path {
        &self.legacy_path
    }

    pub fn status(&self) -> Result<MigrationStatus, MigrationError> {
        let records = read_legacy_file(&self.legacy_path)?;
        let mut status = MigrationStatus {
            legacy_path: self.legacy_path.clone(),
            legacy_present: self.legacy_path.is_file(),
            legacy_total: records.len(),
            backups: self.backup_names()?,
            ..Default::default()
        };
        for record in &records {
            match normalize(record) {
                Ok(n) if self.store.exists(&n.artifact.run_id)? => status.already_migrated += 1,
                Ok(_) => status.pending += 1,
                Err(_) => status.invalid += 1,
            }
        }
        Ok(status)
    }

    /// Validate every legacy record without writing anything.
    pub fn dry_run(&self) -> Result<MigrationReport, MigrationError> {
        let records = read_legacy_file(&self.legacy_path)?;
        let mut report = MigrationReport {
            dry_run: true,
            total: records.len(),
            ..Default::default()
        };
        for record in &records {
            match normalize(record) {
                Ok(n) if self.store.exists(&n.artifact.run_id)? => report.already_present += 1,
                Ok(_) => report.migrated += 1,
                Err(e) => report.fail(&record.legacy_id, e.to_string()),
            }
        }
        report.log_summary("dry-run");
        Ok(report)
    }

    /// Back up the legacy file, then migrate every valid record.
    pub fn migrate(&self) -> Result<MigrationReport, MigrationError> {
        let legacy_bytes = match fs::read(&self.legacy_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(legacy_path = %self.legacy_path.display(), "no legacy store to migrate");
                return Ok(MigrationReport::default());
            }
            Err(source) => {
                return Err(MigrationError::LegacyRead {
                    path: self.legacy_path.clone(),
                    source,
                })
            }
        };
        let records = parse_legacy(&legacy_bytes).map_err(|reason| MigrationError::LegacyParse {
            path: self.legacy_path.clone(),
            reason,
        })?;

        let backup = self.write_backup(&legacy_bytes)?;
        let mut manifest = MigrationManifest {
            schema_version: SCHEMA_VERSION,
            schema_id: MANIFEST_SCHEMA_ID.to_string(),
            created_at: Utc::now(),
            legacy_path: self.legacy_path.clone(),
            legacy_sha256: digest_of_bytes(&legacy_bytes),
            created_run_ids: Vec::new(),
        };
        write_manifest(&backup, &manifest)?;

        let mut report = MigrationReport {
            total: records.len(),
            backup_dir: Some(backup.clone()),
            ..Default::default()
        };
        for record in &records {
            let normalized = match normalize(record) {
                Ok(n) => n,
                Err(e) => {
                    report.fail(&record.legacy_id, e.to_string());
                    continue;
                }
            };
            match self.store.put(&normalized.artifact) {
                Ok(_) => {
                    manifest.created_run_ids.push(normalized.artifact.run_id.to_string());
                    write_manifest(&backup, &manifest)?;
                    report.migrated += 1;
                    for reason in self.migrate_side_data(&normalized) {
                        report.fail_side_data(&record.legacy_id, reason);
                    }
                }
                Err(e) if e.is_immutability_violation() => report.already_present += 1,
                Err(e) => report.fail(&record.legacy_id, e.to_string()),
            }
        }

        report.log_summary("migrate");
        Ok(report)
    }

    /// Write the advisories and explanation of a freshly migrated run.
    ///
    /// Returns one reason per side file that could not be written.
    fn migrate_side_data(&self, normalized: &NormalizedRecord) -> Vec<String> {
        let run_id = normalized.artifact.run_id.as_str();
        let mut errors = Vec::new();
        for advisory in &normalized.advisories {
            if let Err(e) = self.store.attach_advisory(run_id, advisory) {
                errors.push(format!("advisory {}: {}", advisory.advisory_id, e));
            }
        }
        if let Some((status, summary)) = &normalized.explanation {
            if let Err(e) = self.store.set_explanation(run_id, *status, summary.clone()) {
                errors.push(format!("explanation: {}", e));
            }
        }
        errors
    }

    /// Compare migrated records field by field with their legacy source.
    pub fn verify(&self) -> Result<VerifyReport, MigrationError> {
        let records = read_legacy_file(&self.legacy_path)?;
        let mut report = VerifyReport::default();
        for record in &records {
            let Ok(expected) = normalize(record) else {
                report.skipped_invalid += 1;
                continue;
            };
            report.checked += 1;
            let actual = match self.store.get(expected.artifact.run_id.as_str()) {
                Ok(Some(actual)) => actual,
                Ok(None) => {
                    report.missing.push(record.legacy_id.clone());
                    continue;
                }
                Err(e) => {
                    report.mismatched.push(VerifyMismatch {
                        legacy_id: record.legacy_id.clone(),
                        fields: vec![format!("unreadable: {}", e)],
                    });
                    continue;
                }
            };
            let mut fields: Vec<String> = diff(&expected.artifact.core(), &actual.core(), &DiffOptions::default())?
                .into_iter()
                .map(|e| e.field)
                .collect();
            fields.extend(side_data_mismatches(&expected, &actual));
            if fields.is_empty() {
                report.matched += 1;
            } else {
                report.mismatched.push(VerifyMismatch {
                    legacy_id: record.legacy_id.clone(),
                    fields,
                });
            }
        }
        if !report.is_clean() {
            warn!(
                missing = report.missing.len(),
                mismatched = report.mismatched.len(),
                "migration verification found differences"
            );
        }
        Ok(report)
    }

    /// Undo a migration using the named backup.
    ///
    /// Without a name, picks the newest backup whose migration created at
    /// least one record, so a later no-op rerun does not hide it. If no
    /// backup created anything, the newest one is used.
    pub fn rollback(&self, backup_name: Option<&str>) -> Result<RollbackReport, MigrationError> {
        let (name, manifest) = match backup_name {
            Some(name) => (name.to_string(), self.read_manifest(name)?),
            None => self.pick_rollback_backup()?,
        };
        let backup = self.backup_dir.join(&name);
        let manifest_path = backup.join(MANIFEST_FILE_NAME);

        let mut report = RollbackReport {
            backup: name,
            restored_legacy_path: self.legacy_path.clone(),
            ..Default::default()
        };
        for id in &manifest.created_run_ids {
            let run_id = RunId::parse(id).map_err(|e| MigrationError::InvalidManifest {
                path: manifest_path.clone(),
                reason: e.to_string(),
            })?;
            if self.store.remove_run(&run_id)? {
                report.removed.push(id.clone());
            } else {
                report.already_absent.push(id.clone());
            }
        }

        let legacy_bytes = fs::read(backup.join(BACKUP_FILE_NAME))?;
        if let Some(parent) = self.legacy_path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_atomic(&self.legacy_path, &legacy_bytes)?;

        info!(
            backup = %report.backup,
            removed = report.removed.len(),
            "migration rolled back"
        );
        Ok(report)
    }

    fn pick_rollback_backup(&self) -> Result<(String, MigrationManifest), MigrationError> {
        let names = self.backup_names()?;
        let mut newest = None;
        for name in names.into_iter().rev() {
            let manifest = self.read_manifest(&name)?;
            if !manifest.created_run_ids.is_empty() {
                return Ok((name, manifest));
            }
            if newest.is_none() {
                newest = Some((name, manifest));
            }
        }
        newest.ok_or_else(|| MigrationError::NoBackup {
            dir: self.backup_dir.clone(),
        })
    }

    fn read_manifest(&self, name: &str) -> Result<MigrationManifest, MigrationError> {
        let backup = self.backup_dir.join(name);
        let path = backup.join(MANIFEST_FILE_NAME);
        let manifest: MigrationManifest = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| MigrationError::InvalidManifest {
                path: path.clone(),
                reason: e.to_string(),
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(MigrationError::NoBackup { dir: backup });
            }
            Err(e) => return Err(e.into()),
        };
        if manifest.schema_id != MANIFEST_SCHEMA_ID {
            return Err(MigrationError::InvalidManifest {
                path,
                reason: format!("unexpected schema_id '{}'", manifest.schema_id),
            });
        }
        Ok(manifest)
    }

    /// Backup directory names, oldest first.
    fn backup_names(&self) -> Result<Vec<String>, MigrationError> {
        let entries = match fs::read_dir(&self.backup_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.path().join(MANIFEST_FILE_NAME).is_file() {
                if let Ok(name) = entry.file_name().into_string() {
                    names.push(name);
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn write_backup(&self, legacy_bytes: &[u8]) -> Result<PathBuf, MigrationError> {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%6fZ").to_string();
        let dir = self.backup_dir.join(stamp);
        fs::create_dir_all(&dir).map_err(MigrationError::Backup)?;
        write_atomic(&dir.join(BACKUP_FILE_NAME), legacy_bytes).map_err(MigrationError::Backup)?;
        info!(backup = %dir.display(), "legacy store backed up");
        Ok(dir)
    }
}

/// Legacy advisories and explanation that the migrated copy does not carry.
///
/// Advisories attached after migration are not mismatches.
fn side_data_mismatches(expected: &NormalizedRecord, actual: &RunArtifact) -> Vec<String> {
    let mut fields = Vec::new();
    for advisory in &expected.advisories {
        let present = actual
            .advisory_refs
            .iter()
            .any(|r| r.advisory_id == advisory.advisory_id);
        if !present {
            fields.push(format!("advisory_refs.{}", advisory.advisory_id));
        }
    }
    if let Some((status, summary)) = &expected.explanation {
        if actual.explanation_status != *status {
            fields.push("explanation_status".to_string());
        }
        if actual.explanation_summary != *summary {
            fields.push("explanation_summary".to_string());
        }
    }
    fields
}

fn write_manifest(backup: &Path, manifest: &MigrationManifest) -> Result<(), MigrationError> {
    write_atomic(&backup.join(MANIFEST_FILE_NAME), &serde_json::to_vec_pretty(manifest)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreOptions;
    use serde_json::json;
    use tempfile::TempDir;

    fn setup(dir: &TempDir, legacy: serde_json::Value) -> Migrator {
        let legacy_path = dir.path().join("legacy").join("run_artifacts.json");
        fs::create_dir_all(legacy_path.parent().unwrap()).unwrap();
        fs::write(&legacy_path, serde_json::to_vec(&legacy).unwrap()).unwrap();
        let store = ArtifactStore::open(dir.path().join("store"), StoreOptions::default()).unwrap();
        Migrator::new(store, legacy_path, dir.path().join("legacy").join("backups"))
    }

    fn valid(id: &str) -> serde_json::Value {
        json!({
            "run_id": id,
            "created_at": "2025-01-15T10:30:00Z",
            "risk_level": "GREEN",
            "content_hash": "a".repeat(64),
        })
    }

    #[test]
    fn test_migrate_then_rerun_is_already_present() {
        let dir = TempDir::new().unwrap();
        let m = setup(&dir, json!([valid("run_000000000001"), {"run_id": "bad"}]));

        let first = m.migrate().unwrap();
        assert_eq!((first.total, first.migrated, first.failed), (2, 1, 1));
        assert!(first.backup_dir.as_ref().unwrap().join(BACKUP_FILE_NAME).is_file());

        let second = m.migrate().unwrap();
        assert_eq!((second.migrated, second.already_present, second.failed), (0, 1, 1));

        let status = m.status().unwrap();
        assert_eq!((status.already_migrated, status.pending, status.invalid), (1, 0, 1));
        assert!(m.verify().unwrap().is_clean());
    }

    #[test]
    fn test_rollback_removes_only_manifest_records() {
        let dir = TempDir::new().unwrap();
        let m = setup(&dir, json!({"runs": [valid("run_000000000001")]}));
        let store = ArtifactStore::open(dir.path().join("store"), StoreOptions::default()).unwrap();
        let unrelated = crate::schema::RunArtifact::builder()
            .run_id("run_000000000099")
            .risk_level(crate::schema::RiskLevel::Green)
            .content_hash("c".repeat(64))
            .build()
            .unwrap();
        store.put(&unrelated).unwrap();

        m.migrate().unwrap();
        fs::write(m.legacy_path(), b"[]").unwrap();

        let report = m.rollback(None).unwrap();
        assert_eq!(report.removed, vec!["run_000000000001".to_string()]);
        assert!(store.get("run_000000000001").unwrap().is_none());
        assert!(store.get("run_000000000099").unwrap().is_some());
        assert_eq!(read_legacy_file(m.legacy_path()).unwrap().len(), 1);
    }

    #[test]
    fn test_manifest_lists_each_created_run() {
        let dir = TempDir::new().unwrap();
        let m = setup(&dir, json!([valid("run_000000000001"), valid("run_000000000002")]));
        let report = m.migrate().unwrap();

        let name = report.backup_dir.unwrap().file_name().unwrap().to_string_lossy().into_owned();
        let manifest = m.read_manifest(&name).unwrap();
        assert_eq!(manifest.created_run_ids, vec!["run_000000000001", "run_000000000002"]);
    }

    #[test]
    fn test_unwritable_explanation_is_reported() {
        let dir = TempDir::new().unwrap();
        let mut record = valid("run_000000000001");
        record["explanation_status"] = json!("ready");
        record["explanation_summary"] = json!("spindle load within limits");
        let m = setup(&dir, json!([record]));
        // A directory squatting on the side-file path makes the rename fail.
        fs::create_dir_all(
            dir.path()
                .join("store")
                .join("2025-01-15")
                .join("run_000000000001_explanation.json"),
        )
        .unwrap();

        let report = m.migrate().unwrap();
        assert_eq!((report.migrated, report.failed, report.side_data_failed), (1, 0, 1));
        assert!(report.has_failures());
        assert!(report.failures[0].reason.starts_with("explanation:"));

        let verify = m.verify().unwrap();
        assert!(!verify.is_clean());
        assert_eq!(verify.mismatched[0].fields, vec!["explanation_status", "explanation_summary"]);
    }

    #[test]
    fn test_verify_flags_missing_advisory() {
        let dir = TempDir::new().unwrap();
        let mut record = valid("run_000000000001");
        record["advisory_refs"] = json!([{"advisory_id": "adv_001", "engine_id": "llm"}]);
        let m = setup(&dir, json!([record]));
        m.migrate().unwrap();
        assert!(m.verify().unwrap().is_clean());

        fs::remove_file(
            dir.path()
                .join("store")
                .join("2025-01-15")
                .join("run_000000000001_advisory_adv_001.json"),
        )
        .unwrap();
        let verify = m.verify().unwrap();
        assert_eq!(verify.mismatched[0].fields, vec!["advisory_refs.adv_001"]);
    }

    #[test]
    fn test_invalid_legacy_advisory_fails_the_record() {
        let dir = TempDir::new().unwrap();
        let mut record = valid("run_000000000001");
        record["advisory_refs"] = json!([{"advisory_id": "../escape", "engine_id": "llm"}]);
        let m = setup(&dir, json!([record]));

        let report = m.migrate().unwrap();
        assert_eq!((report.migrated, report.failed), (0, 1));
        assert!(m.store.get("run_000000000001").unwrap().is_none());
    }

    #[test]
    fn test_rollback_after_rerun_uses_backup_that_created_records() {
        let dir = TempDir::new().unwrap();
        let m = setup(&dir, json!([valid("run_000000000001")]));
        let first = m.migrate().unwrap();
        let second = m.migrate().unwrap();
        assert_eq!(second.already_present, 1);
        assert_eq!(m.backup_names().unwrap().len(), 2);

        let report = m.rollback(None).unwrap();
        let first_name = first.backup_dir.unwrap().file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(report.backup, first_name);
        assert_eq!(report.removed, vec!["run_000000000001".to_string()]);
        assert!(m.store.get("run_000000000001").unwrap().is_none());
    }

    #[test]
    fn test_rollback_without_backup() {
        let dir = TempDir::new().unwrap();
        let m = setup(&dir, json!([]));
        assert!(matches!(m.rollback(None), Err(MigrationError::NoBackup { .. })));
    }
}
