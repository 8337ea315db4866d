//! Legacy store migration: dry run, migrate, verify, rollback.

mod fixtures;

use std::fs;

use fixtures::{artifact_store, legacy_record, run_id, write_legacy};
use run_artifact_store::migration::{Migrator, BACKUP_FILE_NAME};
use run_artifact_store::ListFilter;
use serde_json::json;
use tempfile::TempDir;

/// Three valid records and two that cannot be migrated.
fn seed_legacy(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("legacy").join("run_artifacts.json");
    write_legacy(
        &path,
        &[
            legacy_record(&run_id(1), "2025-01-14T08:00:00Z"),
            legacy_record(&run_id(2), "2025-01-15T08:00:00Z"),
            legacy_record(&run_id(3), "2025-01-15T09:00:00Z"),
            json!({"run_id": run_id(4), "risk_level": "GREEN"}),
            json!({"run_id": "not a run id", "created_at": "2025-01-15T09:00:00Z"}),
        ],
    );
    path
}

fn migrator(dir: &TempDir, legacy: &std::path::Path) -> Migrator {
    Migrator::new(artifact_store(dir), legacy, dir.path().join("backups"))
}

#[test]
fn test_dry_run_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let legacy = seed_legacy(&dir);
    let migrator = migrator(&dir, &legacy);

    let report = migrator.dry_run().unwrap();

    assert!(report.dry_run);
    assert_eq!(report.total, 5);
    assert_eq!(report.migrated, 3);
    assert_eq!(report.failed, 2);
    assert_eq!(report.failures.len(), 2);
    let store = artifact_store(&dir);
    assert!(store.list(&ListFilter::default()).unwrap().artifacts.is_empty());
    assert!(!dir.path().join("backups").exists());
}

#[test]
fn test_migrate_verify_and_rerun() {
    let dir = TempDir::new().unwrap();
    let legacy = seed_legacy(&dir);
    let migrator = migrator(&dir, &legacy);

    let report = migrator.migrate().unwrap();
    assert_eq!(report.migrated, 3);
    assert_eq!(report.failed, 2);
    assert!(report.has_failures());
    let backup = report.backup_dir.clone().unwrap();
    assert_eq!(fs::read(backup.join(BACKUP_FILE_NAME)).unwrap(), fs::read(&legacy).unwrap());

    let verify = migrator.verify().unwrap();
    assert_eq!(verify.checked, 3);
    assert_eq!(verify.matched, 3);
    assert_eq!(verify.skipped_invalid, 2);
    assert!(verify.is_clean());

    let status = migrator.status().unwrap();
    assert_eq!(status.already_migrated, 3);
    assert_eq!(status.pending, 0);
    assert_eq!(status.invalid, 2);
    assert_eq!(status.backups.len(), 1);

    let again = migrator.migrate().unwrap();
    assert_eq!(again.migrated, 0);
    assert_eq!(again.already_present, 3);
}

#[test]
fn test_verify_reports_missing_records() {
    let dir = TempDir::new().unwrap();
    let legacy = seed_legacy(&dir);
    let verify = migrator(&dir, &legacy).verify().unwrap();
    assert_eq!(verify.missing.len(), 3);
    assert!(!verify.is_clean());
}

#[test]
fn test_rollback_restores_pre_migration_state() {
    let dir = TempDir::new().unwrap();
    let legacy = seed_legacy(&dir);
    let original = fs::read(&legacy).unwrap();
    let migrator = migrator(&dir, &legacy);
    migrator.migrate().unwrap();

    fs::write(&legacy, b"[]").unwrap();
    let rollback = migrator.rollback(None).unwrap();

    assert_eq!(rollback.removed.len(), 3);
    assert_eq!(fs::read(&legacy).unwrap(), original);
    let store = artifact_store(&dir);
    assert!(store.list(&ListFilter::default()).unwrap().artifacts.is_empty());
}

#[test]
fn test_missing_legacy_store_is_empty() {
    let dir = TempDir::new().unwrap();
    let migrator = migrator(&dir, &dir.path().join("absent.json"));
    assert_eq!(migrator.dry_run().unwrap().total, 0);
    assert_eq!(migrator.migrate().unwrap().total, 0);
    assert!(!migrator.status().unwrap().legacy_present);
}
