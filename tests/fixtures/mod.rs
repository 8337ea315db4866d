//! Shared helpers for integration tests.
//!
//! Stores are opened under a fresh `TempDir` so that each test sees an empty
//! artifact root and attachment root.

#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

use run_artifact_store::attachments::AttachmentStore;
use run_artifact_store::schema::{RiskLevel, RunArtifact, RunArtifactBuilder};
use run_artifact_store::{AccessApi, ArtifactStore, DiffOptions, StoreOptions, UrlSigner};
use serde_json::{json, Value};
use tempfile::TempDir;

pub const SIGNING_KEY: [u8; 32] = [0x5a; 32];

pub fn options() -> StoreOptions {
    StoreOptions {
        lock_timeout: Duration::from_secs(5),
        ..StoreOptions::default()
    }
}

pub fn artifact_store(dir: &TempDir) -> ArtifactStore {
    ArtifactStore::open(dir.path().join("artifacts"), options()).expect("open artifact store")
}

pub fn attachment_store(dir: &TempDir) -> AttachmentStore {
    AttachmentStore::open(dir.path().join("attachments"), options(), 1 << 20)
        .expect("open attachment store")
}

pub fn signer() -> UrlSigner {
    UrlSigner::new(SIGNING_KEY.to_vec(), 300).expect("valid key")
}

pub fn access_api(dir: &TempDir) -> AccessApi {
    AccessApi::new(
        artifact_store(dir),
        attachment_store(dir),
        Some(signer()),
        DiffOptions::default(),
    )
}

/// A valid builder for `run_id` created at `created_at`.
pub fn builder(run_id: &str, created_at: &str) -> RunArtifactBuilder {
    RunArtifact::builder()
        .run_id(run_id)
        .created_at_str(created_at)
        .mode("router_3axis")
        .tool_id("T1")
        .risk_level(RiskLevel::Green)
        .score(92.0)
        .content_hash("ab".repeat(32))
}

pub fn artifact(run_id: &str, created_at: &str) -> RunArtifact {
    builder(run_id, created_at).build().expect("valid artifact")
}

/// Run id with a fixed prefix and a numeric suffix.
pub fn run_id(n: u64) -> String {
    format!("run_{:012x}", n)
}

/// A flat legacy record.
pub fn legacy_record(run_id: &str, created_at: &str) -> Value {
    json!({
        "run_id": run_id,
        "created_at": created_at,
        "status": "OK",
        "risk_level": "GREEN",
        "score": 88.0,
        "request_hash": "cd".repeat(32),
        "tool_id": "T2",
        "mode": "router_3axis",
    })
}

pub fn write_legacy(path: &Path, records: &[Value]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create legacy dir");
    }
    std::fs::write(path, serde_json::to_vec_pretty(records).expect("encode")).expect("write legacy");
}
