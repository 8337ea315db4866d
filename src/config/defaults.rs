//! Typed configuration and its built-in defaults.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::attachments::DEFAULT_MAX_BLOB_BYTES;
use crate::diff::{DiffOptions, DEFAULT_SCORE_DRIFT_THRESHOLD};
use crate::signing::DEFAULT_TTL_SECS;
use crate::store::StoreOptions;

/// Config file read when `--config` is not given, if it exists.
pub const DEFAULT_CONFIG_FILE: &str = "run-artifacts.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub store: StoreSection,
    pub attachments: AttachmentsConfig,
    pub signing: SigningConfig,
    pub diff: DiffConfig,
    pub migration: MigrationConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub artifact_root: PathBuf,
    pub attachment_root: PathBuf,
    pub lock_timeout_ms: u64,
    pub orphan_temp_max_age_secs: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            artifact_root: PathBuf::from("data/run_artifacts"),
            attachment_root: PathBuf::from("data/run_attachments"),
            lock_timeout_ms: 5000,
            orphan_temp_max_age_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachmentsConfig {
    pub max_blob_bytes: u64,
}

impl Default for AttachmentsConfig {
    fn default() -> Self {
        Self {
            max_blob_bytes: DEFAULT_MAX_BLOB_BYTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningConfig {
    /// Hex or `base64:`-prefixed secret. Unset disables signed access.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub default_ttl_secs: u64,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            key: None,
            default_ttl_secs: DEFAULT_TTL_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffConfig {
    pub score_drift_threshold: f64,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            score_drift_threshold: DEFAULT_SCORE_DRIFT_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    pub legacy_path: PathBuf,
    pub backup_dir: PathBuf,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            legacy_path: PathBuf::from("data/legacy/run_artifacts.json"),
            backup_dir: PathBuf::from("data/legacy/backups"),
        }
    }
}

impl StoreConfig {
    /// Defaults as a JSON layer for merging.
    pub fn defaults_value() -> serde_json::Value {
        serde_json::to_value(Self::default()).unwrap_or(serde_json::Value::Null)
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            lock_timeout: Duration::from_millis(self.store.lock_timeout_ms),
            orphan_temp_max_age: Duration::from_secs(self.store.orphan_temp_max_age_secs),
        }
    }

    pub fn diff_options(&self) -> DiffOptions {
        DiffOptions {
            score_drift_threshold: self.diff.score_drift_threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.store.artifact_root, PathBuf::from("data/run_artifacts"));
        assert_eq!(config.store.lock_timeout_ms, 5000);
        assert_eq!(config.attachments.max_blob_bytes, 52_428_800);
        assert_eq!(config.signing.key, None);
        assert_eq!(config.signing.default_ttl_secs, 300);
        assert_eq!(config.diff.score_drift_threshold, 5.0);
        assert_eq!(config.migration.backup_dir, PathBuf::from("data/legacy/backups"));
    }

    #[test]
    fn test_defaults_value_shape() {
        let value = StoreConfig::defaults_value();
        assert_eq!(value["store"]["orphan_temp_max_age_secs"], 3600);
        assert_eq!(value["migration"]["legacy_path"], "data/legacy/run_artifacts.json");
        assert!(value["signing"].get("key").is_none());
    }

    #[test]
    fn test_store_options() {
        let options = StoreConfig::default().store_options();
        assert_eq!(options.lock_timeout, Duration::from_millis(5000));
        assert_eq!(options.orphan_temp_max_age, Duration::from_secs(3600));
    }
}
