//! Effective configuration with provenance.
//!
//! Records which layers contributed (with the SHA-256 of any config file) and
//! which keys are redacted when the configuration is printed.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::defaults::StoreConfig;
use super::merge::merge_layers;
use crate::hashing::digest_of_bytes;
use crate::signing::UrlSigner;

/// Schema version for the printed effective config.
pub const SCHEMA_VERSION: u32 = 1;

/// Schema identifier for the printed effective config.
pub const SCHEMA_ID: &str = "run-artifacts/effective_config@1";

pub const ENV_ARTIFACT_ROOT: &str = "RUN_ARTIFACTS_ROOT";
pub const ENV_ATTACHMENT_ROOT: &str = "RUN_ARTIFACTS_ATTACHMENT_ROOT";
pub const ENV_SIGNING_KEY: &str = "RUN_ARTIFACTS_SIGNING_KEY";

/// Keys whose values are never printed.
const SECRET_KEYS: &[&str] = &["key", "password", "token", "secret"];

const REDACTED: &str = "[REDACTED]";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConfigOrigin {
    Builtin,
    File,
    Env,
    Cli,
}

/// A contributing layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigSource {
    pub origin: ConfigOrigin,

    /// File path, for file layers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// SHA-256 of the raw file bytes, for file layers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,

    /// Variables read, for the env layer.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<String>,
}

/// The resolved configuration and where it came from.
#[derive(Debug, Clone)]
pub struct EffectiveConfig {
    pub created_at: DateTime<Utc>,
    pub config: StoreConfig,
    pub sources: Vec<ConfigSource>,
}

impl EffectiveConfig {
    /// Resolve configuration from the process environment.
    pub fn build(config_path: Option<&Path>, cli_overrides: Option<Value>) -> Result<Self, ConfigError> {
        Self::build_with_env(config_path, |name| std::env::var(name).ok(), cli_overrides)
    }

    /// Resolve configuration with an injected environment lookup.
    ///
    /// An explicit `config_path` must exist; without one, the default file is
    /// used only if present in the working directory.
    pub fn build_with_env<F>(
        config_path: Option<&Path>,
        env: F,
        cli_overrides: Option<Value>,
    ) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut layers = vec![StoreConfig::defaults_value()];
        let mut sources = vec![ConfigSource {
            origin: ConfigOrigin::Builtin,
            path: None,
            digest: None,
            keys: Vec::new(),
        }];

        let file = match config_path {
            Some(path) if !path.exists() => {
                return Err(ConfigError::IoError(format!(
                    "config file {} does not exist",
                    path.display()
                )))
            }
            Some(path) => Some(path.to_path_buf()),
            None => {
                let default = Path::new(super::DEFAULT_CONFIG_FILE);
                default.exists().then(|| default.to_path_buf())
            }
        };
        if let Some(path) = file {
            let (value, digest) = load_toml_file(&path)?;
            layers.push(value);
            sources.push(ConfigSource {
                origin: ConfigOrigin::File,
                path: Some(path.to_string_lossy().to_string()),
                digest: Some(digest),
                keys: Vec::new(),
            });
        }

        let (env_layer, env_keys) = env_overrides(env);
        if !env_keys.is_empty() {
            layers.push(env_layer);
            sources.push(ConfigSource {
                origin: ConfigOrigin::Env,
                path: None,
                digest: None,
                keys: env_keys,
            });
        }

        if let Some(cli) = cli_overrides.filter(|v| v.as_object().map_or(false, |m| !m.is_empty())) {
            layers.push(cli);
            sources.push(ConfigSource {
                origin: ConfigOrigin::Cli,
                path: None,
                digest: None,
                keys: Vec::new(),
            });
        }

        let merged = merge_layers(layers);
        let config: StoreConfig = serde_json::from_value(merged)
            .map_err(|e| ConfigError::ParseError(format!("invalid configuration: {}", e)))?;
        validate_config(&config)?;

        Ok(Self {
            created_at: Utc::now(),
            config,
            sources,
        })
    }

    /// Signer for the configured key, or `None` when signing is disabled.
    pub fn signer(&self) -> Result<Option<UrlSigner>, ConfigError> {
        match &self.config.signing.key {
            Some(key) => UrlSigner::from_encoded(key, self.config.signing.default_ttl_secs)
                .map(Some)
                .map_err(|e| ConfigError::ValidationError(e.to_string())),
            None => Ok(None),
        }
    }

    /// Printable form with secrets redacted.
    pub fn to_redacted_json(&self) -> Result<Value, serde_json::Error> {
        let mut config = serde_json::to_value(&self.config)?;
        let mut redactions = Vec::new();
        redact_recursive(&mut config, String::new(), &mut redactions);
        Ok(serde_json::json!({
            "schema_version": SCHEMA_VERSION,
            "schema_id": SCHEMA_ID,
            "created_at": self.created_at,
            "config": config,
            "sources": self.sources,
            "redactions": redactions,
        }))
    }
}

fn env_overrides<F>(env: F) -> (Value, Vec<String>)
where
    F: Fn(&str) -> Option<String>,
{
    let mut store = Map::new();
    let mut signing = Map::new();
    let mut keys = Vec::new();

    let mut read = |name: &str| {
        let value = env(name).filter(|v| !v.trim().is_empty());
        if value.is_some() {
            keys.push(name.to_string());
        }
        value
    };
    if let Some(root) = read(ENV_ARTIFACT_ROOT) {
        store.insert("artifact_root".into(), Value::String(root));
    }
    if let Some(root) = read(ENV_ATTACHMENT_ROOT) {
        store.insert("attachment_root".into(), Value::String(root));
    }
    if let Some(key) = read(ENV_SIGNING_KEY) {
        signing.insert("key".into(), Value::String(key));
    }

    let mut layer = Map::new();
    if !store.is_empty() {
        layer.insert("store".into(), Value::Object(store));
    }
    if !signing.is_empty() {
        layer.insert("signing".into(), Value::Object(signing));
    }
    (Value::Object(layer), keys)
}

/// Load a TOML file, returning its JSON form and the digest of its bytes.
fn load_toml_file(path: &Path) -> Result<(Value, String), ConfigError> {
    let bytes = fs::read(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
    let digest = digest_of_bytes(&bytes);

    let contents = String::from_utf8(bytes)
        .map_err(|e| ConfigError::ParseError(format!("Invalid UTF-8: {}", e)))?;
    let toml_value: toml::Value = toml::from_str(&contents)
        .map_err(|e| ConfigError::ParseError(format!("TOML parse error: {}", e)))?;

    Ok((toml_to_json(toml_value), digest))
}

fn toml_to_json(toml: toml::Value) -> Value {
    match toml {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Integer(i) => Value::Number(i.into()),
        toml::Value::Float(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
        toml::Value::Array(arr) => Value::Array(arr.into_iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => {
            Value::Object(table.into_iter().map(|(k, v)| (k, toml_to_json(v))).collect())
        }
    }
}

fn redact_recursive(value: &mut Value, path: String, redactions: &mut Vec<String>) {
    let Value::Object(map) = value else {
        return;
    };
    for (key, val) in map.iter_mut() {
        let current_path = if path.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", path, key)
        };
        let key_lower = key.to_lowercase();
        let is_secret = SECRET_KEYS.iter().any(|s| key_lower == *s || key_lower.ends_with(&format!("_{}", s)));
        if is_secret && !val.is_object() && !val.is_null() {
            *val = Value::String(REDACTED.to_string());
            redactions.push(current_path);
        } else {
            redact_recursive(val, current_path, redactions);
        }
    }
}

fn validate_config(config: &StoreConfig) -> Result<(), ConfigError> {
    let timeout = config.store.lock_timeout_ms;
    if timeout == 0 || timeout > 600_000 {
        return Err(ConfigError::ValidationError(
            "store.lock_timeout_ms must be in (0, 600000]".to_string(),
        ));
    }
    if config.attachments.max_blob_bytes == 0 {
        return Err(ConfigError::ValidationError(
            "attachments.max_blob_bytes must be positive".to_string(),
        ));
    }
    let ttl = config.signing.default_ttl_secs;
    if ttl == 0 || ttl > 86_400 {
        return Err(ConfigError::ValidationError(
            "signing.default_ttl_secs must be in (0, 86400]".to_string(),
        ));
    }
    let threshold = config.diff.score_drift_threshold;
    if !threshold.is_finite() || threshold < 0.0 {
        return Err(ConfigError::ValidationError(
            "diff.score_drift_threshold must be a non-negative number".to_string(),
        ));
    }
    if let Some(key) = &config.signing.key {
        UrlSigner::from_encoded(key, ttl).map_err(|e| ConfigError::ValidationError(e.to_string()))?;
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}
