//! Layered configuration.
//!
//! Layers, lowest precedence first:
//! 1. Built-in defaults
//! 2. TOML file (`--config`, default `run-artifacts.toml` when present)
//! 3. Environment (`RUN_ARTIFACTS_ROOT`, `RUN_ARTIFACTS_ATTACHMENT_ROOT`,
//!    `RUN_ARTIFACTS_SIGNING_KEY`)
//! 4. CLI flags

mod defaults;
mod effective;
mod merge;

pub use defaults::{
    AttachmentsConfig, DiffConfig, MigrationConfig, SigningConfig, StoreConfig, StoreSection,
    DEFAULT_CONFIG_FILE,
};
pub use effective::{ConfigError, ConfigOrigin, ConfigSource, EffectiveConfig, ENV_ARTIFACT_ROOT,
    ENV_ATTACHMENT_ROOT, ENV_SIGNING_KEY};
pub use merge::{deep_merge, merge_layers};
