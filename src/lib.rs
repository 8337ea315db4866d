//! Run artifact persistence.
//!
//! An append-only, content-addressed, date-partitioned audit store for CAM
//! decisions. Core run records are written once and never rewritten; later
//! associations (advisories, explanations) live in side files and are merged
//! on read. Attachments are stored once per content digest and may be handed
//! out through HMAC-signed, expiring links.

pub mod api;
pub mod attachments;
pub mod config;
pub mod diff;
pub mod error;
pub mod hashing;
pub mod migration;
pub mod schema;
pub mod signing;
pub mod store;

pub use api::{dispatch, Access, AccessApi};
pub use attachments::{AttachmentBlob, AttachmentStore};
pub use config::{ConfigError, EffectiveConfig, StoreConfig};
pub use diff::{diff, diff_report, DiffEntry, DiffOptions, DiffReport, Severity};
pub use error::{StoreError, StoreResult, ValidationError};
pub use migration::Migrator;
pub use schema::{RiskLevel, RunArtifact, RunArtifactBuilder, RunId, RunStatus};
pub use signing::{Scope, SignatureError, SignedUrl, UrlSigner};
pub use store::{AdvisoryRequest, ArtifactStore, ListFilter, ListResult, StoreOptions};
