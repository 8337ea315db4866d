//! Error taxonomy for the run artifact store.
//!
//! Every variant maps to one stable [`ErrorCode`]; the Access API converts
//! errors with `From<StoreError> for ApiError` so callers always receive a
//! structured body rather than a bare status.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use run_artifact_protocol::{ApiError, ErrorCode};
use serde_json::json;
use thiserror::Error;

use crate::hashing::HashError;
use crate::signing::SignatureError;

/// Rejections raised before anything touches the filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("required field '{field}' is missing or empty")]
    MissingField { field: &'static str },

    #[error("invalid run_id '{value}': expected 'run_' followed by 12 lowercase hex characters")]
    InvalidRunId { value: String },

    #[error("invalid {field} '{value}'")]
    InvalidIdentifier { field: &'static str, value: String },

    #[error("invalid digest for '{field}': expected 64 lowercase hex characters")]
    InvalidDigest { field: String, value: String },

    #[error("invalid timestamp '{value}': {reason}")]
    InvalidTimestamp { value: String, reason: String },

    #[error("invalid file extension '{value}'")]
    InvalidExtension { value: String },

    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

impl ValidationError {
    /// Name of the offending field, for structured error bodies.
    pub fn field(&self) -> String {
        match self {
            Self::MissingField { field } => field.to_string(),
            Self::InvalidRunId { .. } => "run_id".to_string(),
            Self::InvalidIdentifier { field, .. } => field.to_string(),
            Self::InvalidDigest { field, .. } => field.clone(),
            Self::InvalidTimestamp { .. } => "created_at".to_string(),
            Self::InvalidExtension { .. } => "ext".to_string(),
            Self::InvalidValue { field, .. } => field.clone(),
        }
    }
}

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("artifact '{run_id}' already exists at {}", path.display())]
    ImmutabilityViolation { run_id: String, path: PathBuf },

    #[error("run '{run_id}' not found")]
    RunNotFound { run_id: String },

    #[error("attachment '{sha256}' not found")]
    AttachmentNotFound { sha256: String },

    #[error("corrupt record at {}: {reason}", path.display())]
    CorruptRecord { path: PathBuf, reason: String },

    #[error("integrity failure for '{sha256}': stored bytes hash to {recomputed}")]
    IntegrityFailure { sha256: String, recomputed: String },

    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge { size: u64, max: u64 },

    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error("signed access is disabled: no signing key configured")]
    SigningDisabled,

    #[error("lock timeout after {timeout:?} on {}", path.display())]
    LockTimeout { path: PathBuf, timeout: Duration },

    #[error("hashing error: {0}")]
    Hash(#[from] HashError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) | Self::SigningDisabled | Self::Hash(_) => ErrorCode::ValidationError,
            Self::ImmutabilityViolation { .. } => ErrorCode::ArtifactExists,
            Self::RunNotFound { .. } => ErrorCode::RunNotFound,
            Self::AttachmentNotFound { .. } => ErrorCode::AttachmentNotFound,
            Self::CorruptRecord { .. } => ErrorCode::CorruptRecord,
            Self::IntegrityFailure { .. } => ErrorCode::IntegrityFailure,
            Self::PayloadTooLarge { .. } => ErrorCode::PayloadTooLarge,
            Self::Signature(err) => err.code(),
            Self::LockTimeout { .. } => ErrorCode::LockTimeout,
            Self::Io(_) | Self::Json(_) => ErrorCode::StorageError,
        }
    }

    /// Whether this error represents a duplicate create.
    pub fn is_immutability_violation(&self) -> bool {
        matches!(self, Self::ImmutabilityViolation { .. })
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let code = err.code();
        // Filesystem paths stay out of caller-facing bodies.
        match &err {
            StoreError::Validation(v) => ApiError::with_data(
                code,
                v.to_string(),
                json!({ "field": v.field() }),
            ),
            StoreError::ImmutabilityViolation { run_id, .. } => ApiError::with_data(
                code,
                format!("artifact '{}' already exists and cannot be overwritten", run_id),
                json!({ "run_id": run_id }),
            ),
            StoreError::RunNotFound { run_id } => ApiError::run_not_found(run_id),
            StoreError::AttachmentNotFound { sha256 } => ApiError::attachment_not_found(sha256),
            StoreError::CorruptRecord { reason, .. } => {
                ApiError::new(code, format!("stored record is corrupt: {}", reason))
            }
            StoreError::IntegrityFailure { sha256, recomputed } => ApiError::with_data(
                code,
                err.to_string(),
                json!({ "sha256": sha256, "recomputed_sha256": recomputed }),
            ),
            StoreError::PayloadTooLarge { size, max } => ApiError::with_data(
                code,
                err.to_string(),
                json!({ "size": size, "max_bytes": max }),
            ),
            StoreError::Signature(sig) => ApiError::with_data(code, sig.to_string(), sig.data()),
            StoreError::LockTimeout { timeout, .. } => ApiError::with_data(
                code,
                format!("lock not acquired within {:?}", timeout),
                json!({ "timeout_ms": timeout.as_millis() as u64 }),
            ),
            StoreError::Io(io_err) => ApiError::new(code, format!("storage failure: {}", io_err.kind())),
            _ => ApiError::new(code, err.to_string()),
        }
    }
}
