//! Error registry for the Access API.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes returned in API error responses.
///
/// These codes are stable and used for automation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed envelope or payload that could not be decoded.
    InvalidRequest,
    /// Unknown operation requested.
    UnknownOperation,
    /// Missing/empty required field, malformed identifier or timestamp.
    ValidationError,
    /// A record already exists for this run_id.
    ArtifactExists,
    /// No record exists for this run_id.
    RunNotFound,
    /// No attachment exists for this digest.
    AttachmentNotFound,
    /// A stored record could not be parsed or failed validation.
    CorruptRecord,
    /// Stored bytes no longer hash to their digest.
    IntegrityFailure,
    /// Attachment exceeds the configured maximum size.
    PayloadTooLarge,
    /// Signed reference is past its expiry.
    SignatureExpired,
    /// Signed reference does not authenticate.
    SignatureInvalid,
    /// Signed reference is valid but does not grant the requested access.
    ScopeDenied,
    /// A per-file lock could not be acquired in time.
    LockTimeout,
    /// Underlying filesystem failure.
    StorageError,
}

impl ErrorCode {
    /// HTTP-equivalent status for this code.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidRequest | Self::UnknownOperation => 400,
            Self::SignatureExpired | Self::SignatureInvalid | Self::ScopeDenied => 403,
            Self::RunNotFound | Self::AttachmentNotFound => 404,
            Self::ArtifactExists => 409,
            Self::PayloadTooLarge => 413,
            Self::ValidationError => 422,
            Self::LockTimeout => 503,
            Self::CorruptRecord | Self::IntegrityFailure | Self::StorageError => 500,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRequest => write!(f, "INVALID_REQUEST"),
            Self::UnknownOperation => write!(f, "UNKNOWN_OPERATION"),
            Self::ValidationError => write!(f, "VALIDATION_ERROR"),
            Self::ArtifactExists => write!(f, "ARTIFACT_EXISTS"),
            Self::RunNotFound => write!(f, "RUN_NOT_FOUND"),
            Self::AttachmentNotFound => write!(f, "ATTACHMENT_NOT_FOUND"),
            Self::CorruptRecord => write!(f, "CORRUPT_RECORD"),
            Self::IntegrityFailure => write!(f, "INTEGRITY_FAILURE"),
            Self::PayloadTooLarge => write!(f, "PAYLOAD_TOO_LARGE"),
            Self::SignatureExpired => write!(f, "SIGNATURE_EXPIRED"),
            Self::SignatureInvalid => write!(f, "SIGNATURE_INVALID"),
            Self::ScopeDenied => write!(f, "SCOPE_DENIED"),
            Self::LockTimeout => write!(f, "LOCK_TIMEOUT"),
            Self::StorageError => write!(f, "STORAGE_ERROR"),
        }
    }
}

/// Structured API error body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    /// Error code from the registry.
    pub code: ErrorCode,
    /// Human-readable, single-line error message.
    pub message: String,
    /// Optional machine-readable details (failing field, identifiers).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ApiError {
    /// Create a new API error.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Create a new API error with additional data.
    pub fn with_data(code: ErrorCode, message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            code,
            message: message.into(),
            data: Some(data),
        }
    }

    /// Create an INVALID_REQUEST error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    /// Create an UNKNOWN_OPERATION error.
    pub fn unknown_operation(op: &str) -> Self {
        Self::with_data(
            ErrorCode::UnknownOperation,
            format!("unknown operation: {}", op),
            serde_json::json!({ "op": op }),
        )
    }

    /// Create a RUN_NOT_FOUND error.
    pub fn run_not_found(run_id: &str) -> Self {
        Self::with_data(
            ErrorCode::RunNotFound,
            format!("run '{}' not found", run_id),
            serde_json::json!({ "run_id": run_id }),
        )
    }

    /// Create an ATTACHMENT_NOT_FOUND error.
    pub fn attachment_not_found(sha256: &str) -> Self {
        Self::with_data(
            ErrorCode::AttachmentNotFound,
            format!("attachment '{}' not found", sha256),
            serde_json::json!({ "sha256": sha256 }),
        )
    }

    /// HTTP-equivalent status for this error.
    pub fn http_status(&self) -> u16 {
        self.code.http_status()
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}
