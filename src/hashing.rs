//! Deterministic content hashing and constant-time digest comparison.
//!
//! Structured values are canonicalized with JCS (RFC 8785: sorted keys,
//! normalized numbers, no insignificant whitespace) before hashing, so two
//! semantically identical inputs always produce the same digest.

use serde::Serialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Errors from canonical hashing.
#[derive(Debug, Error)]
pub enum HashError {
    /// Hashing `null` is a caller bug, not an empty digest.
    #[error("refusing to hash a null value")]
    NullInput,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("JCS canonicalization error: {0}")]
    Canonicalization(String),
}

/// Compute SHA-256 of bytes and return lowercase hex.
pub fn digest_of_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Serialize `value` to canonical JSON bytes.
pub fn canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, HashError> {
    let json = serde_json::to_value(value)?;
    if json.is_null() {
        return Err(HashError::NullInput);
    }
    serde_json_canonicalizer::to_vec(&json).map_err(|e| HashError::Canonicalization(e.to_string()))
}

/// Compute SHA-256 of the canonical JSON form of `value`.
pub fn digest_of_canonical<T: Serialize + ?Sized>(value: &T) -> Result<String, HashError> {
    Ok(digest_of_bytes(&canonical_bytes(value)?))
}

/// Compare two byte strings without short-circuiting on the first mismatch.
///
/// Length is not secret: differing lengths return `false` immediately.
pub fn constant_time_equal(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Whether `s` is a 64-character lowercase hex SHA-256 digest.
pub fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
