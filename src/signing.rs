//! HMAC-signed, time-limited capability links for attachments.
//!
//! The MAC covers a newline-joined canonical string:
//!
//! ```text
//! METHOD\npath\nexpires_at\nsha256\nscope\ndownload(0|1)\nfilename
//! ```
//!
//! Tokens are hex-encoded HMAC-SHA256. A token is bound to the method implied
//! by its scope (`download` -> `GET`, `head` -> `HEAD`); a `download` token
//! also admits `HEAD` requests.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use run_artifact_protocol::ErrorCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;

use crate::error::ValidationError;
use crate::hashing::constant_time_equal;

type HmacSha256 = Hmac<Sha256>;

/// Minimum decoded key length.
pub const MIN_KEY_BYTES: usize = 32;

/// Default token lifetime.
pub const DEFAULT_TTL_SECS: u64 = 300;

const BASE64_KEY_PREFIX: &str = "base64:";

/// Why a capability was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("signature expired at {expires_at}")]
    Expired { expires_at: i64 },

    #[error("signature invalid: {reason}")]
    Invalid { reason: String },

    #[error("scope '{scope}' does not permit {method}")]
    ScopeDenied { scope: Scope, method: String },
}

impl SignatureError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Expired { .. } => ErrorCode::SignatureExpired,
            Self::Invalid { .. } => ErrorCode::SignatureInvalid,
            Self::ScopeDenied { .. } => ErrorCode::ScopeDenied,
        }
    }

    /// Structured context for error bodies.
    pub fn data(&self) -> Value {
        match self {
            Self::Expired { expires_at } => json!({ "expires_at": expires_at }),
            Self::Invalid { reason } => json!({ "reason": reason }),
            Self::ScopeDenied { scope, method } => json!({ "scope": scope, "method": method }),
        }
    }

    fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid { reason: reason.into() }
    }
}

/// What a token grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Read the bytes; implies `Head`.
    Download,
    /// Metadata only.
    Head,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Head => "head",
        }
    }

    /// Method a token of this scope is issued for.
    pub fn signed_method(&self) -> &'static str {
        match self {
            Self::Download => "GET",
            Self::Head => "HEAD",
        }
    }

    /// Whether this scope satisfies `required`.
    pub fn grants(&self, required: Scope) -> bool {
        matches!((self, required), (Self::Download, _) | (Self::Head, Self::Head))
    }

    /// Whether a request with `method` may use a token of this scope.
    pub fn allows_method(&self, method: &str) -> bool {
        let method = method.to_ascii_uppercase();
        match self {
            Self::Download => method == "GET" || method == "HEAD",
            Self::Head => method == "HEAD",
        }
    }
}

impl FromStr for Scope {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "download" => Ok(Self::Download),
            "head" => Ok(Self::Head),
            other => Err(SignatureError::invalid(format!("unknown scope '{}'", other))),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fields a token is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRequest {
    pub method: String,
    pub path: String,
    pub sha256: String,
    /// Unix seconds.
    pub expires_at: i64,
    pub scope: Scope,
    pub download: bool,
    pub filename: String,
}

impl SignedRequest {
    fn canonical(&self) -> String {
        format!(
            "{}\n{}\n{}\n{}\n{}\n{}\n{}",
            self.method.to_ascii_uppercase(),
            self.path,
            self.expires_at,
            self.sha256,
            self.scope.as_str(),
            if self.download { "1" } else { "0" },
            self.filename
        )
    }
}

/// A rendered signed link and its parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignedUrl {
    pub url: String,
    pub expires_at: i64,
    pub scope: Scope,
    pub token: String,
}

/// Issues and checks signed attachment links.
#[derive(Clone)]
pub struct UrlSigner {
    key: Vec<u8>,
    default_ttl_secs: u64,
}

impl fmt::Debug for UrlSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UrlSigner")
            .field("key", &"<redacted>")
            .field("default_ttl_secs", &self.default_ttl_secs)
            .finish()
    }
}

impl UrlSigner {
    pub fn new(key: Vec<u8>, default_ttl_secs: u64) -> Result<Self, ValidationError> {
        if key.len() < MIN_KEY_BYTES {
            return Err(ValidationError::InvalidValue {
                field: "signing.key".to_string(),
                reason: format!("key must be at least {} bytes", MIN_KEY_BYTES),
            });
        }
        Ok(Self { key, default_ttl_secs })
    }

    /// Build a signer from a configured key: hex, or `base64:`-prefixed.
    pub fn from_encoded(encoded: &str, default_ttl_secs: u64) -> Result<Self, ValidationError> {
        Self::new(decode_key(encoded)?, default_ttl_secs)
    }

    pub fn default_ttl_secs(&self) -> u64 {
        self.default_ttl_secs
    }

    fn mac(&self, request: &SignedRequest) -> Result<Vec<u8>, SignatureError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.key)
            .map_err(|e| SignatureError::invalid(format!("HMAC init failed: {}", e)))?;
        mac.update(request.canonical().as_bytes());
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// Hex token for `request`.
    pub fn sign(&self, request: &SignedRequest) -> Result<String, SignatureError> {
        Ok(hex::encode(self.mac(request)?))
    }

    /// Check `token` against `request` at the current time.
    pub fn verify(&self, request: &SignedRequest, token: &str, required: Scope) -> Result<(), SignatureError> {
        self.verify_at(request, token, required, Utc::now().timestamp())
    }

    /// Check `token` against `request` as of `now` (unix seconds).
    ///
    /// A bad MAC is reported before expiry, so an expired token with a forged
    /// signature is still `Invalid`.
    pub fn verify_at(
        &self,
        request: &SignedRequest,
        token: &str,
        required: Scope,
        now: i64,
    ) -> Result<(), SignatureError> {
        let provided = hex::decode(token).map_err(|_| {
            debug!("rejected signature: token is not hex");
            SignatureError::invalid("token is not hex")
        })?;
        if !constant_time_equal(&provided, &self.mac(request)?) {
            debug!(path = %request.path, "rejected signature: MAC mismatch");
            return Err(SignatureError::invalid("MAC mismatch"));
        }
        if now >= request.expires_at {
            debug!(path = %request.path, expires_at = request.expires_at, "rejected signature: expired");
            return Err(SignatureError::Expired {
                expires_at: request.expires_at,
            });
        }
        if !request.scope.grants(required) {
            debug!(scope = %request.scope, required = %required, "rejected signature: scope");
            return Err(SignatureError::ScopeDenied {
                scope: request.scope,
                method: required.signed_method().to_string(),
            });
        }
        Ok(())
    }

    /// Issue a link to the attachment at `path`.
    ///
    /// `ttl_secs` of `None` uses the configured default.
    pub fn signed_url(
        &self,
        path: &str,
        sha256: &str,
        scope: Scope,
        download: bool,
        filename: &str,
        ttl_secs: Option<u64>,
    ) -> Result<SignedUrl, SignatureError> {
        let ttl = ttl_secs.unwrap_or(self.default_ttl_secs) as i64;
        let expires_at = Utc::now().timestamp().saturating_add(ttl);
        self.signed_url_expiring(path, sha256, scope, download, filename, expires_at)
    }

    /// Issue a link with an explicit expiry.
    pub fn signed_url_expiring(
        &self,
        path: &str,
        sha256: &str,
        scope: Scope,
        download: bool,
        filename: &str,
        expires_at: i64,
    ) -> Result<SignedUrl, SignatureError> {
        let request = SignedRequest {
            method: scope.signed_method().to_string(),
            path: path.to_string(),
            sha256: sha256.to_string(),
            expires_at,
            scope,
            download,
            filename: filename.to_string(),
        };
        let token = self.sign(&request)?;
        let url = format!(
            "{}?expires={}&scope={}&download={}&filename={}&sig={}",
            path,
            expires_at,
            scope,
            if download { 1 } else { 0 },
            percent_encode(filename),
            token
        );
        Ok(SignedUrl {
            url,
            expires_at,
            scope,
            token,
        })
    }

    /// Verify the query string of a link issued by [`signed_url`] for a
    /// request with `method` on `path`.
    ///
    /// [`signed_url`]: UrlSigner::signed_url
    pub fn verify_query(
        &self,
        method: &str,
        path: &str,
        sha256: &str,
        query: &str,
        required: Scope,
    ) -> Result<SignedRequest, SignatureError> {
        self.verify_query_at(method, path, sha256, query, required, Utc::now().timestamp())
    }

    pub fn verify_query_at(
        &self,
        method: &str,
        path: &str,
        sha256: &str,
        query: &str,
        required: Scope,
        now: i64,
    ) -> Result<SignedRequest, SignatureError> {
        let params = QueryParams::parse(query)?;
        let request = SignedRequest {
            method: params.scope.signed_method().to_string(),
            path: path.to_string(),
            sha256: sha256.to_string(),
            expires_at: params.expires_at,
            scope: params.scope,
            download: params.download,
            filename: params.filename,
        };
        self.verify_at(&request, &params.sig, required, now)?;
        if !request.scope.allows_method(method) {
            debug!(scope = %request.scope, method = %method, "rejected signature: method");
            return Err(SignatureError::ScopeDenied {
                scope: request.scope,
                method: method.to_ascii_uppercase(),
            });
        }
        Ok(request)
    }
}

struct QueryParams {
    expires_at: i64,
    scope: Scope,
    download: bool,
    filename: String,
    sig: String,
}

impl QueryParams {
    fn parse(query: &str) -> Result<Self, SignatureError> {
        let query = query.trim_start_matches('?');
        let query = query.split_once('?').map_or(query, |(_, q)| q);

        let mut expires = None;
        let mut scope = None;
        let mut download = None;
        let mut filename = String::new();
        let mut sig = None;
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            match key {
                "expires" => {
                    expires = Some(
                        value
                            .parse::<i64>()
                            .map_err(|_| SignatureError::invalid("expires is not an integer"))?,
                    )
                }
                "scope" => scope = Some(value.parse::<Scope>()?),
                "download" => {
                    download = Some(match value {
                        "1" => true,
                        "0" => false,
                        _ => return Err(SignatureError::invalid("download must be 0 or 1")),
                    })
                }
                "filename" => filename = percent_decode(value)?,
                "sig" => sig = Some(value.to_string()),
                _ => {}
            }
        }

        Ok(Self {
            expires_at: expires.ok_or_else(|| SignatureError::invalid("missing expires"))?,
            scope: scope.ok_or_else(|| SignatureError::invalid("missing scope"))?,
            download: download.unwrap_or(false),
            filename,
            sig: sig.ok_or_else(|| SignatureError::invalid("missing sig"))?,
        })
    }
}

/// Decode a configured key: `base64:<b64>` or plain hex.
pub fn decode_key(encoded: &str) -> Result<Vec<u8>, ValidationError> {
    let encoded = encoded.trim();
    let decoded = match encoded.strip_prefix(BASE64_KEY_PREFIX) {
        Some(b64) => BASE64.decode(b64).map_err(|e| e.to_string()),
        None => hex::decode(encoded).map_err(|e| e.to_string()),
    };
    decoded.map_err(|reason| ValidationError::InvalidValue {
        field: "signing.key".to_string(),
        reason,
    })
}

fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

fn percent_decode(value: &str) -> Result<String, SignatureError> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let (hi, lo) = match bytes.get(i + 1..i + 3) {
                    Some(&[hi, lo]) => (hi, lo),
                    _ => return Err(SignatureError::invalid("truncated percent escape")),
                };
                match (hex_value(hi), hex_value(lo)) {
                    (Some(hi), Some(lo)) => out.push((hi << 4) | lo),
                    _ => return Err(SignatureError::invalid("bad percent escape")),
                }
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|_| SignatureError::invalid("filename is not UTF-8"))
}

fn hex_value(digit: u8) -> Option<u8> {
    (digit as char).to_digit(16).map(|d| d as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    fn signer() -> UrlSigner {
        UrlSigner::new(vec![7u8; 32], 300).unwrap()
    }

    fn request(expires_at: i64, scope: Scope) -> SignedRequest {
        SignedRequest {
            method: scope.signed_method().to_string(),
            path: format!("/attachments/{}", SHA),
            sha256: SHA.to_string(),
            expires_at,
            scope,
            download: true,
            filename: "job.nc".to_string(),
        }
    }

    #[test]
    fn test_sign_verify_round_trip() {
        let s = signer();
        let req = request(2_000, Scope::Download);
        let token = s.sign(&req).unwrap();
        assert_eq!(token.len(), 64);
        assert!(s.verify_at(&req, &token, Scope::Download, 1_000).is_ok());
        assert!(s.verify_at(&req, &token, Scope::Head, 1_000).is_ok());
    }

    #[test]
    fn test_expired_token_fails_even_with_valid_mac() {
        let s = signer();
        let req = request(1_000, Scope::Download);
        let token = s.sign(&req).unwrap();
        assert_eq!(
            s.verify_at(&req, &token, Scope::Download, 1_000),
            Err(SignatureError::Expired { expires_at: 1_000 })
        );
        assert!(matches!(
            s.verify(&req, &token, Scope::Download),
            Err(SignatureError::Expired { .. })
        ));
    }

    #[test]
    fn test_any_field_change_invalidates() {
        let s = signer();
        let req = request(2_000, Scope::Download);
        let token = s.sign(&req).unwrap();

        let mut tampered = req.clone();
        tampered.filename = "other.nc".to_string();
        assert!(matches!(
            s.verify_at(&tampered, &token, Scope::Download, 1_000),
            Err(SignatureError::Invalid { .. })
        ));

        let mut tampered = req.clone();
        tampered.expires_at = 9_999;
        assert!(matches!(
            s.verify_at(&tampered, &token, Scope::Download, 1_000),
            Err(SignatureError::Invalid { .. })
        ));

        let other = UrlSigner::new(vec![8u8; 32], 300).unwrap();
        assert!(other.verify_at(&req, &token, Scope::Download, 1_000).is_err());
        assert!(s.verify_at(&req, "zz", Scope::Download, 1_000).is_err());
    }

    #[test]
    fn test_head_scope_cannot_download() {
        let s = signer();
        let req = request(2_000, Scope::Head);
        let token = s.sign(&req).unwrap();
        assert!(s.verify_at(&req, &token, Scope::Head, 1_000).is_ok());
        assert!(matches!(
            s.verify_at(&req, &token, Scope::Download, 1_000),
            Err(SignatureError::ScopeDenied { .. })
        ));
    }

    #[test]
    fn test_signed_url_query_round_trip() {
        let s = signer();
        let path = format!("/attachments/{}", SHA);
        let link = s.signed_url_expiring(&path, SHA, Scope::Download, true, "my job.nc", 2_000).unwrap();
        assert!(link.url.starts_with(&format!("{}?expires=2000&scope=download&download=1&filename=my%20job.nc&sig=", path)));

        let verified = s
            .verify_query_at("GET", &path, SHA, &link.url, Scope::Download, 1_000)
            .unwrap();
        assert_eq!(verified.filename, "my job.nc");
        assert!(s
            .verify_query_at("HEAD", &path, SHA, &link.url, Scope::Head, 1_000)
            .is_ok());
        assert!(matches!(
            s.verify_query_at("DELETE", &path, SHA, &link.url, Scope::Head, 1_000),
            Err(SignatureError::ScopeDenied { .. })
        ));
        assert!(matches!(
            s.verify_query_at("GET", "/attachments/other", SHA, &link.url, Scope::Download, 1_000),
            Err(SignatureError::Invalid { .. })
        ));
    }

    #[test]
    fn test_head_link_rejects_get() {
        let s = signer();
        let link = s.signed_url_expiring("/a", SHA, Scope::Head, false, "", 2_000).unwrap();
        assert!(s.verify_query_at("HEAD", "/a", SHA, &link.url, Scope::Head, 1_000).is_ok());
        assert!(matches!(
            s.verify_query_at("GET", "/a", SHA, &link.url, Scope::Head, 1_000),
            Err(SignatureError::ScopeDenied { .. })
        ));
    }

    #[test]
    fn test_malformed_query() {
        let s = signer();
        assert!(matches!(
            s.verify_query_at("GET", "/a", SHA, "expires=x&scope=download&sig=00", Scope::Download, 0),
            Err(SignatureError::Invalid { .. })
        ));
        assert!(matches!(
            s.verify_query_at("GET", "/a", SHA, "expires=5&scope=admin&sig=00", Scope::Download, 0),
            Err(SignatureError::Invalid { .. })
        ));
    }

    #[test]
    fn test_percent_decode_requires_two_hex_digits() {
        assert_eq!(percent_decode("job%20one+v2.nc").unwrap(), "job one v2.nc");
        assert_eq!(percent_decode("%C3%A9").unwrap(), "\u{e9}");
        assert!(percent_decode("%+1").is_err());
        assert!(percent_decode("%-f").is_err());
        assert!(percent_decode("%4").is_err());
        assert!(percent_decode("%zz").is_err());
    }

    #[test]
    fn test_key_decoding() {
        assert_eq!(decode_key(&"ab".repeat(32)).unwrap().len(), 32);
        assert_eq!(
            decode_key(&format!("base64:{}", BASE64.encode([1u8; 32]))).unwrap(),
            vec![1u8; 32]
        );
        assert!(decode_key("not-hex").is_err());
        assert!(UrlSigner::from_encoded(&"ab".repeat(8), 300).is_err());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(SignatureError::Expired { expires_at: 1 }.code(), ErrorCode::SignatureExpired);
        assert_eq!(SignatureError::invalid("x").code(), ErrorCode::SignatureInvalid);
        assert_eq!(
            SignatureError::ScopeDenied { scope: Scope::Head, method: "GET".into() }.code(),
            ErrorCode::ScopeDenied
        );
    }
}
