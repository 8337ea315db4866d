//! The Access API: the operation surface handed to the external request layer.
//!
//! Every method returns a [`StoreResult`]; absence is reported as
//! `RunNotFound`/`AttachmentNotFound` so that the dispatcher can render a
//! structured body instead of a bare status.

mod dispatch;

use std::path::Path;

use serde::Serialize;
use tracing::debug;

use crate::attachments::{validate_digest, AttachmentBlob, AttachmentStore, VerifyReport};
use crate::config::{ConfigError, EffectiveConfig};
use crate::diff::{diff_report, DiffOptions, DiffReport};
use crate::error::{StoreError, StoreResult};
use crate::schema::{ExplanationStatus, RunArtifact, RunArtifactBuilder};
use crate::signing::{Scope, SignedUrl, UrlSigner};
use crate::store::{AdvisoryRequest, ArtifactStore, ListFilter, ListResult};

/// How a caller is allowed to reach an attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    /// The request layer has already authorized the caller.
    Trusted,
    /// An untrusted caller presenting a signed link.
    Signed { method: String, query: String },
}

/// Result of attaching an advisory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttachOutcome {
    /// `false` when the advisory id was already linked.
    pub created: bool,
    pub artifact: RunArtifact,
}

/// Bytes and metadata of a fetched attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedAttachment {
    pub blob: AttachmentBlob,
    pub data: Vec<u8>,
    /// Whether the link asked for a download disposition.
    pub download: bool,
}

/// Canonical request path of an attachment; signed links are bound to it.
pub fn attachment_path(sha256: &str) -> String {
    format!("/attachments/{}", sha256)
}

/// Facade over the artifact store, attachment store and signer.
#[derive(Debug, Clone)]
pub struct AccessApi {
    artifacts: ArtifactStore,
    attachments: AttachmentStore,
    signer: Option<UrlSigner>,
    diff_options: DiffOptions,
}

impl AccessApi {
    pub fn new(
        artifacts: ArtifactStore,
        attachments: AttachmentStore,
        signer: Option<UrlSigner>,
        diff_options: DiffOptions,
    ) -> Self {
        Self {
            artifacts,
            attachments,
            signer,
            diff_options,
        }
    }

    /// Open both stores as configured.
    pub fn from_config(effective: &EffectiveConfig) -> Result<Self, ApiSetupError> {
        let config = &effective.config;
        let options = config.store_options();
        let artifacts = ArtifactStore::open(&config.store.artifact_root, options)?;
        let attachments = AttachmentStore::open(
            &config.store.attachment_root,
            options,
            config.attachments.max_blob_bytes,
        )?;
        Ok(Self::new(artifacts, attachments, effective.signer()?, config.diff_options()))
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn attachments(&self) -> &AttachmentStore {
        &self.attachments
    }

    /// Validate and persist a new record.
    pub fn create_artifact(&self, input: RunArtifactBuilder) -> StoreResult<RunArtifact> {
        let artifact = input.build()?;
        self.artifacts.put(&artifact)?;
        Ok(artifact)
    }

    pub fn get_artifact(&self, run_id: &str) -> StoreResult<RunArtifact> {
        self.artifacts
            .get(run_id)?
            .ok_or_else(|| StoreError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    pub fn list_artifacts(&self, filter: &ListFilter) -> StoreResult<ListResult> {
        self.artifacts.list(filter)
    }

    /// Idempotently link an advisory; returns the merged view either way.
    pub fn attach_advisory(&self, run_id: &str, request: &AdvisoryRequest) -> StoreResult<AttachOutcome> {
        let created = self.artifacts.attach_advisory(run_id, request)?;
        Ok(AttachOutcome {
            created,
            artifact: self.get_artifact(run_id)?,
        })
    }

    pub fn set_explanation(
        &self,
        run_id: &str,
        status: ExplanationStatus,
        summary: Option<String>,
    ) -> StoreResult<RunArtifact> {
        self.artifacts.set_explanation(run_id, status, summary)?;
        self.get_artifact(run_id)
    }

    /// Store attachment bytes; identical content returns the existing blob.
    pub fn put_attachment(
        &self,
        data: &[u8],
        kind: &str,
        filename: Option<&str>,
        ext: &str,
    ) -> StoreResult<AttachmentBlob> {
        let (sha256, _) = self.attachments.put_bytes(data, kind, filename, ext)?;
        self.blob_metadata(&sha256)
    }

    /// Read an attachment, checking the signed link for untrusted callers.
    pub fn fetch_attachment(&self, sha256: &str, access: &Access) -> StoreResult<FetchedAttachment> {
        let download = self.authorize(sha256, access, Scope::Download)?;
        let data = self
            .attachments
            .get_bytes(sha256)?
            .ok_or_else(|| StoreError::AttachmentNotFound {
                sha256: sha256.to_string(),
            })?;
        Ok(FetchedAttachment {
            blob: self.blob_metadata(sha256)?,
            data,
            download,
        })
    }

    /// Metadata only; a `head` link is sufficient.
    pub fn head_attachment(&self, sha256: &str, access: &Access) -> StoreResult<AttachmentBlob> {
        self.authorize(sha256, access, Scope::Head)?;
        self.blob_metadata(sha256)
    }

    pub fn verify_attachment(&self, sha256: &str) -> StoreResult<VerifyReport> {
        self.attachments.verify(sha256)
    }

    /// Issue a signed link for an existing attachment.
    pub fn sign_attachment_url(
        &self,
        sha256: &str,
        scope: Scope,
        download: bool,
        filename: Option<&str>,
        ttl_secs: Option<u64>,
    ) -> StoreResult<SignedUrl> {
        let signer = self.signer.as_ref().ok_or(StoreError::SigningDisabled)?;
        if !self.attachments.exists(sha256)? {
            return Err(StoreError::AttachmentNotFound {
                sha256: sha256.to_string(),
            });
        }
        let filename = match filename {
            Some(name) => name.to_string(),
            None => self
                .attachments
                .metadata(sha256)?
                .and_then(|m| m.filename)
                .unwrap_or_default(),
        };
        Ok(signer.signed_url(
            &attachment_path(sha256),
            sha256,
            scope,
            download && scope == Scope::Download,
            &filename,
            ttl_secs,
        )?)
    }

    /// Diff two stored runs.
    pub fn diff_artifacts(&self, a: &str, b: &str) -> StoreResult<DiffReport> {
        let left = self.get_artifact(a)?;
        let right = self.get_artifact(b)?;
        Ok(diff_report(&left, &right, &self.diff_options)?)
    }

    /// Check access before touching the store.
    ///
    /// Signature problems are reported ahead of existence, so an untrusted
    /// caller learns nothing about which digests are stored.
    fn authorize(&self, sha256: &str, access: &Access, required: Scope) -> StoreResult<bool> {
        validate_digest(sha256)?;
        match access {
            Access::Trusted => Ok(false),
            Access::Signed { method, query } => {
                let signer = self.signer.as_ref().ok_or(StoreError::SigningDisabled)?;
                let request =
                    signer.verify_query(method, &attachment_path(sha256), sha256, query, required)?;
                debug!(sha256 = %sha256, scope = %request.scope, "signed access granted");
                Ok(request.download)
            }
        }
    }

    fn blob_metadata(&self, sha256: &str) -> StoreResult<AttachmentBlob> {
        if let Some(blob) = self.attachments.metadata(sha256)? {
            return Ok(blob);
        }
        // Blob without a sidecar: describe it from the file itself.
        let path = self
            .attachments
            .path_for(sha256)?
            .ok_or_else(|| StoreError::AttachmentNotFound {
                sha256: sha256.to_string(),
            })?;
        let meta = std::fs::metadata(&path)?;
        Ok(AttachmentBlob {
            sha256: sha256.to_string(),
            kind: String::new(),
            byte_size: meta.len(),
            filename: None,
            ext: blob_ext(&path, sha256),
            created_at: meta.modified().map(Into::into).unwrap_or_else(|_| chrono::Utc::now()),
        })
    }
}

fn blob_ext(path: &Path, sha256: &str) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_prefix(sha256))
        .unwrap_or_default()
        .to_string()
}

/// Failure to open the stores from configuration.
#[derive(Debug, thiserror::Error)]
pub enum ApiSetupError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub use dispatch::dispatch;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::RiskLevel;
    use crate::store::StoreOptions;
    use tempfile::TempDir;

    fn api(dir: &TempDir, signer: Option<UrlSigner>) -> AccessApi {
        let options = StoreOptions::default();
        AccessApi::new(
            ArtifactStore::open(dir.path().join("artifacts"), options).unwrap(),
            AttachmentStore::open(dir.path().join("attachments"), options, 1 << 20).unwrap(),
            signer,
            DiffOptions::default(),
        )
    }

    #[test]
    fn test_get_unknown_is_not_found() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            api(&dir, None).get_artifact("run_abc123def456"),
            Err(StoreError::RunNotFound { .. })
        ));
    }

    #[test]
    fn test_attach_returns_same_merged_view() {
        let dir = TempDir::new().unwrap();
        let api = api(&dir, None);
        api.create_artifact(
            RunArtifact::builder()
                .run_id("run_abc123def456")
                .risk_level(RiskLevel::Green)
                .content_hash("a".repeat(64)),
        )
        .unwrap();

        let request = AdvisoryRequest::new("adv_001", crate::schema::AdvisoryKind::Explanation, "explainer");
        let first = api.attach_advisory("run_abc123def456", &request).unwrap();
        let second = api.attach_advisory("run_abc123def456", &request).unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.artifact, second.artifact);
    }

    #[test]
    fn test_signing_disabled_without_key() {
        let dir = TempDir::new().unwrap();
        let api = api(&dir, None);
        let blob = api.put_attachment(b"data", "bin", None, "").unwrap();
        assert!(matches!(
            api.sign_attachment_url(&blob.sha256, Scope::Download, false, None, None),
            Err(StoreError::SigningDisabled)
        ));
    }

    #[test]
    fn test_signed_fetch_checks_signature_before_existence() {
        let dir = TempDir::new().unwrap();
        let api = api(&dir, Some(UrlSigner::new(vec![3u8; 32], 60).unwrap()));
        let missing = "0".repeat(64);
        let access = Access::Signed {
            method: "GET".to_string(),
            query: "expires=1&scope=download&sig=00".to_string(),
        };
        assert!(matches!(
            api.fetch_attachment(&missing, &access),
            Err(StoreError::Signature(_))
        ));
        assert!(matches!(
            api.fetch_attachment(&missing, &Access::Trusted),
            Err(StoreError::AttachmentNotFound { .. })
        ));
    }
}
