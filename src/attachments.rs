//! Content-addressed attachment store.
//!
//! Binary payloads (toolpaths, programs, previews) are stored once per unique
//! SHA-256 digest using a two-level fan-out:
//! `<root>/<sha256[0:2]>/<sha256[2:4]>/<sha256><ext>`, with a metadata sidecar
//! `<sha256>.meta.json` next to the blob.
//!
//! Writes are atomic (temp file, fsync, rename). The sidecar is written
//! before the blob, so a blob that is visible always has metadata; a second
//! write of the same content returns the existing path and only restores the
//! sidecar if it has gone missing.
//!
//! Verification re-reads the blob and compares digests in constant time.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{StoreError, StoreResult, ValidationError};
use crate::hashing::{constant_time_equal, digest_of_bytes, is_sha256_hex};
use crate::schema::SCHEMA_VERSION;
use crate::store::atomic::{cleanup_orphaned_temps, is_temp_name, write_atomic};
use crate::store::lock::{LockDir, LOCK_DIR_NAME};
use crate::store::StoreOptions;

/// Schema identifier for attachment metadata sidecars.
pub const ATTACHMENT_META_SCHEMA_ID: &str = "run-artifacts/attachment_meta@1";

/// Default cap on a single blob (50 MiB).
pub const DEFAULT_MAX_BLOB_BYTES: u64 = 50 * 1024 * 1024;

const META_SUFFIX: &str = ".meta.json";
const MAX_EXT_LEN: usize = 16;

/// Metadata about a stored blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentBlob {
    /// Lowercase hex digest of the blob bytes; also its storage key.
    pub sha256: String,
    /// Mime or logical type, as supplied by the first writer.
    pub kind: String,
    pub byte_size: u64,
    /// Base name hint from the first writer (never a path).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// Extension including the leading dot, or empty.
    #[serde(default)]
    pub ext: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AttachmentMeta {
    schema_version: u32,
    schema_id: String,
    #[serde(flatten)]
    blob: AttachmentBlob,
}

/// Result of re-hashing a stored blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    /// True when the recomputed digest equals the requested one.
    pub ok: bool,
    pub sha256: String,
    /// Digest of the bytes actually on disk.
    pub recomputed_sha256: String,
}

/// Blob count and total payload size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AttachmentStats {
    pub blob_count: u64,
    pub total_bytes: u64,
}

/// Content-addressed attachment store.
#[derive(Debug, Clone)]
pub struct AttachmentStore {
    root: PathBuf,
    locks: LockDir,
    max_blob_bytes: u64,
}

impl AttachmentStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>, options: StoreOptions, max_blob_bytes: u64) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let removed = cleanup_orphaned_temps(&root, options.orphan_temp_max_age)?;
        if removed > 0 {
            info!(root = %root.display(), removed, "removed orphaned attachment temp files");
        }

        Ok(Self {
            locks: LockDir::new(&root, options.lock_timeout),
            root,
            max_blob_bytes,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_blob_bytes(&self) -> u64 {
        self.max_blob_bytes
    }

    /// Shard directory for a digest: `<root>/ab/cd`.
    fn shard_dir(&self, sha256: &str) -> PathBuf {
        self.root.join(&sha256[..2]).join(&sha256[2..4])
    }

    fn meta_path(&self, sha256: &str) -> PathBuf {
        self.shard_dir(sha256).join(format!("{}{}", sha256, META_SUFFIX))
    }

    /// Store `data`, returning its digest and the blob path.
    ///
    /// If a blob with the same digest already exists it is returned untouched,
    /// whatever `filename_hint` or `ext` this call supplied.
    pub fn put_bytes(
        &self,
        data: &[u8],
        kind: &str,
        filename_hint: Option<&str>,
        ext: &str,
    ) -> StoreResult<(String, PathBuf)> {
        let size = data.len() as u64;
        if size > self.max_blob_bytes {
            return Err(StoreError::PayloadTooLarge {
                size,
                max: self.max_blob_bytes,
            });
        }
        let ext = normalize_ext(ext)?;
        let sha256 = digest_of_bytes(data);

        let _lock = self.locks.lock(&sha256)?;

        let meta = AttachmentMeta {
            schema_version: SCHEMA_VERSION,
            schema_id: ATTACHMENT_META_SCHEMA_ID.to_string(),
            blob: AttachmentBlob {
                sha256: sha256.clone(),
                kind: kind.trim().to_string(),
                byte_size: size,
                filename: filename_hint.and_then(clean_filename),
                ext,
                created_at: Utc::now(),
            },
        };

        if let Some(existing) = self.find_blob(&sha256)? {
            let meta_path = self.meta_path(&sha256);
            if !meta_path.is_file() {
                warn!(sha256 = %sha256, "restoring missing attachment sidecar");
                let mut meta = meta;
                meta.blob.ext = stored_ext(&existing, &sha256);
                write_atomic(&meta_path, &serde_json::to_vec_pretty(&meta)?)?;
            } else {
                debug!(sha256 = %sha256, "attachment already stored");
            }
            return Ok((sha256, existing));
        }

        // Sidecar first: a visible blob always has metadata.
        let shard = self.shard_dir(&sha256);
        fs::create_dir_all(&shard)?;
        write_atomic(&self.meta_path(&sha256), &serde_json::to_vec_pretty(&meta)?)?;
        let blob_path = shard.join(format!("{}{}", sha256, meta.blob.ext));
        write_atomic(&blob_path, data)?;

        info!(sha256 = %sha256, bytes = size, kind = %meta.blob.kind, "attachment stored");
        Ok((sha256, blob_path))
    }

    /// Stored bytes for `sha256`, or `None` if absent.
    pub fn get_bytes(&self, sha256: &str) -> StoreResult<Option<Vec<u8>>> {
        match self.path_for(sha256)? {
            Some(path) => Ok(Some(fs::read(path)?)),
            None => Ok(None),
        }
    }

    pub fn exists(&self, sha256: &str) -> StoreResult<bool> {
        Ok(self.path_for(sha256)?.is_some())
    }

    /// Path of the stored blob for `sha256`, or `None` if absent.
    pub fn path_for(&self, sha256: &str) -> StoreResult<Option<PathBuf>> {
        validate_digest(sha256)?;
        self.find_blob(sha256)
    }

    /// Sidecar metadata for `sha256`.
    pub fn metadata(&self, sha256: &str) -> StoreResult<Option<AttachmentBlob>> {
        validate_digest(sha256)?;
        let path = self.meta_path(sha256);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let meta: AttachmentMeta =
            serde_json::from_slice(&bytes).map_err(|e| StoreError::CorruptRecord {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        if meta.schema_id != ATTACHMENT_META_SCHEMA_ID || meta.blob.sha256 != sha256 {
            return Err(StoreError::CorruptRecord {
                path,
                reason: "metadata does not describe this blob".to_string(),
            });
        }
        Ok(Some(meta.blob))
    }

    /// Re-hash the stored bytes and compare against the key.
    pub fn verify(&self, sha256: &str) -> StoreResult<VerifyReport> {
        let data = self
            .get_bytes(sha256)?
            .ok_or_else(|| StoreError::AttachmentNotFound {
                sha256: sha256.to_string(),
            })?;
        let recomputed = digest_of_bytes(&data);
        let ok = constant_time_equal(recomputed.as_bytes(), sha256.as_bytes());
        if !ok {
            warn!(sha256 = %sha256, recomputed = %recomputed, "attachment integrity check failed");
        }
        Ok(VerifyReport {
            ok,
            sha256: sha256.to_string(),
            recomputed_sha256: recomputed,
        })
    }

    /// Count blobs and sum their sizes.
    pub fn stats(&self) -> StoreResult<AttachmentStats> {
        let mut stats = AttachmentStats::default();
        let walker = WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(3)
            .into_iter()
            .filter_entry(|e| e.depth() != 1 || e.file_name() != LOCK_DIR_NAME);
        for entry in walker {
            let entry = entry.map_err(|e| {
                e.into_io_error()
                    .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "walk failed"))
            })?;
            if entry.depth() != 3 || !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if name.ends_with(META_SUFFIX) || is_temp_name(&name) {
                continue;
            }
            stats.blob_count += 1;
            stats.total_bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
        Ok(stats)
    }

    /// Find the blob file for a validated digest, whatever its extension.
    fn find_blob(&self, sha256: &str) -> StoreResult<Option<PathBuf>> {
        let shard = self.shard_dir(sha256);
        let entries = match fs::read_dir(&shard) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(rest) = name.strip_prefix(sha256) else {
                continue;
            };
            if rest == META_SUFFIX {
                continue;
            }
            if rest.is_empty() || is_valid_ext(rest) {
                return Ok(Some(entry.path()));
            }
        }
        Ok(None)
    }
}

/// Extension of a stored blob, taken from its file name.
fn stored_ext(blob_path: &Path, sha256: &str) -> String {
    blob_path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_prefix(sha256))
        .unwrap_or_default()
        .to_string()
}

/// Reject anything but 64 lowercase hex characters.
pub fn validate_digest(sha256: &str) -> Result<(), ValidationError> {
    if is_sha256_hex(sha256) {
        Ok(())
    } else {
        Err(ValidationError::InvalidDigest {
            field: "sha256".to_string(),
            value: sha256.to_string(),
        })
    }
}

fn is_valid_ext(ext: &str) -> bool {
    match ext.strip_prefix('.') {
        Some(body) => {
            !body.is_empty() && body.len() <= MAX_EXT_LEN && body.bytes().all(|b| b.is_ascii_alphanumeric())
        }
        None => false,
    }
}

/// Accept `""`, `"nc"` or `".nc"`; always return the dotted form.
fn normalize_ext(ext: &str) -> Result<String, ValidationError> {
    let ext = ext.trim();
    if ext.is_empty() {
        return Ok(String::new());
    }
    let dotted = if ext.starts_with('.') {
        ext.to_string()
    } else {
        format!(".{}", ext)
    };
    if is_valid_ext(&dotted) {
        Ok(dotted)
    } else {
        Err(ValidationError::InvalidExtension {
            value: ext.to_string(),
        })
    }
}

/// Keep only the final path component of a caller's filename hint.
fn clean_filename(hint: &str) -> Option<String> {
    let name = hint.rsplit(['/', '\\']).next().unwrap_or(hint).trim();
    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> AttachmentStore {
        AttachmentStore::open(dir.path(), StoreOptions::default(), 1024).unwrap()
    }

    #[test]
    fn test_put_uses_sharded_layout() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let (sha, path) = store.put_bytes(b"G0 X0 Y0\n", "text/x-gcode", Some("job.nc"), ".nc").unwrap();

        assert_eq!(sha, digest_of_bytes(b"G0 X0 Y0\n"));
        let expected = dir
            .path()
            .join(&sha[..2])
            .join(&sha[2..4])
            .join(format!("{}.nc", sha));
        assert_eq!(path, expected);
        assert_eq!(store.get_bytes(&sha).unwrap().unwrap(), b"G0 X0 Y0\n");
    }

    #[test]
    fn test_dedup_ignores_filename_hint() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let (a, path_a) = store.put_bytes(b"same", "application/dxf", Some("a.dxf"), "dxf").unwrap();
        let (b, path_b) = store.put_bytes(b"same", "application/dxf", Some("b.dxf"), "dxf").unwrap();

        assert_eq!(a, b);
        assert_eq!(path_a, path_b);
        assert_eq!(store.stats().unwrap().blob_count, 1);
        assert_eq!(store.metadata(&a).unwrap().unwrap().filename.as_deref(), Some("a.dxf"));
    }

    #[test]
    fn test_dedup_restores_missing_sidecar() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let (sha, path) = store.put_bytes(b"G0 X0", "gcode", Some("a.nc"), "nc").unwrap();
        fs::remove_file(store.meta_path(&sha)).unwrap();
        assert!(store.metadata(&sha).unwrap().is_none());

        let (again, again_path) = store.put_bytes(b"G0 X0", "toolpath", None, "").unwrap();
        assert_eq!((again, again_path), (sha.clone(), path));
        let meta = store.metadata(&sha).unwrap().unwrap();
        assert_eq!(meta.kind, "toolpath");
        assert_eq!(meta.ext, ".nc");
        assert_eq!(meta.byte_size, 5);
    }

    #[test]
    fn test_oversized_payload_rejected_without_writing() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let big = vec![0u8; 2048];
        assert!(matches!(
            store.put_bytes(&big, "bin", None, ""),
            Err(StoreError::PayloadTooLarge { size: 2048, max: 1024 })
        ));
        assert_eq!(store.stats().unwrap(), AttachmentStats::default());
    }

    #[test]
    fn test_verify_detects_corruption() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let (sha, path) = store.put_bytes(b"payload", "bin", None, "").unwrap();
        assert!(store.verify(&sha).unwrap().ok);

        fs::write(&path, b"tampered").unwrap();
        let report = store.verify(&sha).unwrap();
        assert!(!report.ok);
        assert_ne!(report.recomputed_sha256, sha);
    }

    #[test]
    fn test_unknown_and_malformed_digests() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert_eq!(store.get_bytes(&"0".repeat(64)).unwrap(), None);
        assert!(!store.exists(&"0".repeat(64)).unwrap());
        assert!(matches!(
            store.verify(&"0".repeat(64)),
            Err(StoreError::AttachmentNotFound { .. })
        ));
        assert!(matches!(store.get_bytes("../../etc"), Err(StoreError::Validation(_))));
        assert!(matches!(store.get_bytes(&"A".repeat(64)), Err(StoreError::Validation(_))));
    }

    #[test]
    fn test_extension_rules() {
        assert_eq!(normalize_ext("").unwrap(), "");
        assert_eq!(normalize_ext("nc").unwrap(), ".nc");
        assert_eq!(normalize_ext(".svg").unwrap(), ".svg");
        assert!(normalize_ext("../x").is_err());
        assert!(normalize_ext(".tar.gz").is_err());
        assert!(normalize_ext(&format!(".{}", "a".repeat(17))).is_err());
    }

    #[test]
    fn test_filename_hint_is_reduced_to_basename() {
        assert_eq!(clean_filename("/tmp/out/job.nc").as_deref(), Some("job.nc"));
        assert_eq!(clean_filename("C:\\x\\y.svg").as_deref(), Some("y.svg"));
        assert_eq!(clean_filename(".."), None);
    }
}
