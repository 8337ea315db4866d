//! Atomic write-then-rename and orphaned temp cleanup.
//!
//! Temp files live next to their final path as `.{name}.tmp.{pid}.{nanos}.{seq}`.
//! The leading dot keeps them out of every listing, and a rename within one
//! directory is atomic, so a reader sees either no file or a complete one.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};
use walkdir::WalkDir;

/// Marker embedded in every temp file name.
/// Infix that marks a temp file name.
pub const TEMP_MARKER: &str = ".tmp.";

/// Disambiguates temp names created in the same nanosecond.
static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Whether a file name is one of our temp files.
pub fn is_temp_name(name: &str) -> bool {
    name.starts_with('.') && name.contains(TEMP_MARKER)
}

/// Unique temp sibling for `final_path`.
pub fn temp_path_for(final_path: &Path) -> PathBuf {
    let file_name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let temp_name = format!(".{}{}{}.{}.{}", file_name, TEMP_MARKER, std::process::id(), nanos, seq);
    final_path.with_file_name(temp_name)
}

/// Write `content` to `final_path` atomically.
///
/// The parent directory must exist. The temp file is fsynced before the
/// rename and removed if any step fails.
pub fn write_atomic(final_path: &Path, content: &[u8]) -> io::Result<()> {
    let temp_path = temp_path_for(final_path);

    let result = write_and_rename(&temp_path, final_path, content);
    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

fn write_and_rename(temp_path: &Path, final_path: &Path, content: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(temp_path)?;
    file.write_all(content)?;
    file.sync_all()?;
    drop(file);

    fs::rename(temp_path, final_path)?;
    sync_parent(final_path);
    Ok(())
}

/// Flush the directory entry so the rename survives a crash.
#[cfg(unix)]
fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            if let Err(e) = dir.sync_all() {
                debug!(dir = %parent.display(), error = %e, "directory fsync failed");
            }
        }
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) {}

/// Remove temp files under `root` older than `max_age`.
///
/// Younger temp files may belong to an in-flight writer in another process
/// and are left alone.
pub fn cleanup_orphaned_temps(root: &Path, max_age: Duration) -> io::Result<usize> {
    if !root.exists() {
        return Ok(0);
    }

    let mut cleaned = 0;
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        if !is_temp_name(name) {
            continue;
        }

        let age = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|t| t.elapsed().ok());
        match age {
            Some(age) if age >= max_age => match fs::remove_file(entry.path()) {
                Ok(()) => cleaned += 1,
                Err(e) => warn!(path = %entry.path().display(), error = %e, "failed to remove orphaned temp file"),
            },
            _ => {}
        }
    }

    Ok(cleaned)
}
