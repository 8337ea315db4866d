//! Per-file advisory locking.
//!
//! Writers take an exclusive lock on a key (a run id, a side-file name, a
//! digest) before the exists-check-then-write sequence, so two writers for
//! the same key are serialized while writers for different keys never block
//! each other. Lock files live under `{root}/.locks/{xx}/{key}.lock`, sharded
//! by the first byte of the key's digest, and are left in place after use.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use tracing::warn;

use crate::error::{StoreError, StoreResult};
use crate::hashing::digest_of_bytes;

/// Name of the lock directory under a store root.
pub const LOCK_DIR_NAME: &str = ".locks";

// fs2 has no timed lock; poll try_lock_exclusive instead.
const POLL_INTERVAL: Duration = Duration::from_millis(10);
const CONTENTION_WARN_AFTER: Duration = Duration::from_millis(500);

/// An exclusive lock, released on drop.
#[derive(Debug)]
pub struct FileLock {
    lock_path: PathBuf,
    lock_file: File,
}

impl FileLock {
    /// Acquire an exclusive lock on `lock_path`, waiting up to `timeout`.
    pub fn acquire(lock_path: &Path, timeout: Duration) -> StoreResult<Self> {
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)?;

        let start = Instant::now();
        let mut warned = false;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    if warned {
                        warn!(
                            lock = %lock_path.display(),
                            waited_ms = start.elapsed().as_millis() as u64,
                            "lock acquired after contention"
                        );
                    }
                    return Ok(Self {
                        lock_path: lock_path.to_path_buf(),
                        lock_file: file,
                    });
                }
                Err(e) if is_contended(&e) => {
                    if !warned && start.elapsed() > CONTENTION_WARN_AFTER {
                        warn!(lock = %lock_path.display(), "lock contention, waiting");
                        warned = true;
                    }
                }
                Err(e) => return Err(StoreError::Io(e)),
            }

            if start.elapsed() >= timeout {
                return Err(StoreError::LockTimeout {
                    path: lock_path.to_path_buf(),
                    timeout,
                });
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.lock_file);
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Lock namespace rooted in a store directory.
#[derive(Debug, Clone)]
pub struct LockDir {
    dir: PathBuf,
    timeout: Duration,
}

impl LockDir {
    /// Locks for the store at `store_root`; the directory is created lazily.
    pub fn new(store_root: &Path, timeout: Duration) -> Self {
        Self {
            dir: store_root.join(LOCK_DIR_NAME),
            timeout,
        }
    }

    /// Path of the lock file for `key`.
    pub fn lock_path(&self, key: &str) -> PathBuf {
        let shard = &digest_of_bytes(key.as_bytes())[..2];
        self.dir.join(shard).join(format!("{}.lock", key))
    }

    /// Acquire the lock for `key`. Keys must already be filename-safe.
    pub fn lock(&self, key: &str) -> StoreResult<FileLock> {
        FileLock::acquire(&self.lock_path(key), self.timeout)
    }
}
