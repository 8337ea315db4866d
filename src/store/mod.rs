//! Date-partitioned, immutable artifact persistence.
//!
//! Layout:
//!
//! ```text
//! {root}/{YYYY-MM-DD}/{run_id}.json
//! {root}/{YYYY-MM-DD}/{run_id}_advisory_{advisory_id}.json
//! {root}/{YYYY-MM-DD}/{run_id}_explanation.json
//! {root}/.locks/...
//! ```

mod advisory;
mod artifacts;
pub mod atomic;
pub mod lock;

pub use advisory::{AdvisoryLinker, AdvisoryRequest};
pub use artifacts::{ArtifactStore, ListFilter, ListResult, SkippedRecord, StoreOptions};
pub use lock::{FileLock, LockDir};
