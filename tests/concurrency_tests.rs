//! Concurrent writers against one store.

mod fixtures;

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

use fixtures::{artifact, artifact_store, attachment_store, run_id};
use run_artifact_store::schema::AdvisoryKind;
use run_artifact_store::{AdvisoryRequest, ListFilter, RunId, StoreError};
use tempfile::TempDir;

const WRITERS: usize = 8;

#[test]
fn test_distinct_run_ids_all_succeed() {
    let dir = TempDir::new().unwrap();
    let store = artifact_store(&dir);
    let barrier = Arc::new(Barrier::new(WRITERS));

    let handles: Vec<_> = (0..WRITERS)
        .map(|i| {
            let store = store.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                store.put(&artifact(&run_id(i as u64 + 1), "2025-01-15T10:30:00Z"))
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Thread panicked").unwrap();
    }
    let listed = store.list(&ListFilter::default()).unwrap();
    assert_eq!(listed.artifacts.len(), WRITERS);
    assert!(!listed.is_partial());
}

#[test]
fn test_same_run_id_exactly_one_winner() {
    let dir = TempDir::new().unwrap();
    let store = artifact_store(&dir);
    let barrier = Arc::new(Barrier::new(WRITERS));

    let handles: Vec<_> = (0..WRITERS)
        .map(|i| {
            let store = store.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                // Different dates so that losers would land in other partitions.
                let created_at = format!("2025-01-{:02}T10:30:00Z", i + 1);
                barrier.wait();
                store.put(&artifact("run_abc123def456", &created_at))
            })
        })
        .collect();

    let mut successes = 0;
    for handle in handles {
        match handle.join().expect("Thread panicked") {
            Ok(_) => successes += 1,
            Err(StoreError::ImmutabilityViolation { .. }) => {}
            Err(other) => panic!("unexpected error: {}", other),
        }
    }
    assert_eq!(successes, 1);
    assert_eq!(store.list(&ListFilter::default()).unwrap().artifacts.len(), 1);
}

#[test]
fn test_concurrent_advisory_attach_creates_one_side_file() {
    let dir = TempDir::new().unwrap();
    let store = artifact_store(&dir);
    store.put(&artifact("run_abc123def456", "2025-01-15T10:30:00Z")).unwrap();
    let barrier = Arc::new(Barrier::new(WRITERS));

    let handles: Vec<_> = (0..WRITERS)
        .map(|_| {
            let store = store.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let request = AdvisoryRequest::new("adv_001", AdvisoryKind::Advisory, "engine");
                barrier.wait();
                store.attach_advisory("run_abc123def456", &request)
            })
        })
        .collect();

    let created: usize = handles
        .into_iter()
        .map(|h| h.join().expect("Thread panicked").unwrap() as usize)
        .sum();
    assert_eq!(created, 1);
    let merged = store.get("run_abc123def456").unwrap().unwrap();
    assert_eq!(merged.advisory_refs.len(), 1);
}

#[test]
fn test_concurrent_identical_attachments_dedup() {
    let dir = TempDir::new().unwrap();
    let store = attachment_store(&dir);
    let barrier = Arc::new(Barrier::new(WRITERS));

    let handles: Vec<_> = (0..WRITERS)
        .map(|_| {
            let store = store.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                store.put_bytes(b"M30\n", "text/x-gcode", None, "nc")
            })
        })
        .collect();

    let digests: HashSet<String> = handles
        .into_iter()
        .map(|h| h.join().expect("Thread panicked").unwrap().0)
        .collect();
    assert_eq!(digests.len(), 1);
    assert_eq!(store.stats().unwrap().blob_count, 1);
}

#[test]
fn test_generated_run_ids_unique() {
    let ids: HashSet<String> = (0..1000).map(|_| RunId::generate().to_string()).collect();
    assert_eq!(ids.len(), 1000);
}
