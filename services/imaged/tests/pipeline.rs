//! End-to-end tests for the image ingestion pipeline.
//!
//! These drive the worker cycle by cycle against a mock HTTP server and an
//! in-memory mounter, covering the happy path and the hostile-input
//! failure modes.

use std::sync::Arc;
use std::time::Duration;

use httpmock::prelude::*;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::sync::{watch, Notify};

use imgstore_daemon::overlay::MockMounter;
use imgstore_daemon::{
    BlobStore, Catalog, ImageState, Mounter, OverlayManager, StorageLayout, Worker, WorkerConfig,
};

struct Harness {
    _tmp: TempDir,
    layout: StorageLayout,
    catalog: Arc<Catalog>,
    blobs: Arc<BlobStore>,
    mounter: Arc<MockMounter>,
    wake: Arc<Notify>,
    worker: Worker,
}

fn harness() -> Harness {
    harness_with_config(WorkerConfig {
        poll_interval: Duration::from_millis(10),
        max_fetch_retries: 0,
    })
}

fn harness_with_config(config: WorkerConfig) -> Harness {
    let tmp = TempDir::new().unwrap();
    let layout = StorageLayout::new(tmp.path());
    layout.init().unwrap();

    let catalog = Arc::new(Catalog::open_in_memory().unwrap());
    let blobs = Arc::new(BlobStore::new(layout.clone(), catalog.clone()));
    let mounter = Arc::new(MockMounter::new());
    let overlay = Arc::new(OverlayManager::new(layout.clone(), mounter.clone()));
    let wake = Arc::new(Notify::new());

    let worker = Worker::new(
        catalog.clone(),
        blobs.clone(),
        overlay,
        layout.clone(),
        wake.clone(),
        config,
    )
    .unwrap();

    Harness {
        _tmp: tmp,
        layout,
        catalog,
        blobs,
        mounter,
        wake,
        worker,
    }
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn build_tar(entries: &[(&str, &[u8], u32)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, content, mode) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(content.len() as u64);
        header.set_mode(*mode);
        header.set_cksum();
        builder.append_data(&mut header, name, *content).unwrap();
    }
    builder.into_inner().unwrap()
}

/// A tar with a single entry whose raw name escapes the destination.
fn build_traversal_tar() -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(5);
    header.set_mode(0o644);
    let name = b"../etc/passwd";
    header.as_old_mut().name[..name.len()].copy_from_slice(name);
    header.set_cksum();
    builder.append(&header, &b"pwned"[..]).unwrap();
    builder.into_inner().unwrap()
}

/// A tar with a symlink pointing outside the destination.
fn build_symlink_escape_tar() -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Symlink);
    header.set_size(0);
    header.set_mode(0o777);
    builder
        .append_link(&mut header, "link", "../../etc/shadow")
        .unwrap();
    builder.into_inner().unwrap()
}

async fn run_until_settled(h: &Harness, name: &str, max_cycles: usize) -> ImageState {
    let (_tx, shutdown) = watch::channel(false);
    for _ in 0..max_cycles {
        let state = h.catalog.get(name).unwrap().unwrap().state;
        if state.is_terminal() {
            return state;
        }
        h.worker.run_cycle(&shutdown).await;
    }
    h.catalog.get(name).unwrap().unwrap().state
}

#[tokio::test]
async fn test_happy_path_to_active() {
    let server = MockServer::start();
    let archive = build_tar(&[("bin/sh", b"#!/bin/sh\n", 0o755)]);
    let checksum = sha256_hex(&archive);

    server.mock(|when, then| {
        when.method(GET).path("/a.tar");
        then.status(200).body(archive.clone());
    });

    let h = harness();
    h.catalog
        .enqueue("alpine", &server.url("/a.tar"), &checksum)
        .unwrap();

    let state = run_until_settled(&h, "alpine", 10).await;
    assert_eq!(state, ImageState::Active);

    // Blob is present and verified.
    let blob_path = h.layout.blob_path(&checksum);
    assert!(blob_path.exists());
    assert_eq!(sha256_hex(&std::fs::read(&blob_path).unwrap()), checksum);

    // Rootfs was extracted beneath the image root.
    let sh = h.layout.image_root("alpine").join("bin/sh");
    assert_eq!(std::fs::read(&sh).unwrap(), b"#!/bin/sh\n");

    // The active directory is a live mount.
    assert!(h
        .mounter
        .is_mounted(&h.layout.active_dir("alpine"))
        .unwrap());

    // The blob reference was recorded for GC.
    assert!(h.blobs.unused().unwrap().is_empty());
}

#[tokio::test]
async fn test_checksum_mismatch_fails_and_leaves_no_blob() {
    let server = MockServer::start();
    let archive = build_tar(&[("bin/sh", b"#!/bin/sh\n", 0o755)]);

    server.mock(|when, then| {
        when.method(GET).path("/a.tar");
        then.status(200).body(archive.clone());
    });

    let h = harness();
    let wrong = "0".repeat(64);
    h.catalog
        .enqueue("broken", &server.url("/a.tar"), &wrong)
        .unwrap();

    let state = run_until_settled(&h, "broken", 10).await;
    assert_eq!(state, ImageState::Failed);

    let record = h.catalog.get("broken").unwrap().unwrap();
    assert!(record
        .last_error
        .as_deref()
        .unwrap()
        .contains("checksum mismatch"));

    assert!(!h.layout.blob_path(&wrong).exists());
}

#[tokio::test]
async fn test_path_traversal_archive_fails_without_escaping() {
    let server = MockServer::start();
    let archive = build_traversal_tar();
    let checksum = sha256_hex(&archive);

    server.mock(|when, then| {
        when.method(GET).path("/evil.tar");
        then.status(200).body(archive.clone());
    });

    let h = harness();
    h.catalog
        .enqueue("evil", &server.url("/evil.tar"), &checksum)
        .unwrap();

    let state = run_until_settled(&h, "evil", 10).await;
    assert_eq!(state, ImageState::Failed);

    let record = h.catalog.get("evil").unwrap().unwrap();
    assert!(record
        .last_error
        .as_deref()
        .unwrap()
        .contains("path traversal"));

    // Nothing was written outside the image root.
    let images_dir = h.layout.root().join("images");
    assert!(!h.layout.root().join("etc/passwd").exists());
    assert!(!images_dir.join("etc/passwd").exists());
}

#[tokio::test]
async fn test_symlink_escape_archive_fails() {
    let server = MockServer::start();
    let archive = build_symlink_escape_tar();
    let checksum = sha256_hex(&archive);

    server.mock(|when, then| {
        when.method(GET).path("/evil.tar");
        then.status(200).body(archive.clone());
    });

    let h = harness();
    h.catalog
        .enqueue("evil", &server.url("/evil.tar"), &checksum)
        .unwrap();

    let state = run_until_settled(&h, "evil", 10).await;
    assert_eq!(state, ImageState::Failed);

    assert!(!h.layout.image_root("evil").join("link").exists());
}

#[tokio::test]
async fn test_cleanup_reclaims_blob_of_failed_image() {
    let server = MockServer::start();
    let archive = build_traversal_tar();
    let checksum = sha256_hex(&archive);

    server.mock(|when, then| {
        when.method(GET).path("/evil.tar");
        then.status(200).body(archive.clone());
    });

    let h = harness();
    h.catalog
        .enqueue("evil", &server.url("/evil.tar"), &checksum)
        .unwrap();

    // Downloads fine, then fails during extraction; the blob reference was
    // recorded at DOWNLOADED.
    let state = run_until_settled(&h, "evil", 10).await;
    assert_eq!(state, ImageState::Failed);
    assert!(h.layout.blob_path(&checksum).exists());

    assert_eq!(h.blobs.cleanup().unwrap(), 1);
    assert!(!h.layout.blob_path(&checksum).exists());
    assert!(h.blobs.unused().unwrap().is_empty());

    // A second sweep has nothing to do.
    assert_eq!(h.blobs.cleanup().unwrap(), 0);
}

#[tokio::test]
async fn test_two_images_share_one_blob() {
    let server = MockServer::start();
    let archive = build_tar(&[("bin/sh", b"#!/bin/sh\n", 0o755)]);
    let checksum = sha256_hex(&archive);

    server.mock(|when, then| {
        when.method(GET).path("/u1.tar");
        then.status(200).body(archive.clone());
    });
    let u2 = server.mock(|when, then| {
        when.method(GET).path("/u2.tar");
        then.status(200).body(archive.clone());
    });

    let h = harness();
    h.catalog.enqueue("a", &server.url("/u1.tar"), &checksum).unwrap();
    h.catalog.enqueue("b", &server.url("/u2.tar"), &checksum).unwrap();

    assert_eq!(run_until_settled(&h, "a", 10).await, ImageState::Active);
    assert_eq!(run_until_settled(&h, "b", 10).await, ImageState::Active);

    // The second image reused the cached blob instead of refetching.
    u2.assert_hits(0);

    let blobs_dir = h.layout.root().join("blobs");
    let entries: Vec<_> = std::fs::read_dir(&blobs_dir).unwrap().collect();
    assert_eq!(entries.len(), 1);

    // Deleting one image must leave the shared blob in place.
    h.catalog.delete("a").unwrap();
    assert_eq!(h.blobs.cleanup().unwrap(), 0);
    assert!(h.layout.blob_path(&checksum).exists());
}

#[tokio::test]
async fn test_enqueue_wake_makes_progress_without_poll() {
    let server = MockServer::start();
    let archive = build_tar(&[("bin/sh", b"#!/bin/sh\n", 0o755)]);
    let checksum = sha256_hex(&archive);

    server.mock(|when, then| {
        when.method(GET).path("/a.tar");
        then.status(200).body(archive.clone());
    });

    // A poll interval far longer than the test: progress can only come
    // from the wake signal (plus the interval's initial immediate tick).
    let h = harness_with_config(WorkerConfig {
        poll_interval: Duration::from_secs(3600),
        max_fetch_retries: 0,
    });

    let catalog = h.catalog.clone();
    let wake = h.wake.clone();
    let url = server.url("/a.tar");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = h.worker;
    let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    // Let the interval's startup tick drain before enqueueing.
    tokio::time::sleep(Duration::from_millis(100)).await;

    catalog.enqueue("alpine", &url, &checksum).unwrap();
    for _ in 0..10 {
        wake.notify_one();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let state = catalog.get("alpine").unwrap().unwrap().state;
        if state.is_terminal() {
            break;
        }
    }

    let state = catalog.get("alpine").unwrap().unwrap().state;
    assert_eq!(state, ImageState::Active);

    let _ = shutdown_tx.send(true);
    handle.await.unwrap();
}

#[tokio::test]
async fn test_restart_recovery_reextracts_into_dirty_rootfs() {
    let server = MockServer::start();
    let archive = build_tar(&[("bin/sh", b"#!/bin/sh\n", 0o755)]);
    let checksum = sha256_hex(&archive);

    server.mock(|when, then| {
        when.method(GET).path("/a.tar");
        then.status(200).body(archive.clone());
    });

    let h = harness();
    h.catalog
        .enqueue("alpine", &server.url("/a.tar"), &checksum)
        .unwrap();

    // Simulate a crash mid-UNPACKING: stale debris in the image root and
    // the row parked in the in-flight state.
    let (_tx, shutdown) = watch::channel(false);
    for _ in 0..3 {
        h.worker.run_cycle(&shutdown).await;
    }
    let record = h.catalog.get("alpine").unwrap().unwrap();
    assert_eq!(record.state, ImageState::Unpacking);

    let rootfs = h.layout.image_root("alpine");
    std::fs::create_dir_all(&rootfs).unwrap();
    std::fs::write(rootfs.join("stale"), b"leftover").unwrap();

    let state = run_until_settled(&h, "alpine", 10).await;
    assert_eq!(state, ImageState::Active);

    // The image root was rebuilt from scratch.
    assert!(!rootfs.join("stale").exists());
    assert!(rootfs.join("bin/sh").exists());
}
