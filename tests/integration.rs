// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration Tests for Mirror Engine
//!
//! Everything runs in-process against [`MemorySource`] and a recording sink;
//! no external services are required.
//!
//! # Running Tests
//! ```bash
//! cargo test --test integration
//!
//! # Run specific group
//! cargo test --test integration init_
//! ```
//!
//! # Test Organization
//! - `init_*` - Snapshot paging, bounds and resume
//! - `delta_*` - Change feed batching, row markers and held batches
//! - `engine_*` - Full lifecycle through `MirrorEngine`

mod common;

use common::{item, items, row_ids, row_markers, wait_until, Harness, MockSink};
use mirror_engine::checkpoint::InitStatus;
use mirror_engine::config::{CollectionSelector, MirrorConfig};
use mirror_engine::coordinator::{run_delta_sync, run_init_sync, CollectionOutcome, EngineState, MirrorEngine};
use mirror_engine::source::ResumeToken;
use mirror_engine::value::{DocKey, Document};
use mirror_engine::writer::{data_file_name, CONVERSION_LOG_FILE, METADATA_FILE};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// Init Sync Tests
// =============================================================================

#[tokio::test]
async fn init_pages_collection_up_to_bound() {
    let harness = Harness::new();
    harness.source.seed("orders", items(1..=250)).await;
    let ctx = harness.context("orders").await;

    let (status_tx, status_rx) = watch::channel(InitStatus::NotStarted);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let report = run_init_sync(&ctx, &status_tx, &shutdown_rx).await.unwrap();

    assert_eq!(report.pages, 3);
    assert_eq!(report.documents, 250);
    assert!(!report.interrupted);
    assert_eq!(*status_rx.borrow(), InitStatus::Complete);

    let files = harness.sink.data_files("orders");
    let names: Vec<_> = files.iter().map(|f| f.file_name.clone()).collect();
    assert_eq!(names, vec![data_file_name(1), data_file_name(2), data_file_name(3)]);
    assert_eq!(row_ids(&files[0].content), (1..=100).collect::<Vec<_>>());
    assert_eq!(row_ids(&files[2].content), (201..=250).collect::<Vec<_>>());
    assert!(row_markers(&files[1].content).iter().all(|&m| m == 0));

    let checkpoints = harness.checkpoints();
    assert_eq!(checkpoints.init_status("orders").await.unwrap(), InitStatus::Complete);
    assert_eq!(checkpoints.init_last_key("orders").await.unwrap(), None);
    assert_eq!(checkpoints.init_upper_bound("orders").await.unwrap(), Some(DocKey::Int(250)));
    assert_eq!(checkpoints.output_seq("orders").await.unwrap(), 4);
}

#[tokio::test]
async fn init_resumes_after_last_key_within_bound() {
    let harness = Harness::new();
    harness.source.seed("orders", items(1..=300)).await;
    let ctx = harness.context("orders").await;
    let sampled = harness.source.page_requests().await.len();

    // A previous run pushed the first page and captured 250 as its bound.
    let checkpoints = harness.checkpoints();
    checkpoints.set_init_status("orders", InitStatus::InProgress).await.unwrap();
    checkpoints.set_init_upper_bound("orders", &DocKey::Int(250)).await.unwrap();
    checkpoints.set_init_last_key("orders", &DocKey::Int(100)).await.unwrap();
    checkpoints.set_output_seq("orders", 2).await.unwrap();

    let (status_tx, _status_rx) = watch::channel(InitStatus::InProgress);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let report = run_init_sync(&ctx, &status_tx, &shutdown_rx).await.unwrap();

    assert_eq!(report.resumed_after, Some(DocKey::Int(100)));
    assert_eq!(report.documents, 150);

    let requests = harness.source.page_requests().await.split_off(sampled);
    assert_eq!(requests[0].after, Some(DocKey::Int(100)));
    assert!(requests.iter().all(|r| r.upper == DocKey::Int(250)));

    let files = harness.sink.data_files("orders");
    assert_eq!(files[0].file_name, data_file_name(2));
    let ids: Vec<i64> = files.iter().flat_map(|f| row_ids(&f.content)).collect();
    assert_eq!(ids, (101..=250).collect::<Vec<_>>());
}

#[tokio::test]
async fn init_restart_after_complete_reads_nothing() {
    let harness = Harness::new();
    harness.source.seed("orders", items(1..=10)).await;
    let ctx = harness.context("orders").await;
    let sampled = harness.source.page_requests().await.len();
    harness
        .checkpoints()
        .set_init_status("orders", InitStatus::Complete)
        .await
        .unwrap();

    let (status_tx, status_rx) = watch::channel(InitStatus::NotStarted);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let report = run_init_sync(&ctx, &status_tx, &shutdown_rx).await.unwrap();

    assert!(report.already_complete);
    assert_eq!(*status_rx.borrow(), InitStatus::Complete);
    assert_eq!(harness.source.page_requests().await.len(), sampled);
    assert!(harness.sink.pushes().is_empty());
}

#[tokio::test]
async fn init_empty_collection_completes_without_files() {
    let harness = Harness::new();
    harness.source.create_collection("empty").await;
    let ctx = harness.context("empty").await;

    let (status_tx, _status_rx) = watch::channel(InitStatus::NotStarted);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let report = run_init_sync(&ctx, &status_tx, &shutdown_rx).await.unwrap();

    assert_eq!(report.pages, 0);
    assert!(harness.sink.pushes().is_empty());
    assert_eq!(
        harness.checkpoints().init_status("empty").await.unwrap(),
        InitStatus::Complete
    );
}

#[tokio::test]
async fn init_stops_between_pages_on_shutdown() {
    let harness = Harness::new();
    harness.source.seed("orders", items(1..=250)).await;
    let ctx = harness.context("orders").await;

    let (status_tx, _status_rx) = watch::channel(InitStatus::NotStarted);
    let (_shutdown_tx, shutdown_rx) = watch::channel(true);
    let report = run_init_sync(&ctx, &status_tx, &shutdown_rx).await.unwrap();

    assert!(report.interrupted);
    assert_eq!(report.pages, 0);
    assert_eq!(
        harness.checkpoints().init_status("orders").await.unwrap(),
        InitStatus::InProgress
    );
    // The bound is kept so the next run resumes against the same range.
    assert_eq!(
        harness.checkpoints().init_upper_bound("orders").await.unwrap(),
        Some(DocKey::Int(250))
    );
}

// =============================================================================
// Delta Sync Tests
// =============================================================================

/// Insert an anchor document and persist its token so the feed opens at a
/// known position.
async fn anchor_feed(harness: &Harness, collection: &str) -> ResumeToken {
    let token = harness.source.insert(collection, item(0)).await;
    harness
        .checkpoints()
        .set_resume_token(collection, &token)
        .await
        .unwrap();
    token
}

#[tokio::test]
async fn delta_flushes_on_batch_size() {
    let mut harness = Harness::new();
    harness.delta.flush_interval = "60s".to_string();
    harness.source.create_collection("events").await;
    anchor_feed(&harness, "events").await;
    harness
        .checkpoints()
        .set_init_status("events", InitStatus::Complete)
        .await
        .unwrap();
    let ctx = harness.context("events").await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(run_delta_sync(Arc::clone(&ctx), shutdown_rx));

    harness.source.insert("events", item(1)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(harness.sink.data_files("events").is_empty(), "one row must not flush");

    let second = harness.source.insert("events", item(2)).await;
    assert!(wait_until(WAIT, || harness.sink.data_files("events").len() == 1).await);

    let file = &harness.sink.data_files("events")[0];
    assert_eq!(file.file_name, data_file_name(1));
    assert_eq!(row_ids(&file.content), vec![1, 2]);
    assert_eq!(row_markers(&file.content), vec![0, 0]);

    let checkpoints = harness.checkpoints();
    let mut persisted = None;
    for _ in 0..100 {
        persisted = checkpoints.resume_token("events").await.unwrap();
        if persisted.as_ref() == Some(&second) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(persisted, Some(second));
    assert_eq!(checkpoints.output_seq("events").await.unwrap(), 2);

    shutdown_tx.send(true).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn delta_flushes_on_age_after_init() {
    let harness = Harness::new();
    harness.source.create_collection("events").await;
    anchor_feed(&harness, "events").await;
    harness
        .checkpoints()
        .set_init_status("events", InitStatus::Complete)
        .await
        .unwrap();
    let ctx = harness.context("events").await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(run_delta_sync(Arc::clone(&ctx), shutdown_rx));

    harness.source.insert("events", item(1)).await;
    assert!(wait_until(WAIT, || harness.sink.data_files("events").len() == 1).await);
    assert_eq!(row_ids(&harness.sink.data_files("events")[0].content), vec![1]);

    shutdown_tx.send(true).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn delta_marks_deletes_and_skips_unsupported_events() {
    let harness = Harness::new();
    harness.source.seed("events", items(1..=3)).await;
    anchor_feed(&harness, "events").await;
    harness
        .checkpoints()
        .set_init_status("events", InitStatus::Complete)
        .await
        .unwrap();
    let ctx = harness.context("events").await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(run_delta_sync(Arc::clone(&ctx), shutdown_rx));

    harness
        .source
        .emit("events", "invalidate", Document::new(), None)
        .await;
    harness.source.update("events", item(2).with("qty", 99)).await;
    harness.source.delete("events", &DocKey::Int(3)).await;
    assert!(wait_until(WAIT, || harness.sink.data_files("events").len() == 1).await);

    let file = &harness.sink.data_files("events")[0];
    assert_eq!(row_ids(&file.content), vec![2, 3]);
    assert_eq!(row_markers(&file.content), vec![1, 2]);

    shutdown_tx.send(true).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn delta_holds_batches_during_init_and_promotes_in_order() {
    let harness = Harness::new();
    harness.source.seed("orders", items(1..=5)).await;
    anchor_feed(&harness, "orders").await;
    let ctx = harness.context("orders").await;

    // Keep the snapshot from reading its first page.
    harness.source.hold_pages();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(run_delta_sync(Arc::clone(&ctx), shutdown_rx));

    let checkpoints = harness.checkpoints();
    for _ in 0..200 {
        if checkpoints.init_upper_bound("orders").await.unwrap().is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(checkpoints.init_upper_bound("orders").await.unwrap(), Some(DocKey::Int(5)));

    // Changes made while the snapshot runs.
    harness.source.insert("orders", item(6)).await;
    harness.source.update("orders", item(2).with("qty", 7)).await;
    for _ in 0..200 {
        if ctx.writer.held_count().await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(ctx.writer.held_count().await, 1);
    assert!(harness.sink.data_files("orders").is_empty(), "held batches are not pushed");

    harness.source.release_pages();
    assert!(wait_until(WAIT, || harness.sink.data_files("orders").len() == 2).await);

    // After the snapshot, inserts are plain inserts again.
    harness.source.insert("orders", item(7)).await;
    harness.source.insert("orders", item(8)).await;
    assert!(wait_until(WAIT, || harness.sink.data_files("orders").len() == 3).await);

    let files = harness.sink.data_files("orders");
    let names: Vec<_> = files.iter().map(|f| f.file_name.clone()).collect();
    assert_eq!(names, vec![data_file_name(1), data_file_name(2), data_file_name(3)]);

    assert_eq!(row_ids(&files[0].content), vec![0, 1, 2, 3, 4, 5]);
    assert!(row_markers(&files[0].content).iter().all(|&m| m == 0));
    assert_eq!(row_ids(&files[1].content), vec![6, 2]);
    assert_eq!(row_markers(&files[1].content), vec![4, 1]);
    assert_eq!(row_ids(&files[2].content), vec![7, 8]);
    assert_eq!(row_markers(&files[2].content), vec![0, 0]);
    assert_eq!(ctx.writer.held_count().await, 0);

    shutdown_tx.send(true).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn delta_pushes_pending_rows_on_shutdown_after_init() {
    let mut harness = Harness::new();
    harness.delta.flush_interval = "60s".to_string();
    harness.source.create_collection("events").await;
    anchor_feed(&harness, "events").await;
    harness
        .checkpoints()
        .set_init_status("events", InitStatus::Complete)
        .await
        .unwrap();
    let ctx = harness.context("events").await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(run_delta_sync(Arc::clone(&ctx), shutdown_rx));

    let token = harness.source.insert("events", item(1)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(harness.sink.data_files("events").is_empty());

    shutdown_tx.send(true).unwrap();
    task.await.unwrap().unwrap();

    let files = harness.sink.data_files("events");
    assert_eq!(files.len(), 1);
    assert_eq!(row_ids(&files[0].content), vec![1]);
    assert_eq!(harness.checkpoints().resume_token("events").await.unwrap(), Some(token));
}

#[tokio::test]
async fn delta_conversion_failures_push_log() {
    let harness = Harness::new();
    harness.source.seed("orders", items(1..=3)).await;
    anchor_feed(&harness, "orders").await;
    harness
        .checkpoints()
        .set_init_status("orders", InitStatus::Complete)
        .await
        .unwrap();
    let ctx = harness.context("orders").await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(run_delta_sync(Arc::clone(&ctx), shutdown_rx));

    harness.source.insert("orders", item(10).with("qty", "lots")).await;
    harness.source.insert("orders", item(11)).await;
    assert!(wait_until(WAIT, || harness.sink.latest("orders", CONVERSION_LOG_FILE).is_some()).await);

    let log = String::from_utf8(harness.sink.latest("orders", CONVERSION_LOG_FILE).unwrap()).unwrap();
    assert!(log.contains("qty"));
    assert!(log.contains("lots"));

    shutdown_tx.send(true).unwrap();
    task.await.unwrap().unwrap();
}

// =============================================================================
// Engine Tests
// =============================================================================

fn engine_config(dir: &std::path::Path) -> MirrorConfig {
    let mut config = MirrorConfig::for_testing();
    config.source.collections = CollectionSelector::Named(vec!["orders".to_string()]);
    config.output.local_dir = dir.join("staging");
    config
}

#[tokio::test]
async fn engine_mirrors_snapshot_then_changes() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(mirror_engine::MemorySource::new());
    source.seed("orders", items(1..=3)).await;
    let sink = Arc::new(MockSink::new());
    let store = Arc::new(mirror_engine::MemoryStateStore::new());

    let mut engine = MirrorEngine::new(engine_config(dir.path()), Arc::clone(&source), sink.clone())
        .with_state_store(store.clone());
    engine.start().await.unwrap();
    assert_eq!(engine.state(), EngineState::Running);

    assert!(wait_until(WAIT, || sink.data_files("orders").len() == 1).await);
    let names = sink.file_names("orders");
    assert_eq!(names[0], METADATA_FILE);
    assert_eq!(names[1], data_file_name(1));
    assert_eq!(sink.latest("orders", METADATA_FILE).unwrap(), br#"{"keyColumns":["_id"]}"#.to_vec());

    // Let the delta loop observe the completed snapshot before new changes.
    let checkpoints = engine.checkpoints().unwrap().clone();
    for _ in 0..200 {
        if checkpoints.init_status("orders").await.unwrap() == InitStatus::Complete {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The feed was open before the snapshot started.
    source.insert("orders", item(4)).await;
    source.insert("orders", item(5)).await;
    assert!(wait_until(WAIT, || sink.data_files("orders").len() == 2).await);
    let delta = &sink.data_files("orders")[1];
    assert_eq!(delta.file_name, data_file_name(2));
    assert_eq!(row_ids(&delta.content), vec![4, 5]);
    assert_eq!(row_markers(&delta.content), vec![0, 0]);

    engine.shutdown().await;
    assert_eq!(engine.state(), EngineState::Stopped);
    assert_eq!(engine.outcomes().await.get("orders"), Some(&CollectionOutcome::Stopped));

    // Restart over the same checkpoints: no second metadata push, no re-snapshot.
    let mut restarted = MirrorEngine::new(engine_config(dir.path()), Arc::clone(&source), sink.clone())
        .with_state_store(store);
    restarted.start().await.unwrap();
    source.insert("orders", item(6)).await;
    source.insert("orders", item(7)).await;
    assert!(wait_until(WAIT, || sink.data_files("orders").len() == 3).await);
    restarted.shutdown().await;

    let names = sink.file_names("orders");
    assert_eq!(names.iter().filter(|n| *n == METADATA_FILE).count(), 1);
    let files = sink.data_files("orders");
    assert_eq!(files[2].file_name, data_file_name(3));
    assert_eq!(row_ids(&files[2].content), vec![6, 7]);
}

#[tokio::test]
async fn engine_custom_metadata_file_is_pushed() {
    let dir = tempfile::tempdir().unwrap();
    let metadata_path = dir.path().join("meta.json");
    std::fs::write(&metadata_path, br#"{"keyColumns":["_id","region"]}"#).unwrap();

    let mut config = engine_config(dir.path());
    config.output.metadata_file = Some(metadata_path);
    let source = Arc::new(mirror_engine::MemorySource::new());
    source.create_collection("orders").await;
    let sink = Arc::new(MockSink::new());

    let mut engine = MirrorEngine::new(config, source, sink.clone());
    engine.start().await.unwrap();
    engine.shutdown().await;

    assert_eq!(
        sink.latest("orders", METADATA_FILE).unwrap(),
        br#"{"keyColumns":["_id","region"]}"#.to_vec()
    );
}

#[tokio::test]
async fn engine_lands_files_in_local_directory() {
    let dir = tempfile::tempdir().unwrap();
    let landing = dir.path().join("landing");
    let source = Arc::new(mirror_engine::MemorySource::new());
    source.seed("orders", items(1..=3)).await;

    let config = engine_config(dir.path());
    let staging = config.output.local_dir.join("orders");
    let sink = Arc::new(mirror_engine::LocalDirSink::new(&landing));
    let mut engine = MirrorEngine::new(config, source, sink.clone());
    engine.start().await.unwrap();

    let first = sink.collection_dir("orders").join(data_file_name(1));
    assert!(wait_until(WAIT, || first.exists()).await);
    engine.shutdown().await;

    assert!(sink.collection_dir("orders").join(METADATA_FILE).exists());
    let content = std::fs::read(&first).unwrap();
    assert_eq!(row_ids(&content), vec![1, 2, 3]);
    // Staged copies are removed once pushed.
    assert!(!staging.join(data_file_name(1)).exists());
}
