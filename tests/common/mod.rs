//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - A recording sink ([`MockSink`]) with injectable push failures
//! - A checkpoint store wrapper ([`FlakyStore`]) that fails chosen writes
//! - A [`Harness`] that wires a collection's context the way the engine does

#![allow(dead_code)] // Each test binary uses a different subset

use mirror_engine::checkpoint::{Checkpoints, MemoryStateStore, StateStore};
use mirror_engine::config::{DeltaSyncConfig, InitSyncConfig};
use mirror_engine::coordinator::CollectionContext;
use mirror_engine::error::{BoxFuture, MirrorError};
use mirror_engine::normalize::Normalizer;
use mirror_engine::resilience::RetryConfig;
use mirror_engine::schema::SchemaRegistry;
use mirror_engine::sink::SinkRef;
use mirror_engine::source::MemorySource;
use mirror_engine::value::Document;
use mirror_engine::writer::{CollectionWriter, WriterOptions};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

// =============================================================================
// MockSink
// =============================================================================

/// A recorded push() call.
#[derive(Debug, Clone)]
pub struct PushCall {
    pub collection: String,
    pub file_name: String,
    /// File content at push time.
    pub content: Vec<u8>,
}

/// Sink that records every push, in order.
///
/// # Example
/// ```rust,ignore
/// let sink = MockSink::new();
/// sink.fail_next(2); // next two pushes fail (transient)
///
/// // Use in tests...
///
/// assert_eq!(sink.file_names("orders"), vec!["_metadata.json", "00000000000000000001.parquet"]);
/// ```
#[derive(Default)]
pub struct MockSink {
    pushes: Mutex<Vec<PushCall>>,
    fail_next: AtomicUsize,
    attempts: AtomicUsize,
}

impl MockSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` pushes fail.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Push attempts, including failed ones.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn pushes(&self) -> Vec<PushCall> {
        self.pushes.lock().unwrap().clone()
    }

    /// Names of the files pushed for `collection`, in push order.
    pub fn file_names(&self, collection: &str) -> Vec<String> {
        self.pushes
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.collection == collection)
            .map(|p| p.file_name.clone())
            .collect()
    }

    /// Data files pushed for `collection`, in push order.
    pub fn data_files(&self, collection: &str) -> Vec<PushCall> {
        self.pushes
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.collection == collection && p.file_name.ends_with(".parquet"))
            .cloned()
            .collect()
    }

    /// Latest content pushed under `file_name`.
    pub fn latest(&self, collection: &str, file_name: &str) -> Option<Vec<u8>> {
        self.pushes
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|p| p.collection == collection && p.file_name == file_name)
            .map(|p| p.content.clone())
    }
}

impl SinkRef for MockSink {
    fn push<'a>(&'a self, local_file: &'a Path, collection: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let file_name = local_file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            let injected = self
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            if injected.is_ok() {
                return Err(MirrorError::Sink {
                    file: file_name,
                    message: "injected upload failure".into(),
                });
            }

            let content = tokio::fs::read(local_file)
                .await
                .map_err(|e| MirrorError::io(local_file, e))?;
            self.pushes.lock().unwrap().push(PushCall {
                collection: collection.to_string(),
                file_name,
                content,
            });
            Ok(())
        })
    }
}

// =============================================================================
// FlakyStore
// =============================================================================

/// In-memory state store that fails chosen `set` calls.
///
/// Simulates a crash window: the write before the failure is durable, the
/// failing one never happened.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStateStore,
    /// key -> remaining failures
    failures: Mutex<HashMap<String, usize>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` writes of `key` (any collection).
    pub fn fail_sets(&self, key: &str, n: usize) {
        self.failures.lock().unwrap().insert(key.to_string(), n);
    }
}

impl StateStore for FlakyStore {
    fn get<'a>(&'a self, collection: &'a str, key: &'a str) -> BoxFuture<'a, Option<Vec<u8>>> {
        self.inner.get(collection, key)
    }

    fn set<'a>(&'a self, collection: &'a str, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, ()> {
        let fail = {
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(key) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    true
                }
                _ => false,
            }
        };
        if fail {
            let key = key.to_string();
            return Box::pin(async move { Err(MirrorError::Internal(format!("injected crash writing {}", key))) });
        }
        self.inner.set(collection, key, value)
    }

    fn delete<'a>(&'a self, collection: &'a str, key: &'a str) -> BoxFuture<'a, ()> {
        self.inner.delete(collection, key)
    }
}

// =============================================================================
// Document helpers
// =============================================================================

/// `{_id: id, name: "item-<id>", qty: id * 10}`
pub fn item(id: i64) -> Document {
    Document::new()
        .with("_id", id)
        .with("name", format!("item-{}", id))
        .with("qty", id * 10)
}

pub fn items(ids: std::ops::RangeInclusive<i64>) -> Vec<Document> {
    ids.map(item).collect()
}

// =============================================================================
// Harness
// =============================================================================

/// One source, one sink and one checkpoint store, shared by every context
/// built from it. Rebuilding a context over the same store simulates a
/// process restart.
pub struct Harness {
    pub dir: TempDir,
    pub source: Arc<MemorySource>,
    pub sink: Arc<MockSink>,
    pub store: Arc<dyn StateStore>,
    pub init: InitSyncConfig,
    pub delta: DeltaSyncConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryStateStore::new()))
    }

    pub fn with_store(store: Arc<dyn StateStore>) -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            source: Arc::new(MemorySource::new()),
            sink: Arc::new(MockSink::new()),
            store,
            init: InitSyncConfig {
                batch_size: 100,
                sample_size: 100,
            },
            delta: DeltaSyncConfig {
                batch_size: 2,
                flush_interval: "50ms".to_string(),
                poll_interval: "10ms".to_string(),
            },
        }
    }

    pub fn checkpoints(&self) -> Checkpoints {
        Checkpoints::new(Arc::clone(&self.store))
    }

    /// Bootstrap the schema and open a writer, as engine start does.
    pub async fn context(&self, collection: &str) -> Arc<CollectionContext<MemorySource>> {
        let checkpoints = self.checkpoints();
        let registry = Arc::new(SchemaRegistry::new(checkpoints.clone()));
        registry
            .bootstrap(
                collection,
                self.source.as_ref(),
                self.init.sample_size,
                &RetryConfig::testing(),
            )
            .await
            .unwrap();

        let mut options = WriterOptions::new(self.dir.path().join("staging"));
        options.retry = RetryConfig::testing();
        let sink: Arc<dyn SinkRef> = self.sink.clone();
        let writer = CollectionWriter::open(collection, options, checkpoints.clone(), Arc::clone(&registry), sink)
            .await
            .unwrap();

        Arc::new(CollectionContext {
            collection: collection.to_string(),
            source: Arc::clone(&self.source),
            checkpoints,
            normalizer: Arc::new(Normalizer::new(registry)),
            writer: Arc::new(writer),
            init: self.init.clone(),
            delta: self.delta.clone(),
            retry: RetryConfig::testing(),
        })
    }
}

// =============================================================================
// Parquet helpers
// =============================================================================

/// Decode a pushed data file into one record batch per row group.
pub fn read_parquet(content: &[u8]) -> Vec<arrow::record_batch::RecordBatch> {
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    let bytes = bytes::Bytes::copy_from_slice(content);
    ParquetRecordBatchReaderBuilder::try_new(bytes)
        .unwrap()
        .build()
        .unwrap()
        .map(|b| b.unwrap())
        .collect()
}

/// `__rowMarker__` values of a pushed data file.
pub fn row_markers(content: &[u8]) -> Vec<i32> {
    use arrow::array::{Array, Int32Array};

    read_parquet(content)
        .iter()
        .flat_map(|batch| {
            let column = batch
                .column_by_name("__rowMarker__")
                .unwrap()
                .as_any()
                .downcast_ref::<Int32Array>()
                .unwrap()
                .clone();
            (0..column.len()).map(move |i| column.value(i)).collect::<Vec<_>>()
        })
        .collect()
}

/// Integer `_id` values of a pushed data file.
pub fn row_ids(content: &[u8]) -> Vec<i64> {
    use arrow::array::{Array, Int64Array};

    read_parquet(content)
        .iter()
        .flat_map(|batch| {
            let column = batch
                .column_by_name("_id")
                .unwrap()
                .as_any()
                .downcast_ref::<Int64Array>()
                .unwrap()
                .clone();
            (0..column.len()).map(move |i| column.value(i)).collect::<Vec<_>>()
        })
        .collect()
}

/// Poll until `check` holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: std::time::Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    check()
}
