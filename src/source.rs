// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Source database integration traits.
//!
//! Defines what the engines need from the document database: collection
//! listing, key-ordered snapshot paging, the maximum ordering key, and a
//! resumable change feed. The embedding process supplies a driver-backed
//! implementation; [`MemorySource`] is a process-local implementation used
//! for tests and local runs.
//!
//! # Example
//!
//! ```rust,no_run
//! use mirror_engine::source::{ChangeFeed, ResumeToken, SourceRef};
//! use mirror_engine::value::{DocKey, Document};
//! use mirror_engine::error::BoxFuture;
//!
//! struct MyDriver { /* ... */ }
//!
//! impl SourceRef for MyDriver {
//!     fn list_collections(&self) -> BoxFuture<'_, Vec<String>> {
//!         Box::pin(async move { Ok(vec!["orders".to_string()]) })
//!     }
//!
//!     fn count<'a>(&'a self, _collection: &'a str) -> BoxFuture<'a, u64> {
//!         Box::pin(async move { Ok(0) })
//!     }
//!
//!     fn find_page<'a>(
//!         &'a self,
//!         _collection: &'a str,
//!         _after: Option<&'a DocKey>,
//!         _upper: &'a DocKey,
//!         _limit: usize,
//!     ) -> BoxFuture<'a, Vec<Document>> {
//!         Box::pin(async move { Ok(vec![]) })
//!     }
//!
//!     fn max_key<'a>(&'a self, _collection: &'a str) -> BoxFuture<'a, Option<DocKey>> {
//!         Box::pin(async move { Ok(None) })
//!     }
//!
//!     fn watch<'a>(
//!         &'a self,
//!         _collection: &'a str,
//!         _resume_after: Option<ResumeToken>,
//!     ) -> BoxFuture<'a, Box<dyn ChangeFeed>> {
//!         unimplemented!()
//!     }
//! }
//! ```

use crate::error::{BoxFuture, MirrorError, Result};
use crate::value::{DocKey, Document, ID_FIELD};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify, RwLock};
use tracing::debug;

/// Token of the position before a collection's first change. Generated
/// tokens start at 1, so it never names an event.
const HISTORY_START: &str = "0000000000000000";

/// Opaque position in a change feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeToken(String);

impl ResumeToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One change feed event.
///
/// `operation` is the feed's raw operation name; the delta engine decides
/// which ones it supports.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub resume_token: ResumeToken,
    pub operation: String,
    /// Key-only document (`{_id: ...}`).
    pub document_key: Document,
    /// Present for inserts and (usually) updates.
    pub full_document: Option<Document>,
}

/// An open, ordered change feed for one collection.
pub trait ChangeFeed: Send {
    /// Wait up to `wait` for the next event.
    ///
    /// `Ok(None)` means no event arrived in time; the feed stays open.
    /// A fatal error means the feed cannot be resumed and must be reopened
    /// by a restart.
    fn next_event(&mut self, wait: Duration) -> BoxFuture<'_, Option<ChangeEvent>>;

    /// Token the feed can be reopened from to continue exactly here: the
    /// last returned event's token, or the opening position before any
    /// event was returned. `None` if the driver cannot report one.
    fn position(&self) -> Option<ResumeToken>;
}

/// Trait defining what the engines need from the source database.
pub trait SourceRef: Send + Sync + 'static {
    /// Names of all collections in the configured database.
    ///
    /// Fails (fatally) if the database itself does not exist.
    fn list_collections(&self) -> BoxFuture<'_, Vec<String>>;

    /// Document count, for progress reporting.
    fn count<'a>(&'a self, collection: &'a str) -> BoxFuture<'a, u64>;

    /// Next page in ascending key order: keys in `(after, upper]`, at most
    /// `limit` documents.
    fn find_page<'a>(
        &'a self,
        collection: &'a str,
        after: Option<&'a DocKey>,
        upper: &'a DocKey,
        limit: usize,
    ) -> BoxFuture<'a, Vec<Document>>;

    /// Largest ordering key currently in the collection.
    fn max_key<'a>(&'a self, collection: &'a str) -> BoxFuture<'a, Option<DocKey>>;

    /// Open a change feed positioned after `resume_after`, or at "now" when
    /// absent.
    fn watch<'a>(
        &'a self,
        collection: &'a str,
        resume_after: Option<ResumeToken>,
    ) -> BoxFuture<'a, Box<dyn ChangeFeed>>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// MemorySource
// ═══════════════════════════════════════════════════════════════════════════════

/// A recorded `find_page` call.
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    pub collection: String,
    pub after: Option<DocKey>,
    pub upper: DocKey,
    pub limit: usize,
}

#[derive(Default)]
struct Shared {
    database_exists: bool,
    collections: RwLock<HashMap<String, BTreeMap<DocKey, Document>>>,
    /// Per-collection change history, in delivery order.
    history: RwLock<HashMap<String, Vec<ChangeEvent>>>,
    notify: Notify,
    next_token: AtomicU64,
    page_failures: AtomicUsize,
    feeds_broken: AtomicBool,
    page_requests: RwLock<Vec<PageRequest>>,
}

/// In-process source with a key-ordered snapshot and a change history.
///
/// Emitting a change applies it to the snapshot and appends it to the
/// collection's history, so feeds and pages observe a consistent database.
/// Cloning shares the same database.
#[derive(Clone)]
pub struct MemorySource {
    shared: Arc<Shared>,
    /// `true` holds every `find_page` call until released.
    page_gate: watch::Sender<bool>,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySource {
    pub fn new() -> Self {
        let (page_gate, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                database_exists: true,
                ..Default::default()
            }),
            page_gate,
        }
    }

    /// A source whose configured database does not exist.
    pub fn missing_database() -> Self {
        let (page_gate, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared::default()),
            page_gate,
        }
    }

    pub async fn create_collection(&self, collection: &str) {
        self.shared
            .collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default();
    }

    /// Load documents into the snapshot without producing change events.
    pub async fn seed(&self, collection: &str, docs: impl IntoIterator<Item = Document>) {
        let mut collections = self.shared.collections.write().await;
        let table = collections.entry(collection.to_string()).or_default();
        for doc in docs {
            if let Some(key) = doc.key() {
                table.insert(key, doc);
            }
        }
    }

    /// Insert a document and emit an `insert` event.
    pub async fn insert(&self, collection: &str, doc: Document) -> ResumeToken {
        let key_doc = key_document(&doc);
        self.emit(collection, "insert", key_doc, Some(doc)).await
    }

    /// Replace a document and emit an `update` event carrying it.
    pub async fn update(&self, collection: &str, doc: Document) -> ResumeToken {
        let key_doc = key_document(&doc);
        self.emit(collection, "update", key_doc, Some(doc)).await
    }

    /// Remove a document and emit a key-only `delete` event.
    pub async fn delete(&self, collection: &str, key: &DocKey) -> ResumeToken {
        let key_doc = Document::new().with(ID_FIELD, key.to_value());
        self.emit(collection, "delete", key_doc, None).await
    }

    /// Append an arbitrary event to the history.
    ///
    /// `insert`/`update`/`replace` with a full document and `delete` are
    /// applied to the snapshot; anything else only reaches the feed.
    pub async fn emit(
        &self,
        collection: &str,
        operation: &str,
        document_key: Document,
        full_document: Option<Document>,
    ) -> ResumeToken {
        let seq = self.shared.next_token.fetch_add(1, Ordering::SeqCst) + 1;
        let token = ResumeToken::new(format!("{:016x}", seq));

        {
            let mut collections = self.shared.collections.write().await;
            let table = collections.entry(collection.to_string()).or_default();
            match (operation, &full_document) {
                ("insert" | "update" | "replace", Some(doc)) => {
                    if let Some(key) = doc.key() {
                        table.insert(key, doc.clone());
                    }
                }
                ("delete", _) => {
                    if let Some(key) = document_key.key() {
                        table.remove(&key);
                    }
                }
                _ => {}
            }
        }

        self.shared
            .history
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .push(ChangeEvent {
                resume_token: token.clone(),
                operation: operation.to_string(),
                document_key,
                full_document,
            });
        self.shared.notify.notify_waiters();
        token
    }

    /// Make the next `n` page fetches fail with a transient error.
    pub fn fail_next_pages(&self, n: usize) {
        self.shared.page_failures.store(n, Ordering::SeqCst);
    }

    /// Make every open and future feed fail fatally.
    pub fn break_feeds(&self) {
        self.shared.feeds_broken.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }

    /// Hold all page fetches until [`release_pages`](Self::release_pages).
    pub fn hold_pages(&self) {
        self.page_gate.send_replace(true);
    }

    pub fn release_pages(&self) {
        self.page_gate.send_replace(false);
    }

    /// All `find_page` calls received so far.
    pub async fn page_requests(&self) -> Vec<PageRequest> {
        self.shared.page_requests.read().await.clone()
    }

    pub async fn document_count(&self, collection: &str) -> usize {
        self.shared
            .collections
            .read()
            .await
            .get(collection)
            .map_or(0, |t| t.len())
    }

    async fn require_collection(&self, operation: &str, collection: &str) -> Result<()> {
        if !self.shared.database_exists {
            return Err(MirrorError::source_fatal(operation, "database does not exist"));
        }
        if !self.shared.collections.read().await.contains_key(collection) {
            return Err(MirrorError::CollectionNotFound(collection.to_string()));
        }
        Ok(())
    }
}

fn key_document(doc: &Document) -> Document {
    match doc.get(ID_FIELD) {
        Some(id) => Document::new().with(ID_FIELD, id.clone()),
        None => Document::new(),
    }
}

impl SourceRef for MemorySource {
    fn list_collections(&self) -> BoxFuture<'_, Vec<String>> {
        Box::pin(async move {
            if !self.shared.database_exists {
                return Err(MirrorError::source_fatal("list_collections", "database does not exist"));
            }
            let mut names: Vec<String> = self.shared.collections.read().await.keys().cloned().collect();
            names.sort();
            Ok(names)
        })
    }

    fn count<'a>(&'a self, collection: &'a str) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            self.require_collection("count", collection).await?;
            Ok(self.document_count(collection).await as u64)
        })
    }

    fn find_page<'a>(
        &'a self,
        collection: &'a str,
        after: Option<&'a DocKey>,
        upper: &'a DocKey,
        limit: usize,
    ) -> BoxFuture<'a, Vec<Document>> {
        Box::pin(async move {
            let mut gate = self.page_gate.subscribe();
            if gate.wait_for(|held| !*held).await.is_err() {
                return Err(MirrorError::Internal("page gate closed".to_string()));
            }

            self.shared.page_requests.write().await.push(PageRequest {
                collection: collection.to_string(),
                after: after.cloned(),
                upper: upper.clone(),
                limit,
            });

            let injected = self
                .shared
                .page_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            if injected.is_ok() {
                return Err(MirrorError::source_transient("find_page", "injected timeout"));
            }

            self.require_collection("find_page", collection).await?;
            let collections = self.shared.collections.read().await;
            let table = match collections.get(collection) {
                Some(table) => table,
                None => return Ok(Vec::new()),
            };
            let page: Vec<Document> = table
                .iter()
                .filter(|(k, _)| after.map_or(true, |a| *k > a) && *k <= upper)
                .take(limit)
                .map(|(_, doc)| doc.clone())
                .collect();
            debug!(collection, rows = page.len(), "Served snapshot page");
            Ok(page)
        })
    }

    fn max_key<'a>(&'a self, collection: &'a str) -> BoxFuture<'a, Option<DocKey>> {
        Box::pin(async move {
            self.require_collection("max_key", collection).await?;
            Ok(self
                .shared
                .collections
                .read()
                .await
                .get(collection)
                .and_then(|t| t.keys().next_back().cloned()))
        })
    }

    fn watch<'a>(
        &'a self,
        collection: &'a str,
        resume_after: Option<ResumeToken>,
    ) -> BoxFuture<'a, Box<dyn ChangeFeed>> {
        Box::pin(async move {
            self.require_collection("watch", collection).await?;
            let history = self.shared.history.read().await;
            let events = history.get(collection).map(Vec::as_slice).unwrap_or(&[]);
            let position = match &resume_after {
                Some(token) if token.as_str() == HISTORY_START => 0,
                Some(token) => events
                    .iter()
                    .position(|e| &e.resume_token == token)
                    .map(|i| i + 1)
                    .ok_or_else(|| {
                        MirrorError::source_fatal(
                            "watch",
                            format!("resume token {} no longer in history", token),
                        )
                    })?,
                None => events.len(),
            };
            let last_token = match position {
                0 => ResumeToken::new(HISTORY_START),
                n => events[n - 1].resume_token.clone(),
            };
            debug!(collection, position, "Opened change feed");
            Ok(Box::new(MemoryFeed {
                shared: Arc::clone(&self.shared),
                collection: collection.to_string(),
                position,
                last_token,
            }) as Box<dyn ChangeFeed>)
        })
    }
}

struct MemoryFeed {
    shared: Arc<Shared>,
    collection: String,
    position: usize,
    last_token: ResumeToken,
}

impl ChangeFeed for MemoryFeed {
    fn next_event(&mut self, wait: Duration) -> BoxFuture<'_, Option<ChangeEvent>> {
        Box::pin(async move {
            let deadline = tokio::time::Instant::now() + wait;
            loop {
                // Register before checking so an emit in between is not missed.
                let notified = self.shared.notify.notified();

                if self.shared.feeds_broken.load(Ordering::SeqCst) {
                    return Err(MirrorError::source_fatal("change_feed", "feed connection lost"));
                }
                if let Some(event) = self
                    .shared
                    .history
                    .read()
                    .await
                    .get(&self.collection)
                    .and_then(|events| events.get(self.position))
                {
                    self.position += 1;
                    self.last_token = event.resume_token.clone();
                    return Ok(Some(event.clone()));
                }

                if tokio::time::timeout_at(deadline, notified).await.is_err() {
                    return Ok(None);
                }
            }
        })
    }

    fn position(&self) -> Option<ResumeToken> {
        Some(self.last_token.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn doc(id: i64) -> Document {
        Document::new().with(ID_FIELD, id).with("n", id * 10)
    }

    #[tokio::test]
    async fn test_find_page_respects_bounds_and_order() {
        let source = MemorySource::new();
        source.seed("c", (1..=10).rev().map(doc)).await;

        let page = source
            .find_page("c", Some(&DocKey::Int(3)), &DocKey::Int(8), 3)
            .await
            .unwrap();
        let keys: Vec<_> = page.iter().filter_map(Document::key).collect();
        assert_eq!(keys, vec![DocKey::Int(4), DocKey::Int(5), DocKey::Int(6)]);

        let tail = source
            .find_page("c", Some(&DocKey::Int(6)), &DocKey::Int(8), 10)
            .await
            .unwrap();
        assert_eq!(tail.len(), 2);
    }

    #[tokio::test]
    async fn test_max_key_and_count() {
        let source = MemorySource::new();
        source.seed("c", [doc(5), doc(2), doc(9)]).await;
        assert_eq!(source.max_key("c").await.unwrap(), Some(DocKey::Int(9)));
        assert_eq!(source.count("c").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_unknown_collection() {
        let source = MemorySource::new();
        let err = source.max_key("nope").await.unwrap_err();
        assert!(matches!(err, MirrorError::CollectionNotFound(_)));
    }

    #[tokio::test]
    async fn test_missing_database() {
        let source = MemorySource::missing_database();
        let err = source.list_collections().await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_injected_page_failures_are_transient() {
        let source = MemorySource::new();
        source.seed("c", [doc(1)]).await;
        source.fail_next_pages(1);

        let err = source.find_page("c", None, &DocKey::Int(1), 10).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(source.find_page("c", None, &DocKey::Int(1), 10).await.unwrap().len(), 1);
        assert_eq!(source.page_requests().await.len(), 2);
    }

    #[tokio::test]
    async fn test_feed_starts_at_now_without_token() {
        let source = MemorySource::new();
        source.create_collection("c").await;
        source.insert("c", doc(1)).await;

        let mut feed = source.watch("c", None).await.unwrap();
        let t2 = source.insert("c", doc(2)).await;

        let event = feed.next_event(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(event.resume_token, t2);
        assert_eq!(event.operation, "insert");
        assert!(feed.next_event(Duration::from_millis(10)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_feed_resumes_after_token() {
        let source = MemorySource::new();
        source.create_collection("c").await;
        let t1 = source.insert("c", doc(1)).await;
        source.insert("c", doc(2)).await;
        source.delete("c", &DocKey::Int(1)).await;

        let mut feed = source.watch("c", Some(t1)).await.unwrap();
        let e2 = feed.next_event(Duration::from_millis(10)).await.unwrap().unwrap();
        let e3 = feed.next_event(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(e2.operation, "insert");
        assert_eq!(e3.operation, "delete");
        assert!(e3.full_document.is_none());
        assert_eq!(e3.document_key.get(ID_FIELD), Some(&Value::Int(1)));
        assert_eq!(source.document_count("c").await, 1);
    }

    #[tokio::test]
    async fn test_feed_wakes_on_emit() {
        let source = MemorySource::new();
        source.create_collection("c").await;
        let mut feed = source.watch("c", None).await.unwrap();

        let emitter = source.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            emitter.insert("c", doc(7)).await
        });

        let event = feed.next_event(Duration::from_secs(5)).await.unwrap();
        let token = handle.await.unwrap();
        assert_eq!(event.map(|e| e.resume_token), Some(token));
    }

    #[tokio::test]
    async fn test_position_reopens_where_feed_stood() {
        let source = MemorySource::new();
        source.create_collection("c").await;

        // Opened before any change: reopening replays everything after it.
        let feed = source.watch("c", None).await.unwrap();
        let start = feed.position().unwrap();
        let t1 = source.insert("c", doc(1)).await;
        let t2 = source.insert("c", doc(2)).await;

        let mut reopened = source.watch("c", Some(start)).await.unwrap();
        let e1 = reopened.next_event(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(e1.resume_token, t1);
        assert_eq!(reopened.position(), Some(t1));

        // Opened at "now" after changes: position is the latest event.
        let later = source.watch("c", None).await.unwrap();
        assert_eq!(later.position(), Some(t2));
    }

    #[tokio::test]
    async fn test_broken_feed_is_fatal() {
        let source = MemorySource::new();
        source.create_collection("c").await;
        let mut feed = source.watch("c", None).await.unwrap();
        source.break_feeds();

        let err = feed.next_event(Duration::from_millis(10)).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_unknown_resume_token_is_fatal() {
        let source = MemorySource::new();
        source.create_collection("c").await;
        let err = source
            .watch("c", Some(ResumeToken::new("ffff")))
            .await
            .err()
            .unwrap();
        assert!(!err.is_retryable());
    }
}
