// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Checkpoint persistence for per-collection sync state.
//!
//! Every marker the engines need to resume after a crash lives here as a
//! small value keyed by `(collection, key)`: init status, the init page
//! cursor and its upper bound, the change feed resume token, the next output
//! file sequence number, the schema and rename tables, and the conversion
//! log.
//!
//! # Write-Through
//!
//! Every `set()`/`delete()` reaches the backing store before it returns.
//! Callers order their side effects around checkpoint writes: push, then
//! persist the sequence number and resume token.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database file is
//! shared. Those are retried with exponential backoff; any other SQLite
//! error propagates and is fatal to the collection's loop.
//!
//! # Key Ownership
//!
//! ```text
//! init_status, init_last_key, init_upper_bound   -> init engine
//! output_seq, delta_resume_token                 -> batch writer (after each push)
//! conversion_log, metadata_pushed                -> batch writer
//! schema, column_renames                         -> schema registry (under its lock)
//! ```

use crate::config::CheckpointConfig;
use crate::error::{BoxFuture, MirrorError, Result};
use crate::source::ResumeToken;
use crate::value::DocKey;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Logical checkpoint keys, one namespace per collection.
pub mod keys {
    pub const INIT_STATUS: &str = "init_status";
    pub const INIT_LAST_KEY: &str = "init_last_key";
    pub const INIT_UPPER_BOUND: &str = "init_upper_bound";
    pub const DELTA_RESUME_TOKEN: &str = "delta_resume_token";
    pub const OUTPUT_SEQ: &str = "output_seq";
    pub const SCHEMA: &str = "schema";
    pub const COLUMN_RENAMES: &str = "column_renames";
    pub const CONVERSION_LOG: &str = "conversion_log";
    pub const METADATA_PUSHED: &str = "metadata_pushed";
}

/// First sequence number handed out for a fresh collection.
pub const FIRST_OUTPUT_SEQ: u64 = 1;

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

// ═══════════════════════════════════════════════════════════════════════════════
// StateStore: the get/set/delete contract
// ═══════════════════════════════════════════════════════════════════════════════

/// Durable key-value store for small checkpoint blobs.
///
/// Implementations must make `set` and `delete` durable before the returned
/// future resolves.
pub trait StateStore: Send + Sync + 'static {
    fn get<'a>(&'a self, collection: &'a str, key: &'a str) -> BoxFuture<'a, Option<Vec<u8>>>;

    fn set<'a>(&'a self, collection: &'a str, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, ()>;

    fn delete<'a>(&'a self, collection: &'a str, key: &'a str) -> BoxFuture<'a, ()>;

    /// Release resources on engine shutdown. Writes are already durable.
    fn shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// Open the store named by `config`: in-memory for `:memory:`, SQLite otherwise.
pub async fn open_state_store(config: &CheckpointConfig) -> Result<Arc<dyn StateStore>> {
    if config.is_in_memory() {
        info!("Using in-memory checkpoint store");
        return Ok(Arc::new(MemoryStateStore::new()));
    }
    Ok(Arc::new(SqliteStateStore::open(&config.sqlite_path).await?))
}

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts,
                        "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::checkpoint_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts,
                        "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

type CacheKey = (String, String);

// ═══════════════════════════════════════════════════════════════════════════════
// SqliteStateStore
// ═══════════════════════════════════════════════════════════════════════════════

/// Checkpoint storage backed by a local SQLite file.
///
/// Reads are served from an in-memory cache loaded at open; writes go to
/// disk first and update the cache only after the row is committed.
pub struct SqliteStateStore {
    pool: SqlitePool,
    cache: Arc<RwLock<HashMap<CacheKey, Vec<u8>>>>,
    path: String,
}

impl SqliteStateStore {
    /// Open (or create) the checkpoint database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Opening checkpoint store");

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
            .map_err(|e| MirrorError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Full)
            .create_if_missing(true);

        // One connection: writes are already serialized per key owner, and
        // an in-memory database must not be split across connections.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                collection TEXT NOT NULL,
                key TEXT NOT NULL,
                value BLOB NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (collection, key)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows: Vec<(String, String, Vec<u8>)> =
            sqlx::query_as("SELECT collection, key, value FROM checkpoints")
                .fetch_all(&pool)
                .await?;

        let mut cache = HashMap::new();
        for (collection, key, value) in rows {
            debug!(collection = %collection, key = %key, "Loaded checkpoint from disk");
            cache.insert((collection, key), value);
        }

        if !cache.is_empty() {
            info!(count = cache.len(), "Restored checkpoints from previous run");
        }

        Ok(Self {
            pool,
            cache: Arc::new(RwLock::new(cache)),
            path: path_str,
        })
    }

    /// Database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint_wal(&self) -> Result<()> {
        let pool = &self.pool;

        execute_with_retry("checkpoint_wal", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;

        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint the WAL and close the pool.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint_wal().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Checkpoint store closed");
    }
}

impl StateStore for SqliteStateStore {
    fn get<'a>(&'a self, collection: &'a str, key: &'a str) -> BoxFuture<'a, Option<Vec<u8>>> {
        Box::pin(async move {
            let cache = self.cache.read().await;
            Ok(cache.get(&(collection.to_string(), key.to_string())).cloned())
        })
    }

    fn set<'a>(&'a self, collection: &'a str, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let now = chrono::Utc::now().timestamp_millis();
            let pool = &self.pool;
            let bytes = value.as_slice();

            execute_with_retry("checkpoint_set", || async {
                sqlx::query(
                    r#"
                    INSERT INTO checkpoints (collection, key, value, updated_at)
                    VALUES (?, ?, ?, ?)
                    ON CONFLICT(collection, key) DO UPDATE SET
                        value = excluded.value,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(collection)
                .bind(key)
                .bind(bytes)
                .bind(now)
                .execute(pool)
                .await
            })
            .await?;

            self.cache
                .write()
                .await
                .insert((collection.to_string(), key.to_string()), value);
            debug!(collection = %collection, key = %key, "Checkpoint persisted");
            Ok(())
        })
    }

    fn delete<'a>(&'a self, collection: &'a str, key: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let pool = &self.pool;

            execute_with_retry("checkpoint_delete", || async {
                sqlx::query("DELETE FROM checkpoints WHERE collection = ? AND key = ?")
                    .bind(collection)
                    .bind(key)
                    .execute(pool)
                    .await
            })
            .await?;

            self.cache
                .write()
                .await
                .remove(&(collection.to_string(), key.to_string()));
            debug!(collection = %collection, key = %key, "Checkpoint deleted");
            Ok(())
        })
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.close().await;
            Ok(())
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MemoryStateStore
// ═══════════════════════════════════════════════════════════════════════════════

/// Process-local store. Durable only for the lifetime of the value, which
/// is enough to simulate restarts by reusing the same instance.
#[derive(Default)]
pub struct MemoryStateStore {
    entries: RwLock<HashMap<CacheKey, Vec<u8>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries across all collections.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl StateStore for MemoryStateStore {
    fn get<'a>(&'a self, collection: &'a str, key: &'a str) -> BoxFuture<'a, Option<Vec<u8>>> {
        Box::pin(async move {
            let entries = self.entries.read().await;
            Ok(entries.get(&(collection.to_string(), key.to_string())).cloned())
        })
    }

    fn set<'a>(&'a self, collection: &'a str, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.entries
                .write()
                .await
                .insert((collection.to_string(), key.to_string()), value);
            Ok(())
        })
    }

    fn delete<'a>(&'a self, collection: &'a str, key: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.entries
                .write()
                .await
                .remove(&(collection.to_string(), key.to_string()));
            Ok(())
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Checkpoints: typed accessors
// ═══════════════════════════════════════════════════════════════════════════════

/// Init sync state machine status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InitStatus {
    NotStarted,
    InProgress,
    Complete,
}

impl std::fmt::Display for InitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InitStatus::NotStarted => write!(f, "NOT_STARTED"),
            InitStatus::InProgress => write!(f, "IN_PROGRESS"),
            InitStatus::Complete => write!(f, "COMPLETE"),
        }
    }
}

/// Persisted conversion log: the retained tail of lines, how many older
/// lines were dropped to stay under the cap, and whether the sink is behind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionLog {
    #[serde(default)]
    pub omitted: u64,
    #[serde(default)]
    pub lines: Vec<String>,
    /// Lines were added since the log file was last pushed.
    #[serde(default)]
    pub unpushed: bool,
}

impl ConversionLog {
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() && self.omitted == 0
    }

    /// Append lines, dropping the oldest beyond `max_lines`.
    pub fn append(&mut self, lines: impl IntoIterator<Item = String>, max_lines: usize) {
        let before = self.lines.len();
        self.lines.extend(lines);
        if self.lines.len() == before {
            return;
        }
        self.unpushed = true;
        if self.lines.len() > max_lines {
            let excess = self.lines.len() - max_lines;
            self.lines.drain(..excess);
            self.omitted += excess as u64;
        }
    }

    /// File content: an omission notice (if any) then one line per failure.
    pub fn render(&self) -> String {
        let mut content = String::new();
        if self.omitted > 0 {
            content.push_str(&format!("# {} earlier entries omitted\n", self.omitted));
        }
        for line in &self.lines {
            content.push_str(line);
            content.push('\n');
        }
        content
    }
}

/// Typed view over a [`StateStore`]. Values are stored as JSON.
#[derive(Clone)]
pub struct Checkpoints {
    store: Arc<dyn StateStore>,
}

impl Checkpoints {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Backing store, for shutdown.
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Read and decode a JSON value.
    pub async fn get_json<T: DeserializeOwned>(&self, collection: &str, key: &str) -> Result<Option<T>> {
        match self.store.get(collection, key).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| MirrorError::codec(key, e)),
            None => Ok(None),
        }
    }

    /// Encode and durably write a JSON value.
    pub async fn set_json<T: Serialize + ?Sized>(&self, collection: &str, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value).map_err(|e| MirrorError::codec(key, e))?;
        self.store.set(collection, key, bytes).await
    }

    pub async fn delete(&self, collection: &str, key: &str) -> Result<()> {
        self.store.delete(collection, key).await
    }

    /// Init status; absent means the collection was never started.
    pub async fn init_status(&self, collection: &str) -> Result<InitStatus> {
        Ok(self
            .get_json(collection, keys::INIT_STATUS)
            .await?
            .unwrap_or(InitStatus::NotStarted))
    }

    pub async fn set_init_status(&self, collection: &str, status: InitStatus) -> Result<()> {
        self.set_json(collection, keys::INIT_STATUS, &status).await
    }

    pub async fn init_last_key(&self, collection: &str) -> Result<Option<DocKey>> {
        self.get_json(collection, keys::INIT_LAST_KEY).await
    }

    pub async fn set_init_last_key(&self, collection: &str, key: &DocKey) -> Result<()> {
        self.set_json(collection, keys::INIT_LAST_KEY, key).await
    }

    pub async fn clear_init_last_key(&self, collection: &str) -> Result<()> {
        self.delete(collection, keys::INIT_LAST_KEY).await
    }

    pub async fn init_upper_bound(&self, collection: &str) -> Result<Option<DocKey>> {
        self.get_json(collection, keys::INIT_UPPER_BOUND).await
    }

    pub async fn set_init_upper_bound(&self, collection: &str, key: &DocKey) -> Result<()> {
        self.set_json(collection, keys::INIT_UPPER_BOUND, key).await
    }

    pub async fn resume_token(&self, collection: &str) -> Result<Option<ResumeToken>> {
        self.get_json(collection, keys::DELTA_RESUME_TOKEN).await
    }

    pub async fn set_resume_token(&self, collection: &str, token: &ResumeToken) -> Result<()> {
        self.set_json(collection, keys::DELTA_RESUME_TOKEN, token).await
    }

    /// Next output sequence number (starts at [`FIRST_OUTPUT_SEQ`]).
    pub async fn output_seq(&self, collection: &str) -> Result<u64> {
        Ok(self
            .get_json(collection, keys::OUTPUT_SEQ)
            .await?
            .unwrap_or(FIRST_OUTPUT_SEQ))
    }

    pub async fn set_output_seq(&self, collection: &str, seq: u64) -> Result<()> {
        self.set_json(collection, keys::OUTPUT_SEQ, &seq).await
    }

    /// Accumulated conversion log lines.
    pub async fn conversion_log(&self, collection: &str) -> Result<ConversionLog> {
        Ok(self
            .get_json(collection, keys::CONVERSION_LOG)
            .await?
            .unwrap_or_default())
    }

    pub async fn set_conversion_log(&self, collection: &str, log: &ConversionLog) -> Result<()> {
        self.set_json(collection, keys::CONVERSION_LOG, log).await
    }

    pub async fn metadata_pushed(&self, collection: &str) -> Result<bool> {
        Ok(self
            .get_json(collection, keys::METADATA_PUSHED)
            .await?
            .unwrap_or(false))
    }

    pub async fn set_metadata_pushed(&self, collection: &str) -> Result<()> {
        self.set_json(collection, keys::METADATA_PUSHED, &true).await
    }
}
