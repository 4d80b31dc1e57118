// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Mirror engine coordinator.
//!
//! The main orchestrator that ties together:
//! - Checkpoint persistence via [`crate::checkpoint::Checkpoints`]
//! - Schema inference via [`crate::schema::SchemaRegistry`]
//! - Per-collection delta loops, each owning its init snapshot child
//! - Output via [`crate::writer::CollectionWriter`] and a [`SinkRef`]
//!
//! # Architecture
//!
//! The coordinator manages the full mirroring lifecycle:
//! 1. Opens the checkpoint store
//! 2. Resolves the configured collections against the source
//! 3. Bootstraps (or restores) each collection's schema
//! 4. Pushes each collection's metadata descriptor once
//! 5. Spawns one delta task per collection
//! 6. Handles graceful shutdown with pending batch flushing
//!
//! Collections share only the schema registry and the checkpoint store. A
//! collection that fails is reported through [`CollectionOutcome`]; the
//! others keep running.

mod delta_sync;
mod init_sync;
mod types;

pub use delta_sync::run_delta_sync;
pub use init_sync::{run_init_sync, InitReport};
pub use types::{CollectionOutcome, EngineState};

use crate::checkpoint::{open_state_store, Checkpoints, StateStore};
use crate::config::{DeltaSyncConfig, InitSyncConfig, MirrorConfig};
use crate::error::{MirrorError, Result};
use crate::metrics;
use crate::normalize::Normalizer;
use crate::resilience::{retry_transient, RetryConfig};
use crate::schema::{Bootstrap, SchemaRegistry};
use crate::sink::{NoOpSink, SinkRef};
use crate::source::SourceRef;
use crate::writer::{CollectionWriter, WriterOptions, DEFAULT_METADATA, MAX_CONVERSION_LOG_LINES};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// How long shutdown waits for each collection task to flush and exit
/// before aborting it.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything one collection's init and delta loops need.
pub struct CollectionContext<S: SourceRef> {
    pub collection: String,
    pub source: Arc<S>,
    pub checkpoints: Checkpoints,
    pub normalizer: Arc<Normalizer>,
    pub writer: Arc<CollectionWriter>,
    pub init: InitSyncConfig,
    pub delta: DeltaSyncConfig,
    pub retry: RetryConfig,
}

/// The main mirror engine.
///
/// Mirrors the configured collections of one source database into
/// sequence-numbered output files pushed to a sink.
pub struct MirrorEngine<S: SourceRef> {
    config: MirrorConfig,

    /// Engine state (broadcast to watchers)
    state_tx: watch::Sender<EngineState>,

    /// Engine state receiver (for internal use)
    state_rx: watch::Receiver<EngineState>,

    source: Arc<S>,

    sink: Arc<dyn SinkRef>,

    /// Injected store; opened from config at start otherwise.
    store: Option<Arc<dyn StateStore>>,

    checkpoints: Option<Checkpoints>,

    retry: RetryConfig,

    drain_timeout: Duration,

    /// Shutdown signal sender
    shutdown_tx: watch::Sender<bool>,

    /// Shutdown signal receiver
    shutdown_rx: watch::Receiver<bool>,

    /// Resolved collection names, in start order.
    collections: Vec<String>,

    outcomes: Arc<Mutex<HashMap<String, CollectionOutcome>>>,

    /// Delta task handles
    handles: Vec<(String, JoinHandle<()>)>,
}

impl<S: SourceRef> MirrorEngine<S> {
    /// Create a new engine.
    ///
    /// The engine starts in `Created` state. Call [`start()`](Self::start)
    /// to begin mirroring. With `output.skip_push` set, `sink` is replaced by
    /// a [`NoOpSink`].
    pub fn new(config: MirrorConfig, source: Arc<S>, sink: Arc<dyn SinkRef>) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let sink: Arc<dyn SinkRef> = if config.output.skip_push {
            info!("Push disabled, using no-op sink");
            Arc::new(NoOpSink)
        } else {
            sink
        };

        Self {
            config,
            state_tx,
            state_rx,
            source,
            sink,
            store: None,
            checkpoints: None,
            retry: RetryConfig::default(),
            drain_timeout: DRAIN_TIMEOUT,
            shutdown_tx,
            shutdown_rx,
            collections: Vec::new(),
            outcomes: Arc::new(Mutex::new(HashMap::new())),
            handles: Vec::new(),
        }
    }

    /// Use an already-open checkpoint store instead of opening one from
    /// `config.checkpoint`.
    pub fn with_state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Retry policy for source reads and sink pushes.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// How long [`shutdown()`](Self::shutdown) waits for a collection task
    /// before aborting it.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn config(&self) -> &MirrorConfig {
        &self.config
    }

    pub fn source(&self) -> &Arc<S> {
        &self.source
    }

    /// Checkpoints, once started.
    pub fn checkpoints(&self) -> Option<&Checkpoints> {
        self.checkpoints.as_ref()
    }

    /// Collections being mirrored, once started.
    pub fn collections(&self) -> &[String] {
        &self.collections
    }

    /// Get current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Check if engine is running.
    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    /// Snapshot of per-collection outcomes.
    pub async fn outcomes(&self) -> HashMap<String, CollectionOutcome> {
        self.outcomes.lock().await.clone()
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state_tx.send(state);
        metrics::set_engine_state(&state.to_string());
    }

    /// Start the mirror engine.
    ///
    /// 1. Opens the checkpoint store
    /// 2. Resolves collections (missing database or collection is fatal)
    /// 3. Bootstraps schemas and pushes metadata descriptors
    /// 4. Spawns one delta task per collection
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(MirrorError::InvalidState {
                expected: "Created".to_string(),
                actual: format!("{:?}", self.state()),
            });
        }

        info!(
            database = %self.config.source.database,
            collections = ?self.config.source.collections,
            "Starting mirror engine"
        );
        self.set_state(EngineState::Starting);

        match self.prepare().await {
            Ok(contexts) => {
                for ctx in contexts {
                    self.spawn_collection(ctx).await;
                }
                metrics::set_active_collections(self.collections.len());
                self.set_state(EngineState::Running);
                info!(collections = self.collections.len(), "Mirror engine running");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Mirror engine failed to start");
                self.set_state(EngineState::Failed);
                Err(e)
            }
        }
    }

    async fn prepare(&mut self) -> Result<Vec<Arc<CollectionContext<S>>>> {
        let store = match &self.store {
            Some(store) => Arc::clone(store),
            None => {
                let store = open_state_store(&self.config.checkpoint).await?;
                self.store = Some(Arc::clone(&store));
                store
            }
        };
        let checkpoints = Checkpoints::new(store);
        self.checkpoints = Some(checkpoints.clone());

        let source = Arc::clone(&self.source);
        let available = retry_transient(&self.retry, "list_collections", || source.list_collections()).await?;
        let collections = self.config.source.collections.resolve(&available)?;
        info!(count = collections.len(), "Collections resolved");

        let metadata = match &self.config.output.metadata_file {
            Some(path) => tokio::fs::read(path)
                .await
                .map_err(|e| MirrorError::io(path, e))?,
            None => DEFAULT_METADATA.as_bytes().to_vec(),
        };

        let registry = Arc::new(SchemaRegistry::new(checkpoints.clone()));
        let normalizer = Arc::new(Normalizer::new(Arc::clone(&registry)));

        let mut contexts = Vec::with_capacity(collections.len());
        for collection in &collections {
            match registry
                .bootstrap(collection, self.source.as_ref(), self.config.init.sample_size, &self.retry)
                .await?
            {
                Bootstrap::Loaded { columns } => {
                    debug!(collection = %collection, columns, "Schema restored");
                }
                Bootstrap::Inferred { columns, sampled } => {
                    debug!(collection = %collection, columns, sampled, "Schema inferred");
                }
            }

            let options = WriterOptions {
                local_dir: self.config.output.local_dir.clone(),
                keep_local_files: self.config.output.keep_local_files,
                metadata: metadata.clone(),
                max_log_lines: MAX_CONVERSION_LOG_LINES,
                retry: self.retry.clone(),
            };
            let writer = CollectionWriter::open(
                collection,
                options,
                checkpoints.clone(),
                Arc::clone(&registry),
                Arc::clone(&self.sink),
            )
            .await?;
            writer.push_metadata_once().await?;
            if writer.push_pending_log().await? {
                info!(collection = %collection, "Pushed conversion log left over from previous run");
            }

            contexts.push(Arc::new(CollectionContext {
                collection: collection.clone(),
                source: Arc::clone(&self.source),
                checkpoints: checkpoints.clone(),
                normalizer: Arc::clone(&normalizer),
                writer: Arc::new(writer),
                init: self.config.init.clone(),
                delta: self.config.delta.clone(),
                retry: self.retry.clone(),
            }));
        }

        self.collections = collections;
        Ok(contexts)
    }

    /// Spawn the delta task for one collection.
    async fn spawn_collection(&mut self, ctx: Arc<CollectionContext<S>>) {
        let collection = ctx.collection.clone();
        let shutdown_rx = self.shutdown_rx.clone();
        let outcomes = Arc::clone(&self.outcomes);
        outcomes
            .lock()
            .await
            .insert(collection.clone(), CollectionOutcome::Running);

        let span = info_span!("delta_sync", collection = %collection);
        let name = collection.clone();
        let handle = tokio::spawn(
            async move {
                let outcome = match run_delta_sync(ctx, shutdown_rx).await {
                    Ok(()) => CollectionOutcome::Stopped,
                    Err(e) => {
                        error!(error = %e, "Collection mirroring failed");
                        metrics::record_error(&name, "fatal");
                        CollectionOutcome::Failed(e.to_string())
                    }
                };
                outcomes.lock().await.insert(name, outcome);
            }
            .instrument(span),
        );

        info!(collection = %collection, "Spawned delta sync task");
        self.handles.push((collection, handle));
    }

    /// Wait for every collection task to exit on its own (fatal errors).
    ///
    /// Returns immediately if the engine was never started.
    pub async fn wait(&mut self) -> HashMap<String, CollectionOutcome> {
        for (collection, handle) in std::mem::take(&mut self.handles) {
            if let Err(e) = handle.await {
                warn!(collection = %collection, error = %e, "Collection task panicked");
                self.outcomes
                    .lock()
                    .await
                    .insert(collection, CollectionOutcome::Failed(e.to_string()));
            }
        }
        self.outcomes().await
    }

    /// Shutdown the mirror engine gracefully.
    ///
    /// Shutdown sequence:
    /// 1. Signal all collection tasks to stop
    /// 2. Wait for tasks to flush pending batches (with timeout); a task
    ///    still running after the timeout is aborted along with its init
    ///    child, and its collection is reported failed
    /// 3. Close the checkpoint store (includes WAL checkpoint)
    pub async fn shutdown(&mut self) {
        info!("Shutting down mirror engine");
        self.set_state(EngineState::ShuttingDown);

        // Signal shutdown to all tasks
        let _ = self.shutdown_tx.send(true);

        let handles = std::mem::take(&mut self.handles);
        let task_count = handles.len();
        if task_count > 0 {
            info!(task_count, "Waiting for tasks to drain and complete");
        }

        for (collection, mut handle) in handles {
            match tokio::time::timeout(self.drain_timeout, &mut handle).await {
                Ok(Ok(())) => {
                    debug!(collection = %collection, "Task completed gracefully");
                }
                Ok(Err(e)) => {
                    warn!(collection = %collection, error = %e, "Task panicked during shutdown");
                }
                Err(_) => {
                    warn!(collection = %collection, "Task timed out during shutdown, aborting (batch may be lost)");
                    handle.abort();
                    // Dropping the delta task's JoinSet aborts its init child.
                    if let Err(e) = handle.await {
                        if e.is_cancelled() {
                            self.outcomes.lock().await.insert(
                                collection,
                                CollectionOutcome::Failed("aborted after drain timeout".to_string()),
                            );
                        }
                    }
                }
            }
        }

        if let Some(store) = &self.store {
            if let Err(e) = store.shutdown().await {
                warn!(error = %e, "Failed to close checkpoint store");
            }
        }

        metrics::set_active_collections(0);
        self.set_state(EngineState::Stopped);
        info!("Mirror engine stopped");
    }
}
