//! # Mirror Engine
//!
//! Crash-resilient mirroring of document database collections into a
//! columnar file landing zone.
//!
//! ## Architecture
//!
//! Each collection is mirrored by two cooperating loops that share a schema
//! registry, a normalizer and a batch writer:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                             mirror-engine                                 │
//! │                                                                           │
//! │  ┌──────────────┐   ┌────────────┐   ┌───────────────┐   ┌────────────┐   │
//! │  │ Init sync    │──►│ Normalizer │──►│ Batch writer  │──►│ SinkRef    │   │
//! │  │ (key pages)  │   │ (registry) │   │ (parquet,seq) │   │ (push)     │   │
//! │  └──────────────┘   └────────────┘   └───────────────┘   └────────────┘   │
//! │         ▲                 ▲                  ▲                            │
//! │         │ spawns          │                  │                            │
//! │  ┌──────────────┐         │                  │                            │
//! │  │ Delta sync   │─────────┴──────────────────┘                            │
//! │  │ (change feed)│                                                         │
//! │  └──────────────┘                                                         │
//! │         │                                                                 │
//! │         ▼                                                                 │
//! │  ┌──────────────┐                                                         │
//! │  │ Checkpoints  │  init status/last key/upper bound, resume token,        │
//! │  │ (SQLite)     │  output seq, schema, renames, conversion log            │
//! │  └──────────────┘                                                         │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Two-Phase Mirroring
//!
//! 1. **Init sync**: a resumable, key-ordered snapshot up to the key bound
//!    captured when it started
//! 2. **Delta sync**: the change feed, opened *before* the snapshot starts so
//!    nothing is missed; events seen during the snapshot are written as
//!    upserts and held until it completes
//!
//! ## Usage
//!
//! ```rust,no_run
//! use mirror_engine::{MirrorConfig, MirrorEngine, LocalDirSink, MemorySource};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = MirrorConfig::from_env().expect("Invalid configuration");
//!     let source = Arc::new(MemorySource::new());
//!     let sink = Arc::new(LocalDirSink::new("/mnt/landing"));
//!
//!     let mut engine = MirrorEngine::new(config, source, sink);
//!     engine.start().await.expect("Failed to start");
//!
//!     // Engine runs until shutdown signal
//!     tokio::signal::ctrl_c().await.ok();
//!     engine.shutdown().await;
//! }
//! ```

pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod normalize;
pub mod resilience;
pub mod schema;
pub mod sink;
pub mod source;
pub mod value;
pub mod writer;

// Re-exports for convenience
pub use batch::{OperationKind, RowMarker, ROW_MARKER_COLUMN};
pub use checkpoint::{Checkpoints, ConversionLog, InitStatus, MemoryStateStore, SqliteStateStore, StateStore};
pub use config::{CollectionSelector, MirrorConfig};
pub use coordinator::{CollectionOutcome, EngineState, MirrorEngine};
pub use error::{MirrorError, Result};
pub use normalize::Normalizer;
pub use schema::SchemaRegistry;
pub use sink::{LocalDirSink, NoOpSink, SinkRef};
pub use source::{ChangeEvent, ChangeFeed, MemorySource, ResumeToken, SourceRef};
pub use value::{DocKey, Document, Value};
pub use writer::CollectionWriter;
