// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the mirror engine.
//!
//! Errors are categorized by the collaborator they came from (source
//! database, sink, checkpoint store) and carry enough context to diagnose
//! which collection and which unit of work failed.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Source` (transient) | Yes | Query/feed timeouts, dropped connections |
//! | `Sink` | Yes | Push rejected or upload failed; checkpoint not advanced |
//! | `Io` | Yes | Local file write/rename/delete failed |
//! | `Source` (permanent) | No | Feed irrecoverably lost, page parse failure |
//! | `Checkpoint` | No | Local SQLite errors (needs operator attention) |
//! | `CheckpointCodec` | No | Persisted value could not be decoded |
//! | `Parquet` | No | Batch could not be materialized |
//! | `Config` | No | Configuration invalid or missing |
//! | `CollectionNotFound` | No | Named collection does not exist in the source |
//! | `InvalidState` | No | Engine state machine violation |
//! | `Shutdown` | No | Engine is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`MirrorError::is_retryable()`] to decide whether the same unit of
//! work (page, batch, checkpoint op) should be attempted again. Nothing is
//! ever skipped on a retryable error; the caller repeats it.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use thiserror::Error;

/// Result type alias for mirror operations.
pub type Result<T> = std::result::Result<T, MirrorError>;

/// Boxed future returned by collaborator traits (source, sink, state store).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Errors that can occur while mirroring a collection.
#[derive(Error, Debug)]
pub enum MirrorError {
    /// Source database query or change feed error.
    ///
    /// `transient` is set by the source collaborator for timeouts and
    /// connection drops; those are retried. Anything else is fatal for the
    /// collection's current run.
    #[error("Source error ({operation}): {message}")]
    Source {
        operation: String,
        message: String,
        transient: bool,
    },

    /// The sink refused or failed to accept a pushed file.
    #[error("Sink push failed ({file}): {message}")]
    Sink { file: String, message: String },

    /// SQLite error in the checkpoint store.
    #[error("Checkpoint store error: {0}")]
    Checkpoint(#[from] sqlx::Error),

    /// A persisted checkpoint value could not be encoded or decoded.
    #[error("Checkpoint codec error ({key}): {message}")]
    CheckpointCodec { key: String, message: String },

    /// Local filesystem error while staging output files.
    #[error("I/O error ({path}): {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Arrow/Parquet materialization failure.
    #[error("Parquet error: {0}")]
    Parquet(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A collection named in the configuration does not exist in the source.
    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    /// Engine state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MirrorError {
    /// Transient source error (retried by the caller).
    pub fn source_transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Source {
            operation: operation.into(),
            message: message.into(),
            transient: true,
        }
    }

    /// Permanent source error (fatal for the collection's run).
    pub fn source_fatal(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Source {
            operation: operation.into(),
            message: message.into(),
            transient: false,
        }
    }

    /// Local I/O error on a given path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Checkpoint value codec error.
    pub fn codec(key: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::CheckpointCodec {
            key: key.into(),
            message: message.to_string(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Source { transient, .. } => *transient,
            Self::Sink { .. } => true,
            Self::Io { .. } => true,
            Self::Checkpoint(_) => false, // Local DB issues need attention
            Self::CheckpointCodec { .. } => false,
            Self::Parquet(_) => false,
            Self::Config(_) => false,
            Self::CollectionNotFound(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}

impl From<arrow::error::ArrowError> for MirrorError {
    fn from(e: arrow::error::ArrowError) -> Self {
        Self::Parquet(e.to_string())
    }
}

impl From<parquet::errors::ParquetError> for MirrorError {
    fn from(e: parquet::errors::ParquetError) -> Self {
        Self::Parquet(e.to_string())
    }
}
