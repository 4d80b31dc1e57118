// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sink integration traits.
//!
//! The sink is the landing zone that ingests finished files. The engine only
//! needs one operation from it: push a local file under a collection. A push
//! either succeeds or fails; the writer advances no checkpoint on failure.
//!
//! Pushes are at-least-once. After a crash between push and checkpoint the
//! same file name is pushed again, so implementations should overwrite by
//! name.
//!
//! # Example
//!
//! ```rust,no_run
//! use mirror_engine::error::BoxFuture;
//! use mirror_engine::sink::SinkRef;
//! use std::path::Path;
//!
//! struct MyLandingZone { /* ... */ }
//!
//! impl SinkRef for MyLandingZone {
//!     fn push<'a>(&'a self, local_file: &'a Path, collection: &'a str) -> BoxFuture<'a, ()> {
//!         Box::pin(async move {
//!             // upload `local_file` to `<root>/<collection>/<file name>`
//!             Ok(())
//!         })
//!     }
//! }
//! ```

use crate::error::{BoxFuture, MirrorError, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// What the engine needs from a sink.
pub trait SinkRef: Send + Sync + 'static {
    /// Upload `local_file` for `collection`. The remote name is the local
    /// file name.
    fn push<'a>(&'a self, local_file: &'a Path, collection: &'a str) -> BoxFuture<'a, ()>;
}

fn file_name(local_file: &Path) -> Result<&std::ffi::OsStr> {
    local_file.file_name().ok_or_else(|| MirrorError::Sink {
        file: local_file.display().to_string(),
        message: "path has no file name".into(),
    })
}

/// Sink that copies files into `<root>/<collection>/`.
///
/// Stands in for a landing zone when mirroring to a local or mounted
/// filesystem.
#[derive(Debug, Clone)]
pub struct LocalDirSink {
    root: PathBuf,
}

impl LocalDirSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Destination directory for a collection.
    pub fn collection_dir(&self, collection: &str) -> PathBuf {
        self.root.join(collection)
    }
}

impl SinkRef for LocalDirSink {
    fn push<'a>(&'a self, local_file: &'a Path, collection: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let name = file_name(local_file)?;
            let dir = self.collection_dir(collection);
            tokio::fs::create_dir_all(&dir).await.map_err(|e| MirrorError::Sink {
                file: dir.display().to_string(),
                message: e.to_string(),
            })?;

            let target = dir.join(name);
            tokio::fs::copy(local_file, &target)
                .await
                .map_err(|e| MirrorError::Sink {
                    file: local_file.display().to_string(),
                    message: e.to_string(),
                })?;

            debug!(collection = %collection, target = %target.display(), "File pushed");
            Ok(())
        })
    }
}

/// A no-op sink for local debugging (`skip_push`).
///
/// Logs what it would push and always succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpSink;

impl SinkRef for NoOpSink {
    fn push<'a>(&'a self, local_file: &'a Path, collection: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            debug!(
                collection = %collection,
                file = %local_file.display(),
                "NoOp: would push file"
            );
            Ok(())
        })
    }
}
