//! Configuration for the mirror engine.
//!
//! This module defines all configuration types needed to run the mirror.
//! Configuration is passed to [`MirrorEngine::new()`](crate::MirrorEngine::new)
//! and can be constructed programmatically, deserialized with serde, or
//! read from the process environment with [`MirrorConfig::from_env()`].
//!
//! # Quick Start
//!
//! ```rust
//! use mirror_engine::config::{CollectionSelector, MirrorConfig};
//!
//! let mut config = MirrorConfig::for_testing();
//! config.source.collections = CollectionSelector::parse("[\"orders\",\"users\"]").unwrap();
//! assert_eq!(config.delta.batch_size, 2);
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! MirrorConfig
//! ├── source: SourceConfig          # connection, database, collection selector
//! ├── init: InitSyncConfig          # snapshot page size, schema sample size
//! ├── delta: DeltaSyncConfig        # flush thresholds, feed poll interval
//! ├── output: OutputConfig          # local staging dir, metadata, debug toggles
//! └── checkpoint: CheckpointConfig  # SQLite checkpoint persistence
//! ```
//!
//! # Environment
//!
//! | Variable | Field | Required |
//! |----------|-------|----------|
//! | `MONGO_CONN_STR` | `source.connection_string` | yes |
//! | `MONGO_DB_NAME` | `source.database` | yes |
//! | `MONGO_COLLECTION` | `source.collections` | yes |
//! | `INIT_LOAD_BATCH_SIZE` | `init.batch_size`, `init.sample_size` | yes |
//! | `DELTA_SYNC_BATCH_SIZE` | `delta.batch_size` | yes |
//! | `DELTA_SYNC_FLUSH_INTERVAL` | `delta.flush_interval` (seconds or "10m") | no |
//! | `OUTPUT_DIR` | `output.local_dir` | no |
//! | `CHECKPOINT_DB` | `checkpoint.sqlite_path` | no |
//! | `DEBUG_SKIP_PUSH` | `output.skip_push` | no |
//! | `DEBUG_KEEP_LOCAL_FILES` | `output.keep_local_files` | no |

use crate::batch::BatchConfig;
use crate::error::{MirrorError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `MirrorEngine::new()`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MirrorConfig {
    pub source: SourceConfig,

    #[serde(default)]
    pub init: InitSyncConfig,

    #[serde(default)]
    pub delta: DeltaSyncConfig,

    #[serde(default)]
    pub output: OutputConfig,

    /// Checkpoint persistence settings.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

impl MirrorConfig {
    /// Create a fast-flushing config for testing.
    pub fn for_testing() -> Self {
        Self {
            source: SourceConfig {
                connection_string: "memory://".to_string(),
                database: "test".to_string(),
                collections: CollectionSelector::All,
            },
            init: InitSyncConfig {
                batch_size: 100,
                sample_size: 100,
            },
            delta: DeltaSyncConfig {
                batch_size: 2,
                flush_interval: "200ms".to_string(),
                poll_interval: "10ms".to_string(),
            },
            output: OutputConfig::default(),
            checkpoint: CheckpointConfig::in_memory(),
        }
    }

    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| -> Result<String> {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| MirrorError::Config(format!("Missing environment variable {}", key)))
        };
        let number = |key: &str| -> Result<usize> {
            let raw = required(key)?;
            let n = raw
                .trim()
                .parse::<usize>()
                .map_err(|e| MirrorError::Config(format!("{} must be a positive integer: {}", key, e)))?;
            if n == 0 {
                return Err(MirrorError::Config(format!("{} must be greater than zero", key)));
            }
            Ok(n)
        };
        let flag = |key: &str| -> bool {
            lookup(key)
                .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "y"))
                .unwrap_or(false)
        };

        let init_batch = number("INIT_LOAD_BATCH_SIZE")?;
        let mut config = Self {
            source: SourceConfig {
                connection_string: required("MONGO_CONN_STR")?,
                database: required("MONGO_DB_NAME")?,
                collections: CollectionSelector::parse(&required("MONGO_COLLECTION")?)?,
            },
            init: InitSyncConfig {
                batch_size: init_batch,
                sample_size: init_batch,
            },
            delta: DeltaSyncConfig {
                batch_size: number("DELTA_SYNC_BATCH_SIZE")?,
                ..Default::default()
            },
            output: OutputConfig {
                skip_push: flag("DEBUG_SKIP_PUSH"),
                keep_local_files: flag("DEBUG_KEEP_LOCAL_FILES"),
                ..Default::default()
            },
            checkpoint: CheckpointConfig::default(),
        };

        if let Some(interval) = lookup("DELTA_SYNC_FLUSH_INTERVAL") {
            config.delta.flush_interval = parse_interval("DELTA_SYNC_FLUSH_INTERVAL", &interval)?;
        }
        if let Some(dir) = lookup("OUTPUT_DIR") {
            config.output.local_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup("CHECKPOINT_DB") {
            config.checkpoint.sqlite_path = path;
        }
        Ok(config)
    }
}

/// Bare integers are seconds; anything else must be a humantime duration.
fn parse_interval(key: &str, raw: &str) -> Result<String> {
    let raw = raw.trim();
    if raw.parse::<u64>().is_ok() {
        return Ok(format!("{}s", raw));
    }
    humantime::parse_duration(raw)
        .map(|_| raw.to_string())
        .map_err(|e| MirrorError::Config(format!("{} is not a duration: {}", key, e)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// SourceConfig: which database and collections to mirror
// ═══════════════════════════════════════════════════════════════════════════════

/// Source database configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SourceConfig {
    /// Connection string handed to the source driver.
    pub connection_string: String,

    /// Database name. Startup fails if it does not exist.
    pub database: String,

    /// Which collections to mirror.
    #[serde(default)]
    pub collections: CollectionSelector,
}

/// Collection selection: `"all"`, a JSON list, or a single name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(try_from = "String", into = "String")]
pub enum CollectionSelector {
    #[default]
    All,
    Named(Vec<String>),
}

impl CollectionSelector {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(MirrorError::Config("Collection selector is empty".to_string()));
        }
        if raw == "all" {
            return Ok(Self::All);
        }
        if raw.starts_with('[') {
            let names: Vec<String> = serde_json::from_str(raw)
                .map_err(|e| MirrorError::Config(format!("Invalid collection list {}: {}", raw, e)))?;
            return Ok(Self::Named(names));
        }
        Ok(Self::Named(vec![raw.to_string()]))
    }

    /// Resolve against the collections that exist in the source.
    ///
    /// A named collection that does not exist is an error.
    pub fn resolve(&self, available: &[String]) -> Result<Vec<String>> {
        match self {
            Self::All => Ok(available.to_vec()),
            Self::Named(names) => {
                if let Some(missing) = names.iter().find(|n| !available.contains(n)) {
                    return Err(MirrorError::CollectionNotFound(missing.clone()));
                }
                Ok(names.clone())
            }
        }
    }
}

impl TryFrom<String> for CollectionSelector {
    type Error = MirrorError;

    fn try_from(raw: String) -> Result<Self> {
        Self::parse(&raw)
    }
}

impl From<CollectionSelector> for String {
    fn from(selector: CollectionSelector) -> Self {
        match selector {
            CollectionSelector::All => "all".to_string(),
            CollectionSelector::Named(names) => {
                serde_json::to_string(&names).unwrap_or_else(|_| "[]".to_string())
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// InitSyncConfig: snapshot paging
// ═══════════════════════════════════════════════════════════════════════════════

/// Init sync (snapshot) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitSyncConfig {
    /// Documents per snapshot page (one output file per page).
    #[serde(default = "default_init_batch_size")]
    pub batch_size: usize,

    /// Documents sampled to infer a fresh collection's schema.
    #[serde(default = "default_init_batch_size")]
    pub sample_size: usize,
}

fn default_init_batch_size() -> usize {
    100_000
}

impl Default for InitSyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 100_000,
            sample_size: 100_000,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DeltaSyncConfig: change feed flushing
// ═══════════════════════════════════════════════════════════════════════════════

/// Delta sync (change feed) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaSyncConfig {
    /// Rows accumulated before a flush.
    #[serde(default = "default_delta_batch_size")]
    pub batch_size: usize,

    /// Maximum age of a non-empty batch as a duration string (e.g., "600s").
    #[serde(default = "default_flush_interval")]
    pub flush_interval: String,

    /// How long one feed poll waits for an event before the loop re-checks
    /// timers and init status.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,
}

fn default_delta_batch_size() -> usize {
    1_000
}

fn default_flush_interval() -> String {
    "600s".to_string()
}

fn default_poll_interval() -> String {
    "1s".to_string()
}

impl Default for DeltaSyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 1_000,
            flush_interval: "600s".to_string(),
            poll_interval: "1s".to_string(),
        }
    }
}

impl DeltaSyncConfig {
    /// Parse the flush_interval string to a Duration.
    pub fn flush_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.flush_interval).unwrap_or(Duration::from_secs(600))
    }

    /// Parse the poll_interval string to a Duration.
    pub fn poll_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.poll_interval).unwrap_or(Duration::from_secs(1))
    }

    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            max_batch_size: self.batch_size,
            max_batch_delay: self.flush_interval_duration(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// OutputConfig: local staging and debug toggles
// ═══════════════════════════════════════════════════════════════════════════════

/// Output file staging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Local directory where files are written before push.
    #[serde(default = "default_local_dir")]
    pub local_dir: PathBuf,

    /// Metadata descriptor pushed once per collection. When absent the
    /// default `{"keyColumns":["_id"]}` is used.
    #[serde(default)]
    pub metadata_file: Option<PathBuf>,

    /// Debug: keep local files after a successful push.
    #[serde(default)]
    pub keep_local_files: bool,

    /// Debug: never push; files are only written locally.
    #[serde(default)]
    pub skip_push: bool,
}

fn default_local_dir() -> PathBuf {
    PathBuf::from("mirror_output")
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            local_dir: default_local_dir(),
            metadata_file: None,
            keep_local_files: false,
            skip_push: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CheckpointConfig: checkpoint persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// Checkpoint persistence configuration.
///
/// Checkpoints hold every resume marker, so they live in a local SQLite
/// file rather than next to the (possibly ephemeral) output directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Path to SQLite database for checkpoint storage.
    pub sqlite_path: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "mirror_checkpoints.db".to_string(),
        }
    }
}

impl CheckpointConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.sqlite_path == ":memory:"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
