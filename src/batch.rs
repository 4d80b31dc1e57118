//! In-memory batch accumulation for one collection.
//!
//! Collects normalized records tagged with a row marker and decides when the
//! batch should become an output file.
//!
//! # Design
//!
//! ```text
//! ChangeEvent ──▶ OperationKind ──▶ RowMarker (plain | during init)
//!                                        │
//! NormalizedRecord ──────────────────────┼──▶ PendingBatch
//!                                        │      rows, failures,
//!                                        │      last resume token
//!                                        ▼
//!                               should_flush (size | time)
//!                                        │
//!                                        ▼
//!                                  OutputBatch ──▶ CollectionWriter
//! ```
//!
//! Nothing about a pending batch is checkpointed; losing it on a crash only
//! means the feed replays it from the last persisted resume token.

use crate::normalize::{Cell, ConversionFailure, NormalizedRecord};
use crate::source::ResumeToken;
use std::time::{Duration, Instant};

/// Name of the row marker column (always the first column of a file).
pub const ROW_MARKER_COLUMN: &str = "__rowMarker__";

/// Change feed operations the delta engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

impl OperationKind {
    /// Parse a feed operation name. Unsupported kinds return `None`.
    pub fn parse(operation: &str) -> Option<Self> {
        match operation {
            "insert" => Some(Self::Insert),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// Per-row operation marker consumed by the sink's merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowMarker(pub i32);

impl RowMarker {
    pub const INSERT: RowMarker = RowMarker(0);
    pub const UPDATE: RowMarker = RowMarker(1);
    pub const DELETE: RowMarker = RowMarker(2);
    /// Insert-if-absent-else-update, used while the snapshot is still loading.
    pub const UPSERT: RowMarker = RowMarker(4);

    /// Plain marker map, used once init sync is complete.
    pub fn plain(op: OperationKind) -> Self {
        match op {
            OperationKind::Insert => Self::INSERT,
            OperationKind::Update => Self::UPDATE,
            OperationKind::Delete => Self::DELETE,
        }
    }

    /// Marker map while init sync is in progress: inserts become upserts
    /// because the snapshot may emit the same row again.
    pub fn during_init(op: OperationKind) -> Self {
        match op {
            OperationKind::Insert => Self::UPSERT,
            OperationKind::Update => Self::UPDATE,
            OperationKind::Delete => Self::DELETE,
        }
    }

    pub fn for_operation(op: OperationKind, init_in_progress: bool) -> Self {
        if init_in_progress {
            Self::during_init(op)
        } else {
            Self::plain(op)
        }
    }
}

/// Configuration for batch flushing.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Rows before forcing a flush.
    pub max_batch_size: usize,
    /// Age of the first row before forcing a flush.
    pub max_batch_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 1_000,
            max_batch_delay: Duration::from_secs(600),
        }
    }
}

impl BatchConfig {
    /// Fast flush for testing.
    pub fn testing() -> Self {
        Self {
            max_batch_size: 2,
            max_batch_delay: Duration::from_millis(50),
        }
    }
}

/// One buffered row.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRow {
    pub marker: RowMarker,
    pub columns: Vec<(String, Cell)>,
}

/// A batch ready to be materialized as one file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputBatch {
    pub rows: Vec<BatchRow>,
    pub failures: Vec<ConversionFailure>,
    /// Resume position of the last event folded into this batch.
    pub resume_token: Option<ResumeToken>,
}

impl OutputBatch {
    /// A snapshot page: every row carries the insert marker.
    pub fn from_snapshot(records: Vec<NormalizedRecord>) -> Self {
        let mut batch = Self::default();
        for record in records {
            batch.push(RowMarker::INSERT, record);
        }
        batch
    }

    fn push(&mut self, marker: RowMarker, record: NormalizedRecord) {
        self.failures.extend(record.failures);
        self.rows.push(BatchRow {
            marker,
            columns: record.columns,
        });
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Accumulates delta rows for one collection.
#[derive(Debug)]
pub struct PendingBatch {
    batch: OutputBatch,
    /// When the current batch started accumulating.
    batch_start: Option<Instant>,
    config: BatchConfig,
}

impl PendingBatch {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            batch: OutputBatch::default(),
            batch_start: None,
            config,
        }
    }

    /// Append a normalized record and remember the event's resume position.
    pub fn append(&mut self, record: NormalizedRecord, marker: RowMarker, token: ResumeToken) {
        // Start batch timer on first row
        if self.batch_start.is_none() {
            self.batch_start = Some(Instant::now());
        }
        self.batch.push(marker, record);
        self.batch.resume_token = Some(token);
    }

    /// Size threshold, or the time threshold once init is no longer running.
    pub fn should_flush(&self, init_in_progress: bool) -> bool {
        if self.batch.is_empty() {
            return false;
        }

        // Size threshold
        if self.batch.len() >= self.config.max_batch_size {
            return true;
        }

        // Time threshold
        if !init_in_progress {
            if let Some(start) = self.batch_start {
                if start.elapsed() >= self.config.max_batch_delay {
                    return true;
                }
            }
        }

        false
    }

    /// Time left until the time threshold fires (zero if already due).
    pub fn time_until_due(&self) -> Option<Duration> {
        self.batch_start
            .map(|start| self.config.max_batch_delay.saturating_sub(start.elapsed()))
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    /// Take the accumulated batch, leaving this one empty.
    pub fn take(&mut self) -> Option<OutputBatch> {
        self.batch_start = None;
        let batch = std::mem::take(&mut self.batch);
        (!batch.is_empty()).then_some(batch)
    }
}
