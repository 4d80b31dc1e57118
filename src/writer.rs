// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Output file materialization and push, one writer per collection.
//!
//! # Flush Protocol
//!
//! ```text
//! OutputBatch ──▶ parquet bytes ──▶ <staging>/<seq:020>.parquet
//!                                          │
//!                                          ▼
//!                                   sink.push (retried)
//!                                          │
//!                                          ▼
//!                      persist output_seq = seq + 1, then resume token
//!                                          │
//!                                          ▼
//!                            remove local file (unless kept)
//! ```
//!
//! The sequence number is read from the checkpoint store, never from the
//! staging directory. A crash after push but before the sequence write
//! re-pushes the same name on restart: one duplicate, never a gap.
//!
//! # Held Batches
//!
//! While init sync runs, delta batches are written as `Temp_<n>.parquet`
//! and kept in capture order. [`CollectionWriter::promote_held`] assigns
//! real sequence numbers and pushes them once init completes. Held files are
//! not checkpointed; after a crash the change feed replays them from the
//! last persisted resume token (on a first run, the feed's opening position),
//! so stale temp files are discarded on open.
//!
//! # Conversion Log
//!
//! A batch's conversion failures are persisted before its data file is
//! pushed and the log file goes out right after it. A held batch keeps its
//! failures until promotion. The persisted log keeps only the newest
//! `max_log_lines` lines.

use crate::batch::{OutputBatch, ROW_MARKER_COLUMN};
use crate::checkpoint::{Checkpoints, ConversionLog};
use crate::error::{MirrorError, Result};
use crate::metrics;
use crate::normalize::{Cell, ConversionFailure};
use crate::resilience::{retry_transient, RetryConfig};
use crate::schema::{ColumnEncoding, SchemaRegistry};
use crate::sink::SinkRef;
use crate::source::ResumeToken;
use arrow::array::{
    ArrayRef, BooleanArray, Float64Array, Int32Array, Int64Array, StringArray,
    TimestampMillisecondArray,
};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Extension of every data file.
pub const DATA_FILE_EXTENSION: &str = "parquet";
/// Prefix of delta files held back during init sync.
pub const TEMP_PREFIX: &str = "Temp_";
/// Conversion log file name.
pub const CONVERSION_LOG_FILE: &str = "_conversion_log.txt";
/// Metadata descriptor file name.
pub const METADATA_FILE: &str = "_metadata.json";
/// Conversion log lines kept before the oldest are dropped.
pub const MAX_CONVERSION_LOG_LINES: usize = 10_000;
/// Metadata descriptor pushed when none is configured.
pub const DEFAULT_METADATA: &str = r#"{"keyColumns":["_id"]}"#;

/// Data file name for a sequence number.
pub fn data_file_name(seq: u64) -> String {
    format!("{:020}.{}", seq, DATA_FILE_EXTENSION)
}

/// Name of the `index`-th held file.
pub fn temp_file_name(index: u64) -> String {
    format!("{}{:020}.{}", TEMP_PREFIX, index, DATA_FILE_EXTENSION)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Parquet encoding
// ═══════════════════════════════════════════════════════════════════════════════

fn arrow_type(encoding: ColumnEncoding) -> DataType {
    match encoding {
        ColumnEncoding::Utf8 => DataType::Utf8,
        ColumnEncoding::Int64 | ColumnEncoding::NullableInt64 => DataType::Int64,
        ColumnEncoding::Float64 => DataType::Float64,
        ColumnEncoding::Boolean | ColumnEncoding::NullableBoolean => DataType::Boolean,
        ColumnEncoding::TimestampMillis => DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into())),
    }
}

fn build_column(encoding: ColumnEncoding, cells: &[&Cell]) -> ArrayRef {
    match encoding {
        ColumnEncoding::Utf8 => Arc::new(StringArray::from(
            cells.iter().map(|c| c.to_text()).collect::<Vec<_>>(),
        )),
        ColumnEncoding::Int64 | ColumnEncoding::NullableInt64 => Arc::new(Int64Array::from(
            cells
                .iter()
                .map(|c| match c {
                    Cell::Int(i) => Some(*i),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        ColumnEncoding::Float64 => Arc::new(Float64Array::from(
            cells
                .iter()
                .map(|c| match c {
                    Cell::Float(f) => Some(*f),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        ColumnEncoding::Boolean | ColumnEncoding::NullableBoolean => Arc::new(BooleanArray::from(
            cells
                .iter()
                .map(|c| match c {
                    Cell::Bool(b) => Some(*b),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        ColumnEncoding::TimestampMillis => Arc::new(
            TimestampMillisecondArray::from(
                cells
                    .iter()
                    .map(|c| match c {
                        Cell::TimestampMillis(ms) => Some(*ms),
                        _ => None,
                    })
                    .collect::<Vec<_>>(),
            )
            .with_timezone("UTC"),
        ),
    }
}

/// Build a record batch: row marker first, then the union of the rows'
/// columns in first-seen order. Rows missing a column get null.
///
/// A column whose cells do not all fit the registry encoding (a failed
/// cast, or no registry entry) is written as UTF-8 text.
pub fn to_record_batch(batch: &OutputBatch, encodings: &HashMap<String, ColumnEncoding>) -> Result<RecordBatch> {
    let mut order: Vec<&str> = Vec::new();
    let mut seen: HashMap<&str, usize> = HashMap::new();
    for row in &batch.rows {
        for (name, _) in &row.columns {
            if !seen.contains_key(name.as_str()) {
                seen.insert(name.as_str(), order.len());
                order.push(name.as_str());
            }
        }
    }

    let null = Cell::Null;
    let mut grid: Vec<Vec<&Cell>> = vec![Vec::with_capacity(batch.len()); order.len()];
    for row in &batch.rows {
        let mut present = vec![false; order.len()];
        for (name, cell) in &row.columns {
            if let Some(&i) = seen.get(name.as_str()) {
                if !present[i] {
                    present[i] = true;
                    grid[i].push(cell);
                }
            }
        }
        for (i, was_present) in present.into_iter().enumerate() {
            if !was_present {
                grid[i].push(&null);
            }
        }
    }

    let mut fields = Vec::with_capacity(order.len() + 1);
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(order.len() + 1);

    fields.push(Field::new(ROW_MARKER_COLUMN, DataType::Int32, false));
    arrays.push(Arc::new(Int32Array::from(
        batch.rows.iter().map(|r| r.marker.0).collect::<Vec<_>>(),
    )));

    for (name, cells) in order.iter().zip(grid.iter()) {
        let encoding = match encodings.get(*name) {
            Some(&enc) if cells.iter().all(|c| c.matches(enc)) => enc,
            _ => ColumnEncoding::Utf8,
        };
        fields.push(Field::new(*name, arrow_type(encoding), true));
        arrays.push(build_column(encoding, cells));
    }

    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?)
}

/// Encode one record batch as a complete parquet file.
pub fn encode_parquet(record_batch: &RecordBatch) -> Result<Vec<u8>> {
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, record_batch.schema(), Some(props))?;
    writer.write(record_batch)?;
    writer.close()?;
    Ok(buffer)
}

// ═══════════════════════════════════════════════════════════════════════════════
// CollectionWriter
// ═══════════════════════════════════════════════════════════════════════════════

/// Where a collection writer stages files and what it pushes alongside them.
#[derive(Debug, Clone)]
pub struct WriterOptions {
    /// Root staging directory; files go under `<local_dir>/<collection>/`.
    pub local_dir: PathBuf,
    pub keep_local_files: bool,
    /// Metadata descriptor content.
    pub metadata: Vec<u8>,
    pub max_log_lines: usize,
    pub retry: RetryConfig,
}

impl WriterOptions {
    pub fn new(local_dir: impl Into<PathBuf>) -> Self {
        Self {
            local_dir: local_dir.into(),
            keep_local_files: false,
            metadata: DEFAULT_METADATA.as_bytes().to_vec(),
            max_log_lines: MAX_CONVERSION_LOG_LINES,
            retry: RetryConfig::default(),
        }
    }
}

enum Publish<'a> {
    /// Encode this batch straight under the sequence name.
    Batch(&'a OutputBatch),
    /// Copy a held temp file to the sequence name.
    Held(&'a Path),
}

#[derive(Debug)]
struct HeldFile {
    path: PathBuf,
    rows: usize,
    resume_token: Option<ResumeToken>,
    failures: Vec<ConversionFailure>,
}

#[derive(Debug, Default)]
struct HeldState {
    files: Vec<HeldFile>,
    next_index: u64,
}

/// Materializes and pushes output files for one collection.
pub struct CollectionWriter {
    collection: String,
    staging_dir: PathBuf,
    checkpoints: Checkpoints,
    registry: Arc<SchemaRegistry>,
    sink: Arc<dyn SinkRef>,
    keep_local_files: bool,
    metadata: Vec<u8>,
    max_log_lines: usize,
    retry: RetryConfig,
    /// Serializes sequence allocation + push + sequence persist.
    push_lock: Mutex<()>,
    held: Mutex<HeldState>,
    /// Persisted log lines the sink has not seen yet.
    log_pending: AtomicBool,
}

impl CollectionWriter {
    /// Create the staging directory and drop temp files left by a previous run.
    pub async fn open(
        collection: &str,
        options: WriterOptions,
        checkpoints: Checkpoints,
        registry: Arc<SchemaRegistry>,
        sink: Arc<dyn SinkRef>,
    ) -> Result<Self> {
        let staging_dir = options.local_dir.join(collection);
        tokio::fs::create_dir_all(&staging_dir)
            .await
            .map_err(|e| MirrorError::io(&staging_dir, e))?;

        let discarded = discard_temp_files(&staging_dir).await?;
        if discarded > 0 {
            info!(collection = %collection, discarded, "Discarded held files from previous run");
        }
        let log_pending = checkpoints.conversion_log(collection).await?.unpushed;

        Ok(Self {
            collection: collection.to_string(),
            staging_dir,
            checkpoints,
            registry,
            sink,
            keep_local_files: options.keep_local_files,
            metadata: options.metadata,
            max_log_lines: options.max_log_lines,
            retry: options.retry,
            push_lock: Mutex::new(()),
            held: Mutex::new(HeldState::default()),
            log_pending: AtomicBool::new(log_pending),
        })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Number of batches currently held back.
    pub async fn held_count(&self) -> usize {
        self.held.lock().await.files.len()
    }

    async fn encodings(&self) -> Result<HashMap<String, ColumnEncoding>> {
        Ok(self
            .registry
            .columns(&self.collection)
            .await?
            .into_iter()
            .map(|(name, entry)| (name, entry.target_encoding))
            .collect())
    }

    async fn write_local(&self, path: &Path, batch: &OutputBatch) -> Result<()> {
        let encodings = self.encodings().await?;
        let record_batch = to_record_batch(batch, &encodings)?;
        let bytes = encode_parquet(&record_batch)?;
        tokio::fs::write(path, bytes)
            .await
            .map_err(|e| MirrorError::io(path, e))
    }

    async fn push_file(&self, path: &Path) -> Result<()> {
        let result = retry_transient(&self.retry, "push", || self.sink.push(path, &self.collection)).await;
        if result.is_err() {
            metrics::record_push_failure(&self.collection);
        }
        result
    }

    async fn cleanup(&self, path: &Path) {
        if self.keep_local_files {
            return;
        }
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!(collection = %self.collection, file = %path.display(), error = %e, "Failed to remove local file");
        }
    }

    /// Publish the next data file and advance the checkpoints, then push
    /// the conversion log if it has unpushed lines.
    /// Caller holds `push_lock`. Returns the sequence number used.
    async fn publish_locked(
        &self,
        content: Publish<'_>,
        batch_rows: usize,
        resume_token: Option<&ResumeToken>,
        failures: &[ConversionFailure],
    ) -> Result<u64> {
        let start = Instant::now();

        // A crash past this point replays the batch: its lines may be logged
        // twice, never lost.
        self.append_failures_locked(failures).await?;

        let seq = self.checkpoints.output_seq(&self.collection).await?;
        let target = self.staging_dir.join(data_file_name(seq));
        match content {
            Publish::Batch(batch) => self.write_local(&target, batch).await?,
            Publish::Held(local) => {
                tokio::fs::copy(local, &target)
                    .await
                    .map_err(|e| MirrorError::io(local, e))?;
            }
        }

        self.push_file(&target).await?;
        self.checkpoints.set_output_seq(&self.collection, seq + 1).await?;
        if let Some(token) = resume_token {
            self.checkpoints.set_resume_token(&self.collection, token).await?;
        }
        self.cleanup(&target).await;

        metrics::record_file_pushed(&self.collection, batch_rows, start.elapsed());
        metrics::set_output_seq(&self.collection, seq + 1);
        debug!(collection = %self.collection, seq, rows = batch_rows, "Data file pushed");

        self.push_log_locked().await?;
        Ok(seq)
    }

    /// Write `batch` under the next sequence number, push it, and advance
    /// the checkpoints. Returns the sequence number used.
    #[instrument(skip(self, batch), fields(collection = %self.collection, rows = batch.len()))]
    pub async fn flush_and_push(&self, batch: &OutputBatch) -> Result<u64> {
        let _guard = self.push_lock.lock().await;
        self.publish_locked(
            Publish::Batch(batch),
            batch.len(),
            batch.resume_token.as_ref(),
            &batch.failures,
        )
        .await
    }

    /// Write `batch` as a held temp file, to be pushed by [`Self::promote_held`].
    #[instrument(skip(self, batch), fields(collection = %self.collection, rows = batch.len()))]
    pub async fn hold(&self, batch: &OutputBatch) -> Result<()> {
        let mut held = self.held.lock().await;
        let path = self.staging_dir.join(temp_file_name(held.next_index));
        self.write_local(&path, batch).await?;
        held.next_index += 1;
        held.files.push(HeldFile {
            path,
            rows: batch.len(),
            resume_token: batch.resume_token.clone(),
            failures: batch.failures.clone(),
        });
        drop(held);

        metrics::record_batch_held(&self.collection, batch.len());
        Ok(())
    }

    /// Push every held file in capture order. Returns how many were pushed.
    ///
    /// A failed push leaves it and every later file held, so a retry keeps
    /// the order.
    #[instrument(skip(self), fields(collection = %self.collection))]
    pub async fn promote_held(&self) -> Result<usize> {
        let mut held = self.held.lock().await;
        let mut promoted = 0;
        while let Some(file) = held.files.first() {
            let _guard = self.push_lock.lock().await;
            self.publish_locked(
                Publish::Held(&file.path),
                file.rows,
                file.resume_token.as_ref(),
                &file.failures,
            )
            .await?;
            let file = held.files.remove(0);
            if let Err(e) = tokio::fs::remove_file(&file.path).await {
                warn!(collection = %self.collection, file = %file.path.display(), error = %e, "Failed to remove held file");
            }
            promoted += 1;
        }
        if promoted > 0 {
            info!(collection = %self.collection, promoted, "Promoted held batches");
        }
        Ok(promoted)
    }

    async fn append_failures_locked(&self, failures: &[ConversionFailure]) -> Result<()> {
        if failures.is_empty() {
            return Ok(());
        }
        let mut log = self.checkpoints.conversion_log(&self.collection).await?;
        log.append(failures.iter().map(ConversionFailure::log_line), self.max_log_lines);
        self.checkpoints.set_conversion_log(&self.collection, &log).await?;
        self.log_pending.store(true, Ordering::SeqCst);

        warn!(
            collection = %self.collection,
            new_failures = failures.len(),
            retained = log.lines.len(),
            omitted = log.omitted,
            "Conversion failures recorded"
        );
        Ok(())
    }

    async fn push_log_locked(&self) -> Result<bool> {
        if !self.log_pending.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let mut log: ConversionLog = self.checkpoints.conversion_log(&self.collection).await?;

        let path = self.staging_dir.join(CONVERSION_LOG_FILE);
        tokio::fs::write(&path, log.render())
            .await
            .map_err(|e| MirrorError::io(&path, e))?;
        self.push_file(&path).await?;

        log.unpushed = false;
        self.checkpoints.set_conversion_log(&self.collection, &log).await?;
        self.log_pending.store(false, Ordering::SeqCst);
        self.cleanup(&path).await;
        debug!(collection = %self.collection, lines = log.lines.len(), "Conversion log pushed");
        Ok(true)
    }

    /// Push the conversion log if an earlier run persisted lines it never
    /// pushed. Returns whether a push happened.
    pub async fn push_pending_log(&self) -> Result<bool> {
        let _guard = self.push_lock.lock().await;
        self.push_log_locked().await
    }

    /// Push the metadata descriptor unless it was already pushed.
    pub async fn push_metadata_once(&self) -> Result<bool> {
        if self.checkpoints.metadata_pushed(&self.collection).await? {
            return Ok(false);
        }
        let _guard = self.push_lock.lock().await;

        let path = self.staging_dir.join(METADATA_FILE);
        tokio::fs::write(&path, &self.metadata)
            .await
            .map_err(|e| MirrorError::io(&path, e))?;
        self.push_file(&path).await?;
        self.checkpoints.set_metadata_pushed(&self.collection).await?;
        self.cleanup(&path).await;

        info!(collection = %self.collection, "Metadata pushed");
        Ok(true)
    }
}

async fn discard_temp_files(dir: &Path) -> Result<usize> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| MirrorError::io(dir, e))?;
    let mut discarded = 0;
    while let Some(entry) = entries.next_entry().await.map_err(|e| MirrorError::io(dir, e))? {
        if entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
            let path = entry.path();
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| MirrorError::io(&path, e))?;
            discarded += 1;
        }
    }
    Ok(discarded)
}
