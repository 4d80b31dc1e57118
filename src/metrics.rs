//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Snapshot (init sync) progress
//! - Change feed consumption
//! - Normalization and conversion failures
//! - Output files and sink pushes
//! - Checkpoint store retries
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `mirror_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! No recorder is installed by the library; the embedding binary decides
//! where metrics go.
//!
//! # Usage
//!
//! ```rust,no_run
//! use mirror_engine::metrics;
//! use std::time::Duration;
//!
//! // In init sync after reading a page
//! metrics::record_documents_read("orders", "init", 100);
//!
//! // In the writer after a file is pushed
//! metrics::record_file_pushed("orders", 100, Duration::from_millis(50));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Source Metrics
// =============================================================================

/// Record documents read from the source (`phase` is `init` or `delta`).
pub fn record_documents_read(collection: &str, phase: &'static str, count: usize) {
    counter!(
        "mirror_documents_read_total",
        "collection" => collection.to_string(),
        "phase" => phase
    )
    .increment(count as u64);
}

/// Record a change event skipped because its operation is unsupported.
pub fn record_event_skipped(collection: &str, operation: &str) {
    counter!(
        "mirror_events_skipped_total",
        "collection" => collection.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record a snapshot page fetch latency.
pub fn record_page_fetch(collection: &str, duration: Duration) {
    histogram!("mirror_page_fetch_duration_seconds", "collection" => collection.to_string())
        .record(duration.as_secs_f64());
}

/// Set init status gauge (0=not started, 1=in progress, 2=complete).
pub fn set_init_status(collection: &str, status: &str) {
    let value = match status {
        "NOT_STARTED" => 0.0,
        "IN_PROGRESS" => 1.0,
        "COMPLETE" => 2.0,
        _ => -1.0,
    };
    gauge!("mirror_init_status", "collection" => collection.to_string()).set(value);
}

// =============================================================================
// Normalization Metrics
// =============================================================================

/// Record documents normalized.
pub fn record_normalized(collection: &str, count: usize) {
    counter!("mirror_documents_normalized_total", "collection" => collection.to_string())
        .increment(count as u64);
}

/// Record values that failed conversion and were substituted.
pub fn conversion_failures(collection: &str, count: usize) {
    if count > 0 {
        counter!("mirror_conversion_failures_total", "collection" => collection.to_string())
            .increment(count as u64);
    }
}

/// Record a column added to the schema after bootstrap.
pub fn record_schema_column_added(collection: &str) {
    counter!("mirror_schema_columns_added_total", "collection" => collection.to_string())
        .increment(1);
}

// =============================================================================
// Output Metrics
// =============================================================================

/// Record an output file pushed to the sink.
pub fn record_file_pushed(collection: &str, rows: usize, duration: Duration) {
    let collection = collection.to_string();
    counter!("mirror_files_pushed_total", "collection" => collection.clone()).increment(1);
    counter!("mirror_rows_written_total", "collection" => collection.clone())
        .increment(rows as u64);
    histogram!("mirror_flush_duration_seconds", "collection" => collection.clone())
        .record(duration.as_secs_f64());
    histogram!("mirror_batch_size", "collection" => collection).record(rows as f64);
}

/// Record a failed push attempt.
pub fn record_push_failure(collection: &str) {
    counter!("mirror_push_failures_total", "collection" => collection.to_string()).increment(1);
}

/// Record a delta batch held back while init sync is running.
pub fn record_batch_held(collection: &str, rows: usize) {
    counter!("mirror_batches_held_total", "collection" => collection.to_string()).increment(1);
    histogram!("mirror_held_batch_size", "collection" => collection.to_string())
        .record(rows as f64);
}

/// Set the next output sequence number for a collection.
pub fn set_output_seq(collection: &str, seq: u64) {
    gauge!("mirror_output_seq", "collection" => collection.to_string()).set(seq as f64);
}

// =============================================================================
// Checkpoint Metrics
// =============================================================================

/// Record checkpoint SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn checkpoint_retries_total(operation: &str) {
    counter!("mirror_checkpoint_retries_total", "operation" => operation.to_string()).increment(1);
}

// =============================================================================
// Engine Metrics
// =============================================================================

/// Record an error by type.
pub fn record_error(collection: &str, error_type: &str) {
    counter!(
        "mirror_errors_total",
        "collection" => collection.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Gauge for the number of collections being mirrored.
pub fn set_active_collections(count: usize) {
    gauge!("mirror_active_collections").set(count as f64);
}

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("mirror_engine_state").set(value);
}
