// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Init sync: resumable key-ordered snapshot of one collection.
//!
//! # State Machine
//!
//! ```text
//! NOT_STARTED ──▶ IN_PROGRESS ──▶ COMPLETE
//!                     │  ▲
//!                     └──┘  one page per iteration:
//!                           fetch (last, upper] ─▶ normalize ─▶ push ─▶ persist last key
//! ```
//!
//! The upper bound is captured once, when the snapshot starts, and persisted.
//! Documents inserted after that point reach the output through the change
//! feed instead, tagged as upserts.
//!
//! A page is only acknowledged (its last key persisted) after its file was
//! pushed, so a crash at any point re-reads at most one page.

use super::CollectionContext;
use crate::batch::OutputBatch;
use crate::checkpoint::InitStatus;
use crate::error::{MirrorError, Result};
use crate::metrics;
use crate::resilience::retry_transient;
use crate::source::SourceRef;
use crate::value::DocKey;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Summary of one init sync run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitReport {
    /// Pages fetched and pushed in this run.
    pub pages: usize,
    /// Documents written in this run.
    pub documents: usize,
    /// Key the run resumed after, if it continued an earlier run.
    pub resumed_after: Option<DocKey>,
    /// The snapshot was already COMPLETE; nothing was read.
    pub already_complete: bool,
    /// Stopped by shutdown before reaching the upper bound.
    pub interrupted: bool,
}

/// Run the snapshot for one collection until COMPLETE, shutdown, or a fatal
/// error. `status_tx` mirrors every status transition for the delta loop.
pub async fn run_init_sync<S: SourceRef>(
    ctx: &CollectionContext<S>,
    status_tx: &watch::Sender<InitStatus>,
    shutdown_rx: &watch::Receiver<bool>,
) -> Result<InitReport> {
    let collection = ctx.collection.as_str();
    let checkpoints = &ctx.checkpoints;
    let mut report = InitReport::default();

    let status = checkpoints.init_status(collection).await?;
    if status == InitStatus::Complete {
        info!(collection, "Init sync already complete, skipping");
        status_tx.send_replace(InitStatus::Complete);
        metrics::set_init_status(collection, "COMPLETE");
        report.already_complete = true;
        return Ok(report);
    }

    if status == InitStatus::NotStarted {
        checkpoints.set_init_status(collection, InitStatus::InProgress).await?;
    }
    status_tx.send_replace(InitStatus::InProgress);
    metrics::set_init_status(collection, "IN_PROGRESS");

    let upper = match checkpoints.init_upper_bound(collection).await? {
        Some(upper) => Some(upper),
        None => {
            let max = retry_transient(&ctx.retry, "max_key", || ctx.source.max_key(collection)).await?;
            if let Some(max) = &max {
                checkpoints.set_init_upper_bound(collection, max).await?;
            }
            max
        }
    };

    let mut last = checkpoints.init_last_key(collection).await?;
    report.resumed_after = last.clone();

    match &upper {
        Some(upper) => {
            let total = ctx.source.count(collection).await.unwrap_or_else(|e| {
                warn!(collection, error = %e, "Could not count documents");
                0
            });
            info!(
                collection,
                upper = %upper,
                resumed_after = ?last.as_ref().map(ToString::to_string),
                total,
                page_size = ctx.init.batch_size,
                "Starting init sync"
            );
        }
        None => info!(collection, "Collection empty, nothing to snapshot"),
    }

    if let Some(upper) = &upper {
        while last.as_ref().map_or(true, |k| k < upper) {
            if *shutdown_rx.borrow() {
                info!(collection, pages = report.pages, "Init sync interrupted by shutdown");
                report.interrupted = true;
                return Ok(report);
            }

            let fetch_start = Instant::now();
            let after = last.as_ref();
            let page = retry_transient(&ctx.retry, "find_page", || {
                ctx.source.find_page(collection, after, upper, ctx.init.batch_size)
            })
            .await?;
            metrics::record_page_fetch(collection, fetch_start.elapsed());

            if page.is_empty() {
                debug!(collection, "Empty page, snapshot done");
                break;
            }

            let page_last = page
                .last()
                .and_then(|doc| doc.key())
                .ok_or_else(|| MirrorError::source_fatal("find_page", "document without a usable _id"))?;

            metrics::record_documents_read(collection, "init", page.len());
            let records = ctx.normalizer.normalize_page(collection, &page).await?;
            let batch = OutputBatch::from_snapshot(records);
            let seq = ctx.writer.flush_and_push(&batch).await?;
            checkpoints.set_init_last_key(collection, &page_last).await?;

            report.pages += 1;
            report.documents += page.len();
            debug!(collection, seq, rows = page.len(), last_key = %page_last, "Snapshot page pushed");
            last = Some(page_last);
        }
    }

    checkpoints.clear_init_last_key(collection).await?;
    checkpoints.set_init_status(collection, InitStatus::Complete).await?;
    status_tx.send_replace(InitStatus::Complete);
    metrics::set_init_status(collection, "COMPLETE");
    info!(collection, pages = report.pages, documents = report.documents, "Init sync complete");
    Ok(report)
}
