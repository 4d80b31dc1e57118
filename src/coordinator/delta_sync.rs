//! Delta sync: change feed consumption with batch flushing.
//!
//! Each collection has one long-lived delta task that:
//! 1. Opens the change feed from the persisted resume token, or at "now"
//!    on a first run, persisting the feed's opening position before any
//!    snapshot work so a crash during init replays every change since
//! 2. Spawns the init sync as a child task, after the feed is open so no
//!    change made during the snapshot is missed
//! 3. Normalizes each event and tags it with a row marker
//! 4. Flushes on size (always) or age (only once init is complete)
//! 5. Holds flushed batches while init runs; pushes them in capture order
//!    the first time it observes init COMPLETE
//!
//! # Graceful Shutdown
//!
//! When a shutdown signal is received:
//! 1. The loop stops reading new events immediately (via tokio::select!)
//! 2. A pending batch is pushed if init is complete, otherwise dropped (the
//!    feed replays it from the last persisted resume token)
//! 3. The init child finishes its current page and exits
//!
//! Dropping the delta task aborts the init child with it.

use super::init_sync::run_init_sync;
use super::CollectionContext;
use crate::batch::{OperationKind, PendingBatch, RowMarker};
use crate::checkpoint::InitStatus;
use crate::error::{MirrorError, Result};
use crate::metrics;
use crate::resilience::retry_transient;
use crate::source::{ChangeEvent, SourceRef};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Run the delta loop for one collection until shutdown or a fatal error.
///
/// A fatal init error ends the delta loop too: the collection is reported
/// failed and a restart resumes both from their checkpoints.
pub async fn run_delta_sync<S: SourceRef>(
    ctx: Arc<CollectionContext<S>>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let collection = ctx.collection.clone();
    let checkpoints = &ctx.checkpoints;

    let resume = checkpoints.resume_token(&collection).await?;
    info!(
        collection = %collection,
        resume_token = ?resume.as_ref().map(|t| t.as_str().to_string()),
        "Opening change feed"
    );
    let mut feed = retry_transient(&ctx.retry, "watch", || {
        ctx.source.watch(&collection, resume.clone())
    })
    .await?;

    if resume.is_none() {
        match feed.position() {
            Some(start) => {
                checkpoints.set_resume_token(&collection, &start).await?;
                info!(collection = %collection, position = %start, "Persisted change feed start position");
            }
            None => warn!(
                collection = %collection,
                "Change feed reports no position; changes before the first push cannot be replayed after a crash"
            ),
        }
    }

    // Seed from the checkpoint so a completed snapshot never re-tags events.
    let (status_tx, status_rx) = watch::channel(checkpoints.init_status(&collection).await?);

    let mut children = JoinSet::new();
    {
        let ctx = Arc::clone(&ctx);
        let shutdown_rx = shutdown_rx.clone();
        let span = info_span!("init_sync", collection = %collection);
        children.spawn(
            async move { run_init_sync(&ctx, &status_tx, &shutdown_rx).await }.instrument(span),
        );
    }

    let poll_interval = ctx.delta.poll_interval_duration();
    let mut pending = PendingBatch::new(ctx.delta.batch_config());
    let mut promoted = false;

    loop {
        let init_complete = *status_rx.borrow() == InitStatus::Complete;

        // Post-init flush: first iteration that observes COMPLETE.
        if init_complete && !promoted {
            let pushed = ctx.writer.promote_held().await?;
            promoted = true;
            info!(collection = %collection, pushed, "Init complete, held batches pushed");
        }
        let init_in_progress = !promoted;

        if pending.should_flush(init_in_progress) {
            flush(&ctx, &mut pending, init_in_progress).await?;
        }

        if *shutdown_rx.borrow() {
            info!(collection = %collection, "Shutdown signal received");
            break;
        }

        let wait = match pending.time_until_due() {
            Some(due) if !init_in_progress => due.min(poll_interval),
            _ => poll_interval,
        };

        tokio::select! {
            biased;

            // Priority: check shutdown first
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!(collection = %collection, "Shutdown signal received");
                    break;
                }
            }

            Some(joined) = children.join_next(), if !children.is_empty() => {
                match joined {
                    Ok(Ok(report)) => {
                        debug!(collection = %collection, ?report, "Init task finished");
                    }
                    Ok(Err(e)) => {
                        error!(collection = %collection, error = %e, "Init sync failed");
                        metrics::record_error(&collection, "init_sync");
                        return Err(e);
                    }
                    Err(join_err) => {
                        return Err(MirrorError::Internal(format!("init task panicked: {}", join_err)));
                    }
                }
            }

            event = feed.next_event(wait) => {
                match event {
                    Ok(Some(event)) => {
                        apply_event(&ctx, &mut pending, event, init_in_progress).await?;
                    }
                    Ok(None) => {}
                    Err(e) if e.is_retryable() => {
                        warn!(collection = %collection, error = %e, "Change feed read failed, retrying");
                        tokio::time::sleep(ctx.retry.initial_delay).await;
                    }
                    Err(e) => {
                        error!(collection = %collection, error = %e, "Change feed lost");
                        metrics::record_error(&collection, "change_feed");
                        return Err(e);
                    }
                }
            }
        }
    }

    // Final flush
    if promoted {
        if let Some(batch) = pending.take() {
            let rows = batch.len();
            ctx.writer.flush_and_push(&batch).await?;
            info!(collection = %collection, rows, "Final batch pushed on shutdown");
        }
    } else if !pending.is_empty() {
        info!(
            collection = %collection,
            rows = pending.len(),
            "Dropping unflushed batch; it will be replayed from the change feed"
        );
    }

    while let Some(joined) = children.join_next().await {
        match joined {
            Ok(Ok(report)) => debug!(collection = %collection, ?report, "Init task finished"),
            Ok(Err(e)) => warn!(collection = %collection, error = %e, "Init task failed during shutdown"),
            Err(e) => warn!(collection = %collection, error = %e, "Init task panicked during shutdown"),
        }
    }

    info!(collection = %collection, "Delta sync stopped");
    Ok(())
}

/// Normalize one event into the pending batch.
async fn apply_event<S: SourceRef>(
    ctx: &CollectionContext<S>,
    pending: &mut PendingBatch,
    event: ChangeEvent,
    init_in_progress: bool,
) -> Result<()> {
    let collection = ctx.collection.as_str();
    let Some(op) = OperationKind::parse(&event.operation) else {
        warn!(collection, operation = %event.operation, "Skipping unsupported change event");
        metrics::record_event_skipped(collection, &event.operation);
        return Ok(());
    };

    let document = match op {
        OperationKind::Delete => event.document_key,
        OperationKind::Insert | OperationKind::Update => match event.full_document {
            Some(doc) => doc,
            None => {
                warn!(collection, operation = op.as_str(), "Event without full document, writing key only");
                event.document_key
            }
        },
    };

    let record = ctx.normalizer.normalize(collection, &document).await?;
    let marker = RowMarker::for_operation(op, init_in_progress);
    debug!(collection, operation = op.as_str(), marker = marker.0, "Change event buffered");
    pending.append(record, marker, event.resume_token);
    metrics::record_documents_read(collection, "delta", 1);
    Ok(())
}

/// Take the pending batch and hold it (init running) or push it.
async fn flush<S: SourceRef>(ctx: &CollectionContext<S>, pending: &mut PendingBatch, hold: bool) -> Result<()> {
    let Some(batch) = pending.take() else {
        return Ok(());
    };
    if hold {
        ctx.writer.hold(&batch).await
    } else {
        ctx.writer.flush_and_push(&batch).await.map(|_| ())
    }
}
