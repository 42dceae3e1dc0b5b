//! Bulk health-export ingestion pipeline.
//!
//! This module turns one uploaded export file into rows across the record
//! tables, without ever holding the file in memory and without letting a
//! bad fragment or a bad batch sink the whole job.
//!
//! # Architecture Overview
//!
//! ## Core Components
//!
//! - **`extract`**: opens the uploaded artifact (raw XML or zip archive) on
//!   a blocking worker and validates its completeness.
//!
//! - **`parser`**: streams the document with `quick-xml`, yielding typed
//!   records one logical unit at a time in a forgiving mode that skips and
//!   counts malformed fragments.
//!
//! - **`batch`**: the producer. Accumulates records into fixed-size
//!   batches and publishes them onto a bounded channel; blocked sends are
//!   the backpressure that caps memory.
//!
//! - **`loader`**: the consumer pool. Each worker drains batches and
//!   performs dedup-aware bulk writes (temp-table staging + merge with
//!   skip-on-conflict; parameterized inserts for JSONB-bearing workouts),
//!   one transaction per batch.
//!
//! - **`ledger`**: the persistent `import_batches` row - lifecycle state
//!   machine, progress counters updated post-commit, and the cancellation
//!   watcher that turns an external `cancelling` status into a fired
//!   [`CancellationToken`].
//!
//! ## Data Flow
//!
//! 1. **Extract**: locate and validate the export XML (`failed` on a
//!    corrupt or truncated artifact)
//! 2. **Parse + batch**: one blocking producer streams records into
//!    25K-record batches
//! 3. **Channel**: capacity 4; producer suspends on full, consumers on
//!    empty; closing it is the only termination signal
//! 4. **Load**: 3 workers merge batches into the record tables with
//!    dedup keys absorbing duplicates
//! 5. **Finalize**: `completed`, `cancelled`, or `failed` - exactly one
//!    terminal transition
//!
//! ## Cancellation
//!
//! Cooperative, never preemptive: producer and consumers check the token
//! at batch boundaries, in-flight batches finish and commit, and committed
//! progress is never rolled back. Latency is bounded by one batch per
//! active worker.

pub mod batch;
pub mod extract;
pub mod ledger;
pub mod loader;
pub mod parser;

use batch::{run_producer, ProducerStats, BATCH_SIZE, CHANNEL_CAPACITY};
use extract::SourceKind;
use ledger::BatchLedger;
use loader::{loader_pool_size, BatchLoader, SourceCache};
use rocket_db_pools::sqlx::PgPool;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Directory where uploaded artifacts (and their extracted contents) live.
pub fn upload_dir() -> PathBuf {
    std::env::var("UPLOAD_DIR")
        .unwrap_or_else(|_| "./uploads".to_string())
        .into()
}

/// Stored artifact path for a batch, if one exists. Checked in declared
/// preference order so reprocessing picks the original upload back up.
pub fn stored_artifact(batch_id: Uuid) -> Option<(PathBuf, SourceKind)> {
    for kind in [SourceKind::Xml, SourceKind::Archive] {
        let path = upload_dir().join(format!("{}.{}", batch_id, kind.extension()));
        if path.exists() {
            return Some((path, kind));
        }
    }
    None
}

/// Per-job context passed by reference into producer and consumers: the
/// batch identity, the cooperative cancellation signal, and the
/// first-batch-dequeued latch. Deliberately the only in-process state the
/// pipeline shares.
pub struct ImportContext {
    pub batch_id: Uuid,
    pub user_id: i32,
    pub cancel: CancellationToken,
    started: AtomicBool,
}

impl ImportContext {
    pub fn new(batch_id: Uuid, user_id: i32) -> Self {
        Self {
            batch_id,
            user_id,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    /// True exactly once, for the worker that dequeues the first batch.
    pub(crate) fn mark_started(&self) -> bool {
        !self.started.swap(true, Ordering::SeqCst)
    }
}

/// Run one import job end to end. Spawned in the background by the upload
/// and reprocess endpoints; every outcome is reported through the ledger,
/// nothing propagates to the caller.
pub async fn run_import(
    pool: PgPool,
    user_id: i32,
    batch_id: Uuid,
    upload_path: PathBuf,
    kind: SourceKind,
) {
    let ledger = BatchLedger::new(pool.clone());

    log::info!(
        "import {}: starting ({})",
        batch_id,
        upload_path.display()
    );

    let xml_path = match extract::open_export(upload_path, kind).await {
        Ok(path) => path,
        Err(e) => {
            log::error!("import {}: {}", batch_id, e);
            let _ = ledger.mark_failed(batch_id, &e.to_string()).await;
            return;
        }
    };

    let ctx = Arc::new(ImportContext::new(batch_id, user_id));
    let watcher = ledger.spawn_cancellation_watcher(batch_id, ctx.cancel.clone());

    let sources = Arc::new(SourceCache::new());
    if let Err(e) = sources.warm(&pool).await {
        // Cache misses fall back to per-batch upserts.
        log::warn!("import {}: source cache warm-up failed: {}", batch_id, e);
    }

    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let rx = Arc::new(Mutex::new(rx));

    let loader = Arc::new(BatchLoader::new(pool.clone(), sources));
    let mut workers = Vec::new();
    for worker_id in 0..loader_pool_size() {
        workers.push(tokio::spawn(Arc::clone(&loader).run_worker(
            worker_id,
            Arc::clone(&rx),
            Arc::clone(&ctx),
            ledger.clone(),
        )));
    }
    // The workers own the receiver from here; if they all stop, the
    // producer's sends fail instead of blocking forever.
    drop(rx);

    let producer_ctx = Arc::clone(&ctx);
    let producer = tokio::task::spawn_blocking(move || -> Result<ProducerStats, String> {
        let file = std::fs::File::open(&xml_path)
            .map_err(|e| format!("cannot open export {}: {}", xml_path.display(), e))?;
        let parser = parser::ExportParser::new(BufReader::new(file), producer_ctx.user_id);
        run_producer(parser, tx, &producer_ctx.cancel, BATCH_SIZE).map_err(|e| e.to_string())
    });

    let producer_result = producer.await;

    for worker in workers {
        if let Err(e) = worker.await {
            log::error!("import {}: loader task failed: {}", batch_id, e);
        }
    }

    watcher.abort();

    finalize(&ledger, &ctx, producer_result).await;
}

async fn finalize(
    ledger: &BatchLedger,
    ctx: &ImportContext,
    producer_result: Result<Result<ProducerStats, String>, tokio::task::JoinError>,
) {
    let batch_id = ctx.batch_id;

    let fatal = match producer_result {
        Ok(Ok(stats)) => {
            log::info!(
                "import {}: pipeline drained - {} records parsed, {} skipped",
                batch_id,
                stats.records,
                stats.skipped
            );
            None
        }
        Ok(Err(message)) => Some(message),
        Err(join_error) => Some(format!("import task panicked: {}", join_error)),
    };

    if let Some(message) = fatal {
        log::error!("import {}: {}", batch_id, message);
        if !ledger.mark_failed(batch_id, &message).await.unwrap_or(false) {
            // Already moved to cancelling by an external request; honor it.
            let _ = ledger.mark_cancelled(batch_id).await;
        }
        return;
    }

    if ctx.cancel.is_cancelled() {
        if ledger.mark_cancelled(batch_id).await.unwrap_or(false) {
            log::info!("import {}: cancelled, partial progress kept", batch_id);
        }
        return;
    }

    match ledger.mark_completed(batch_id).await {
        Ok(true) => log::info!("import {}: completed", batch_id),
        Ok(false) => {
            // The row left `processing` under us (e.g. a cancel request
            // that raced the final batch); resolve the cancelling branch.
            if ledger.mark_cancelled(batch_id).await.unwrap_or(false) {
                log::info!("import {}: cancelled at the finish line", batch_id);
            } else {
                log::warn!("import {}: no terminal transition applied", batch_id);
            }
        }
        Err(e) => log::error!("import {}: failed to finalize: {}", batch_id, e),
    }
}

/// Delete every row carrying this batch id, in FK-safe order. Used by the
/// delete and reprocess endpoints; callers are responsible for the
/// lifecycle guard (never while `processing`/`cancelling`).
pub async fn purge_batch_records(
    pool: &PgPool,
    batch_id: Uuid,
) -> Result<(), rocket_db_pools::sqlx::Error> {
    use rocket_db_pools::sqlx;

    let mut tx = pool.begin().await?;

    sqlx::query(
        "DELETE FROM workout_route_points
         WHERE workout_id IN (SELECT id FROM workouts WHERE batch_id = $1)",
    )
    .bind(batch_id)
    .execute(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM workouts WHERE batch_id = $1")
        .bind(batch_id)
        .execute(&mut *tx)
        .await?;

    sqlx::query("DELETE FROM health_samples WHERE batch_id = $1")
        .bind(batch_id)
        .execute(&mut *tx)
        .await?;

    sqlx::query("DELETE FROM category_events WHERE batch_id = $1")
        .bind(batch_id)
        .execute(&mut *tx)
        .await?;

    sqlx::query("DELETE FROM activity_summaries WHERE batch_id = $1")
        .bind(batch_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

/// Best-effort removal of a batch's stored artifacts after deletion.
pub fn remove_stored_artifacts(batch_id: Uuid) {
    let dir = upload_dir();
    for name in [
        format!("{}.xml", batch_id),
        format!("{}.zip", batch_id),
    ] {
        let path = dir.join(name);
        if path.exists() {
            if let Err(e) = std::fs::remove_file(&path) {
                log::warn!("failed to remove {}: {}", path.display(), e);
            }
        }
    }

    let extracted = dir.join(batch_id.to_string());
    if extracted.is_dir() {
        if let Err(e) = std::fs::remove_dir_all(&extracted) {
            log::warn!("failed to remove {}: {}", extracted.display(), e);
        }
    }
}
