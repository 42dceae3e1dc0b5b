//! Import lifecycle endpoints.
//!
//! The upload endpoint stores the artifact, creates the `pending` ledger
//! row, and returns immediately with the batch id - the pipeline itself
//! runs as a detached background task. Everything else is a thin,
//! lifecycle-guarded view over the ledger row: list, poll, cancel, delete,
//! reprocess. All failure visibility goes through the polled status, never
//! through these handlers.

use crate::auth::CurrentUser;
use crate::error::ApiError;
use crate::ingest::extract::SourceKind;
use crate::ingest::ledger::BatchLedger;
use crate::ingest::{self, run_import};
use crate::models::{BatchStatus, ImportBatch};
use chrono::{DateTime, Utc};
use rocket::form::Form;
use rocket::fs::TempFile;
use rocket::response::status::Accepted;
use rocket::serde::json::Json;
use rocket::{delete, get, post, FromForm, State};
use rocket_db_pools::sqlx::{self, PgPool};
use rocket_okapi::okapi::schemars::JsonSchema;
use rocket_okapi::openapi;
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

/// Multipart payload for export uploads.
#[derive(FromForm)]
pub struct ImportUpload<'r> {
    pub file: TempFile<'r>,
}

/// Response returned when an import has been accepted for processing.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ImportStartedResponse {
    /// Identifier to poll for progress.
    #[serde(rename = "batchId")]
    pub batch_id: Uuid,
    /// Lifecycle status at accept time.
    pub status: BatchStatus,
}

/// Live view of one import batch.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ImportStatusResponse {
    #[serde(rename = "batchId")]
    pub batch_id: Uuid,
    pub filename: String,
    pub status: BatchStatus,
    /// Committed, non-duplicate records so far.
    #[serde(rename = "recordCount")]
    pub record_count: i64,
    /// Malformed fragments plus dedup conflicts.
    #[serde(rename = "skippedCount")]
    pub skipped_count: i64,
    /// Batches dropped after exhausting retries.
    #[serde(rename = "errorCount")]
    pub error_count: i32,
    #[serde(rename = "errorMessages")]
    pub error_messages: Vec<String>,
    #[serde(rename = "importedAt")]
    pub imported_at: DateTime<Utc>,
    #[serde(rename = "completedAt")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<ImportBatch> for ImportStatusResponse {
    fn from(batch: ImportBatch) -> Self {
        Self {
            batch_id: batch.id,
            filename: batch.filename,
            status: batch.status,
            record_count: batch.record_count,
            skipped_count: batch.skipped_count,
            error_count: batch.error_count,
            error_messages: batch.error_messages,
            imported_at: batch.imported_at,
            completed_at: batch.completed_at,
        }
    }
}

/// Simple message wrapper for acknowledgement responses.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct MessageResponse {
    /// Response text.
    pub message: String,
}

const SELECT_BATCH: &str =
    "SELECT id, user_id, filename, status, record_count, skipped_count, error_count, \
     error_messages, imported_at, completed_at \
     FROM import_batches WHERE id = $1 AND user_id = $2";

async fn fetch_batch(
    pool: &PgPool,
    batch_id: Uuid,
    user_id: i32,
) -> Result<ImportBatch, ApiError> {
    let batch: Option<ImportBatch> = sqlx::query_as(SELECT_BATCH)
        .bind(batch_id)
        .bind(user_id)
        .fetch_optional(pool)
        .await?;

    batch.ok_or_else(|| ApiError::NotFound("Import batch not found".to_string()))
}

/// Accept an export upload and begin processing it in the background.
///
/// Multipart uploads have no schema derivation, so this route is excluded
/// from the generated OpenAPI document.
#[openapi(skip)]
#[post("/imports", data = "<upload>")]
pub async fn start_import(
    mut upload: Form<ImportUpload<'_>>,
    user: CurrentUser,
    pool: &State<PgPool>,
) -> Result<Accepted<Json<ImportStartedResponse>>, ApiError> {
    let Some(filename) = upload
        .file
        .raw_name()
        .map(|n| n.dangerous_unsafe_unsanitized_raw().as_str().to_string())
    else {
        return Err(ApiError::BadRequest("Filename is required".to_string()));
    };

    // The raw name is display-only; the stored path below is derived from
    // the batch id, never from client input.
    let extension = Path::new(&filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    let Some(kind) = SourceKind::from_extension(&extension) else {
        return Err(ApiError::BadRequest(format!(
            "Unsupported file type: .{extension}. Accepted: .xml, .zip"
        )));
    };

    let batch_id = Uuid::new_v4();
    let dest = ingest::upload_dir().join(format!("{}.{}", batch_id, kind.extension()));

    upload
        .file
        .copy_to(&dest)
        .await
        .map_err(|e| ApiError::InternalError(format!("Failed to store upload: {e}")))?;

    let ledger = BatchLedger::new(pool.inner().clone());
    ledger.create(batch_id, user.id, &filename).await?;

    log::info!(
        "user {}: accepted import {} ({}, {:?})",
        user.id,
        batch_id,
        filename,
        kind
    );

    tokio::spawn(run_import(
        pool.inner().clone(),
        user.id,
        batch_id,
        dest,
        kind,
    ));

    Ok(Accepted(Json(ImportStartedResponse {
        batch_id,
        status: BatchStatus::Pending,
    })))
}

/// List the current user's import batches, most recent first.
#[openapi(tag = "Imports")]
#[get("/imports")]
pub async fn list_imports(
    user: CurrentUser,
    pool: &State<PgPool>,
) -> Result<Json<Vec<ImportStatusResponse>>, ApiError> {
    let batches: Vec<ImportBatch> = sqlx::query_as(
        "SELECT id, user_id, filename, status, record_count, skipped_count, error_count, \
         error_messages, imported_at, completed_at \
         FROM import_batches WHERE user_id = $1 ORDER BY imported_at DESC",
    )
    .bind(user.id)
    .fetch_all(pool.inner())
    .await?;

    Ok(Json(batches.into_iter().map(Into::into).collect()))
}

/// Poll the live status and counters of one import batch.
#[openapi(tag = "Imports")]
#[get("/imports/<batch_id>")]
pub async fn get_import_status(
    batch_id: Uuid,
    user: CurrentUser,
    pool: &State<PgPool>,
) -> Result<Json<ImportStatusResponse>, ApiError> {
    let batch = fetch_batch(pool.inner(), batch_id, user.id).await?;
    Ok(Json(batch.into()))
}

/// Request cooperative cancellation of a running import.
///
/// Idempotent once the batch is already cancelling or terminal; only a
/// `pending` batch (nothing dequeued yet) rejects the request.
#[openapi(tag = "Imports")]
#[post("/imports/<batch_id>/cancel")]
pub async fn cancel_import(
    batch_id: Uuid,
    user: CurrentUser,
    pool: &State<PgPool>,
) -> Result<Json<ImportStatusResponse>, ApiError> {
    let batch = fetch_batch(pool.inner(), batch_id, user.id).await?;

    match batch.status {
        BatchStatus::Pending => {
            return Err(ApiError::Conflict(
                "Only processing imports can be cancelled".to_string(),
            ));
        }
        BatchStatus::Processing => {
            let ledger = BatchLedger::new(pool.inner().clone());
            ledger.request_cancel(batch_id).await?;
        }
        // Already cancelling or terminal: nothing to do.
        _ => {}
    }

    let batch = fetch_batch(pool.inner(), batch_id, user.id).await?;
    Ok(Json(batch.into()))
}

/// Delete an import batch and every row it produced.
#[openapi(tag = "Imports")]
#[delete("/imports/<batch_id>")]
pub async fn delete_import(
    batch_id: Uuid,
    user: CurrentUser,
    pool: &State<PgPool>,
) -> Result<Json<MessageResponse>, ApiError> {
    let batch = fetch_batch(pool.inner(), batch_id, user.id).await?;

    if batch.status.is_active() {
        return Err(ApiError::Conflict(
            "Cannot delete a batch that is currently processing".to_string(),
        ));
    }

    ingest::purge_batch_records(pool.inner(), batch_id).await?;

    sqlx::query("DELETE FROM import_batches WHERE id = $1")
        .bind(batch_id)
        .execute(pool.inner())
        .await?;

    ingest::remove_stored_artifacts(batch_id);

    log::info!("user {}: deleted import {}", user.id, batch_id);

    Ok(Json(MessageResponse {
        message: format!("Deleted import batch {batch_id}"),
    }))
}

/// Re-run an import from its stored artifact.
///
/// Purges the batch's rows, resets its counters to `pending`, and feeds
/// the original file back through the pipeline.
#[openapi(tag = "Imports")]
#[post("/imports/<batch_id>/reprocess")]
pub async fn reprocess_import(
    batch_id: Uuid,
    user: CurrentUser,
    pool: &State<PgPool>,
) -> Result<Accepted<Json<ImportStartedResponse>>, ApiError> {
    let batch = fetch_batch(pool.inner(), batch_id, user.id).await?;

    if batch.status.is_active() {
        return Err(ApiError::Conflict(
            "Cannot reprocess a batch that is currently processing".to_string(),
        ));
    }

    let Some((path, kind)) = ingest::stored_artifact(batch_id) else {
        return Err(ApiError::NotFound(
            "No stored export file found for this batch. \
             The original file may have been cleaned up."
                .to_string(),
        ));
    };

    ingest::purge_batch_records(pool.inner(), batch_id).await?;

    sqlx::query(
        r#"UPDATE import_batches
           SET status = 'pending', record_count = 0, skipped_count = 0,
               error_count = 0, error_messages = '{}', completed_at = NULL
           WHERE id = $1"#,
    )
    .bind(batch_id)
    .execute(pool.inner())
    .await?;

    log::info!("user {}: reprocessing import {}", user.id, batch_id);

    tokio::spawn(run_import(
        pool.inner().clone(),
        user.id,
        batch_id,
        path,
        kind,
    ));

    Ok(Accepted(Json(ImportStartedResponse {
        batch_id,
        status: BatchStatus::Pending,
    })))
}
