//! The import ledger.
//!
//! One `import_batches` row tracks each job: lifecycle status, progress
//! counters and recorded errors. The row is the only mutable state shared
//! between the HTTP surface and the pipeline, so every mutation here is a
//! guarded UPDATE - transitions carry a `WHERE status = …` clause (terminal
//! states are never revisited, concurrent requests cannot race the
//! pipeline) and counters use SQL-side increments so progress reads always
//! reflect committed state.

use crate::models::BatchStatus;
use rocket_db_pools::sqlx::{self, PgPool};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Upper bound on recorded error messages per batch.
const MAX_ERROR_MESSAGES: i32 = 10;

/// Recorded error messages are truncated to keep the row small.
const ERROR_MESSAGE_MAX_LEN: usize = 500;

const CANCEL_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct BatchLedger {
    pool: PgPool,
}

impl BatchLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert the ledger row in `pending`.
    pub async fn create(
        &self,
        batch_id: Uuid,
        user_id: i32,
        filename: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT INTO import_batches (id, user_id, filename) VALUES ($1, $2, $3)")
            .bind(batch_id)
            .bind(user_id)
            .bind(filename)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn status(&self, batch_id: Uuid) -> Result<Option<BatchStatus>, sqlx::Error> {
        sqlx::query_scalar("SELECT status FROM import_batches WHERE id = $1")
            .bind(batch_id)
            .fetch_optional(&self.pool)
            .await
    }

    /// `pending -> processing`, fired by the first dequeued batch.
    pub async fn mark_processing(&self, batch_id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE import_batches SET status = 'processing' WHERE id = $1 AND status = 'pending'",
        )
        .bind(batch_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Post-commit progress increment for one batch.
    pub async fn record_batch_committed(
        &self,
        batch_id: Uuid,
        inserted: i64,
        skipped: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE import_batches
               SET record_count = record_count + $2,
                   skipped_count = skipped_count + $3
               WHERE id = $1"#,
        )
        .bind(batch_id)
        .bind(inserted)
        .bind(skipped)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// A batch exhausted its retries: bump the error counter and append a
    /// truncated message, keeping the list bounded.
    pub async fn record_batch_error(
        &self,
        batch_id: Uuid,
        message: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE import_batches
               SET error_count = error_count + 1,
                   error_messages = CASE
                       WHEN COALESCE(array_length(error_messages, 1), 0) < $3
                       THEN array_append(error_messages, $2)
                       ELSE error_messages
                   END
               WHERE id = $1"#,
        )
        .bind(batch_id)
        .bind(truncate_message(message))
        .bind(MAX_ERROR_MESSAGES)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// `processing -> completed`.
    pub async fn mark_completed(&self, batch_id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"UPDATE import_batches
               SET status = 'completed', completed_at = NOW()
               WHERE id = $1 AND status = 'processing'"#,
        )
        .bind(batch_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Job-level fatal failure. Also reachable from `pending`: the
    /// extractor can die before any batch is dequeued.
    pub async fn mark_failed(&self, batch_id: Uuid, message: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"UPDATE import_batches
               SET status = 'failed',
                   completed_at = NOW(),
                   error_count = error_count + 1,
                   error_messages = CASE
                       WHEN COALESCE(array_length(error_messages, 1), 0) < $3
                       THEN array_append(error_messages, $2)
                       ELSE error_messages
                   END
               WHERE id = $1 AND status IN ('pending', 'processing')"#,
        )
        .bind(batch_id)
        .bind(truncate_message(message))
        .bind(MAX_ERROR_MESSAGES)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// External request: `processing -> cancelling`.
    pub async fn request_cancel(&self, batch_id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE import_batches SET status = 'cancelling' WHERE id = $1 AND status = 'processing'",
        )
        .bind(batch_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Pipeline acknowledgement: `cancelling -> cancelled`. Partial
    /// progress stays in place.
    pub async fn mark_cancelled(&self, batch_id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"UPDATE import_batches
               SET status = 'cancelled', completed_at = NOW()
               WHERE id = $1 AND status = 'cancelling'"#,
        )
        .bind(batch_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Poll the ledger row and fire the job's cancellation token when an
    /// external `cancelling` transition is observed. Resolves on its own
    /// once the row reaches a terminal state.
    pub fn spawn_cancellation_watcher(
        &self,
        batch_id: Uuid,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let ledger = self.clone();

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(CANCEL_POLL_INTERVAL).await;

                match ledger.status(batch_id).await {
                    Ok(Some(BatchStatus::Cancelling)) => {
                        log::info!("import {}: cancellation requested", batch_id);
                        cancel.cancel();
                        return;
                    }
                    Ok(Some(status)) if status.is_terminal() => return,
                    Ok(Some(_)) => {}
                    Ok(None) => return,
                    Err(e) => {
                        // Transient read failures must not kill the watcher.
                        log::debug!("import {}: cancellation poll failed: {}", batch_id, e);
                    }
                }
            }
        })
    }
}

fn truncate_message(message: &str) -> String {
    if message.len() <= ERROR_MESSAGE_MAX_LEN {
        return message.to_string();
    }

    let mut cut = ERROR_MESSAGE_MAX_LEN;
    while !message.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &message[..cut])
}

#[cfg(test)]
mod tests {
    use super::truncate_message;

    #[test]
    fn short_messages_pass_through() {
        assert_eq!(truncate_message("boom"), "boom");
    }

    #[test]
    fn long_messages_are_truncated_on_char_boundaries() {
        let long = "é".repeat(600);
        let truncated = truncate_message(&long);
        assert!(truncated.len() <= super::ERROR_MESSAGE_MAX_LEN + '…'.len_utf8());
        assert!(truncated.ends_with('…'));
    }
}
