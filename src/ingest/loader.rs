//! Consumer workers and dedup-aware bulk writes.
//!
//! A small fixed pool of workers drains the bounded channel. Each batch is
//! written inside one short-lived transaction:
//!
//! 1. Exporting sources are resolved through a shared in-memory cache,
//!    with cache misses bulk-upserted and re-selected for their ids.
//! 2. Columnar tables (samples, category events, summaries, route points)
//!    are staged into a `CREATE TEMP TABLE … ON COMMIT DROP` relation via
//!    UNNEST array inserts, then merged into the permanent table with
//!    `ON CONFLICT … DO NOTHING`. The merge's `rows_affected` is the
//!    inserted count; the remainder of the batch was duplicate rows.
//! 3. Workouts carry free-form JSONB metadata, which does not fit the
//!    columnar staging path, so they use chunked multi-row parameterized
//!    inserts with the same skip-on-conflict semantics.
//!
//! Ledger counters are incremented strictly after the batch commits, so a
//! concurrent status poll never reflects uncommitted work. A failing batch
//! is retried a bounded number of times; exhaustion records the error and
//! the worker moves on - one bad batch must not sink the import.

use super::batch::RecordBatch;
use super::ledger::BatchLedger;
use super::parser::SourceRef;
use super::ImportContext;
use dashmap::DashMap;
use rocket_db_pools::sqlx::{self, PgPool, Postgres, QueryBuilder};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Receiver;
use tokio::sync::Mutex;

/// Worker pool size. Fixed and small - independent of input size - and
/// clamped to the host so tiny machines do not oversubscribe the DB pool.
pub const LOADER_POOL_SIZE: usize = 3;

const MAX_BATCH_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Multi-row insert chunk for workouts, well under the Postgres bind limit.
const WORKOUT_INSERT_CHUNK: usize = 1_000;

/// Effective pool size for this host.
pub fn loader_pool_size() -> usize {
    LOADER_POOL_SIZE.min(num_cpus::get()).max(1)
}

/// In-memory map of `(name, bundle_id)` to `data_sources.id`, shared by
/// all workers of a job so repeat sources skip the upsert round-trip.
#[derive(Default)]
pub struct SourceCache {
    entries: DashMap<(String, Option<String>), i32>,
}

impl SourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-load every known source so a typical re-import never misses.
    pub async fn warm(&self, pool: &PgPool) -> Result<(), sqlx::Error> {
        let rows: Vec<(i32, String, Option<String>)> =
            sqlx::query_as("SELECT id, name, bundle_id FROM data_sources")
                .fetch_all(pool)
                .await?;

        for (id, name, bundle_id) in rows {
            self.entries.insert((name, bundle_id), id);
        }

        log::debug!("source cache warmed with {} entries", self.entries.len());
        Ok(())
    }

    fn get(&self, source: &SourceRef) -> Option<i32> {
        self.entries
            .get(&(source.name.clone(), source.bundle_id.clone()))
            .map(|entry| *entry)
    }
}

struct BatchOutcome {
    inserted: i64,
    skipped: i64,
}

pub struct BatchLoader {
    pool: PgPool,
    sources: Arc<SourceCache>,
}

impl BatchLoader {
    pub fn new(pool: PgPool, sources: Arc<SourceCache>) -> Self {
        Self { pool, sources }
    }

    /// Worker loop: pull one batch at a time until the channel closes or
    /// cancellation is observed. Batches still queued when the signal
    /// arrives are dropped - only in-flight work finishes and commits.
    pub async fn run_worker(
        self: Arc<Self>,
        worker_id: usize,
        rx: Arc<Mutex<Receiver<RecordBatch>>>,
        ctx: Arc<ImportContext>,
        ledger: BatchLedger,
    ) {
        log::debug!("loader {}: started", worker_id);

        loop {
            if ctx.cancel.is_cancelled() {
                log::info!("loader {}: cancellation observed, stopping", worker_id);
                break;
            }

            let batch = { rx.lock().await.recv().await };
            let Some(batch) = batch else {
                break;
            };

            if ctx.mark_started() {
                if let Err(e) = ledger.mark_processing(ctx.batch_id).await {
                    log::warn!("loader {}: failed to mark batch processing: {}", worker_id, e);
                }
            }

            self.process_batch(worker_id, &ctx, &ledger, batch).await;
        }

        log::debug!("loader {}: finished", worker_id);
    }

    async fn process_batch(
        &self,
        worker_id: usize,
        ctx: &ImportContext,
        ledger: &BatchLedger,
        batch: RecordBatch,
    ) {
        let units = batch.record_units();

        for attempt in 1..=MAX_BATCH_ATTEMPTS {
            match self.write_batch(ctx, &batch).await {
                Ok(outcome) => {
                    let skipped = outcome.skipped + batch.parse_skipped as i64;
                    if let Err(e) = ledger
                        .record_batch_committed(ctx.batch_id, outcome.inserted, skipped)
                        .await
                    {
                        log::warn!("loader {}: progress update failed: {}", worker_id, e);
                    }

                    log::debug!(
                        "loader {}: committed batch of {} records ({} inserted, {} skipped)",
                        worker_id,
                        units,
                        outcome.inserted,
                        skipped
                    );
                    return;
                }
                Err(e) if attempt < MAX_BATCH_ATTEMPTS => {
                    log::warn!(
                        "loader {}: batch attempt {}/{} failed: {}",
                        worker_id,
                        attempt,
                        MAX_BATCH_ATTEMPTS,
                        e
                    );
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                }
                Err(e) => {
                    log::error!(
                        "loader {}: batch of {} records dropped after {} attempts: {}",
                        worker_id,
                        units,
                        MAX_BATCH_ATTEMPTS,
                        e
                    );
                    let message = format!("batch of {} records failed: {}", units, e);
                    if let Err(err) = ledger.record_batch_error(ctx.batch_id, &message).await {
                        log::warn!("loader {}: error update failed: {}", worker_id, err);
                    }
                    return;
                }
            }
        }
    }

    /// One batch, one transaction, one commit.
    async fn write_batch(
        &self,
        ctx: &ImportContext,
        batch: &RecordBatch,
    ) -> Result<BatchOutcome, sqlx::Error> {
        let source_ids = self.resolve_sources(batch).await?;

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0i64;

        inserted += self.merge_samples(&mut tx, ctx, batch, &source_ids).await?;
        inserted += self.merge_categories(&mut tx, ctx, batch, &source_ids).await?;
        inserted += self.merge_summaries(&mut tx, ctx, batch).await?;
        inserted += self.insert_workouts(&mut tx, ctx, batch, &source_ids).await?;
        self.merge_route_points(&mut tx, batch).await?;

        tx.commit().await?;

        let attempted = batch.record_units() as i64;
        Ok(BatchOutcome {
            inserted,
            skipped: attempted - inserted,
        })
    }

    /// Resolve every distinct source in the batch to its row id, creating
    /// missing rows with an idempotent bulk upsert. Runs against the pool
    /// (outside the batch transaction) so the cache never holds ids from a
    /// rolled-back insert.
    async fn resolve_sources(
        &self,
        batch: &RecordBatch,
    ) -> Result<HashMap<(String, Option<String>), i32>, sqlx::Error> {
        let mut distinct: HashSet<&SourceRef> = HashSet::new();
        for source in batch
            .samples
            .iter()
            .filter_map(|s| s.source.as_ref())
            .chain(batch.categories.iter().filter_map(|c| c.source.as_ref()))
            .chain(batch.workouts.iter().filter_map(|w| w.source.as_ref()))
        {
            distinct.insert(source);
        }

        let mut resolved = HashMap::new();
        let mut missing: Vec<&SourceRef> = Vec::new();

        for source in distinct {
            match self.sources.get(source) {
                Some(id) => {
                    resolved.insert((source.name.clone(), source.bundle_id.clone()), id);
                }
                None => missing.push(source),
            }
        }

        if missing.is_empty() {
            return Ok(resolved);
        }

        let names: Vec<String> = missing.iter().map(|s| s.name.clone()).collect();
        let bundle_ids: Vec<Option<String>> = missing.iter().map(|s| s.bundle_id.clone()).collect();
        let device_infos: Vec<Option<String>> =
            missing.iter().map(|s| s.device_info.clone()).collect();

        sqlx::query(
            r#"INSERT INTO data_sources (name, bundle_id, device_info)
               SELECT name, bundle_id, device_info
               FROM UNNEST($1::text[], $2::text[], $3::text[]) AS t(name, bundle_id, device_info)
               ON CONFLICT (name, bundle_id) DO NOTHING"#,
        )
        .bind(&names)
        .bind(&bundle_ids)
        .bind(&device_infos)
        .execute(&self.pool)
        .await?;

        let rows: Vec<(i32, String, Option<String>)> = sqlx::query_as(
            "SELECT id, name, bundle_id FROM data_sources WHERE name = ANY($1)",
        )
        .bind(&names)
        .fetch_all(&self.pool)
        .await?;

        for (id, name, bundle_id) in rows {
            self.sources
                .entries
                .insert((name.clone(), bundle_id.clone()), id);
            resolved.insert((name, bundle_id), id);
        }

        Ok(resolved)
    }

    async fn merge_samples(
        &self,
        tx: &mut sqlx::Transaction<'_, Postgres>,
        ctx: &ImportContext,
        batch: &RecordBatch,
        source_ids: &HashMap<(String, Option<String>), i32>,
    ) -> Result<i64, sqlx::Error> {
        if batch.samples.is_empty() {
            return Ok(0);
        }

        let count = batch.samples.len();
        let mut times = Vec::with_capacity(count);
        let mut end_times = Vec::with_capacity(count);
        let mut metric_types = Vec::with_capacity(count);
        let mut values = Vec::with_capacity(count);
        let mut units = Vec::with_capacity(count);
        let mut sources = Vec::with_capacity(count);

        for sample in &batch.samples {
            times.push(sample.time);
            end_times.push(sample.end_time);
            metric_types.push(sample.metric_type.clone());
            values.push(sample.value);
            units.push(sample.unit.clone());
            sources.push(lookup_source(source_ids, sample.source.as_ref()));
        }

        sqlx::query(
            "CREATE TEMP TABLE _stage_health_samples
             (LIKE health_samples INCLUDING DEFAULTS) ON COMMIT DROP",
        )
        .execute(&mut **tx)
        .await?;

        sqlx::query(
            r#"INSERT INTO _stage_health_samples
               (time, end_time, user_id, metric_type, value, unit, source_id, batch_id)
               SELECT * FROM UNNEST(
                   $1::timestamptz[], $2::timestamptz[], $3::int[], $4::text[],
                   $5::float8[], $6::text[], $7::int[], $8::uuid[]
               )"#,
        )
        .bind(&times)
        .bind(&end_times)
        .bind(vec![ctx.user_id; count])
        .bind(&metric_types)
        .bind(&values)
        .bind(&units)
        .bind(&sources)
        .bind(vec![ctx.batch_id; count])
        .execute(&mut **tx)
        .await?;

        let result = sqlx::query(
            r#"INSERT INTO health_samples
               (time, end_time, user_id, metric_type, value, unit, source_id, batch_id)
               SELECT time, end_time, user_id, metric_type, value, unit, source_id, batch_id
               FROM _stage_health_samples
               ON CONFLICT (user_id, metric_type, time, source_id) DO NOTHING"#,
        )
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() as i64)
    }

    async fn merge_categories(
        &self,
        tx: &mut sqlx::Transaction<'_, Postgres>,
        ctx: &ImportContext,
        batch: &RecordBatch,
        source_ids: &HashMap<(String, Option<String>), i32>,
    ) -> Result<i64, sqlx::Error> {
        if batch.categories.is_empty() {
            return Ok(0);
        }

        let count = batch.categories.len();
        let mut times = Vec::with_capacity(count);
        let mut end_times = Vec::with_capacity(count);
        let mut category_types = Vec::with_capacity(count);
        let mut values = Vec::with_capacity(count);
        let mut value_labels = Vec::with_capacity(count);
        let mut sources = Vec::with_capacity(count);

        for event in &batch.categories {
            times.push(event.time);
            end_times.push(event.end_time);
            category_types.push(event.category_type.clone());
            values.push(event.value.clone());
            value_labels.push(event.value_label.clone());
            sources.push(lookup_source(source_ids, event.source.as_ref()));
        }

        sqlx::query(
            "CREATE TEMP TABLE _stage_category_events
             (LIKE category_events INCLUDING DEFAULTS) ON COMMIT DROP",
        )
        .execute(&mut **tx)
        .await?;

        sqlx::query(
            r#"INSERT INTO _stage_category_events
               (time, end_time, user_id, category_type, value, value_label, source_id, batch_id)
               SELECT * FROM UNNEST(
                   $1::timestamptz[], $2::timestamptz[], $3::int[], $4::text[],
                   $5::text[], $6::text[], $7::int[], $8::uuid[]
               )"#,
        )
        .bind(&times)
        .bind(&end_times)
        .bind(vec![ctx.user_id; count])
        .bind(&category_types)
        .bind(&values)
        .bind(&value_labels)
        .bind(&sources)
        .bind(vec![ctx.batch_id; count])
        .execute(&mut **tx)
        .await?;

        let result = sqlx::query(
            r#"INSERT INTO category_events
               (time, end_time, user_id, category_type, value, value_label, source_id, batch_id)
               SELECT time, end_time, user_id, category_type, value, value_label, source_id, batch_id
               FROM _stage_category_events
               ON CONFLICT (user_id, category_type, time, source_id) DO NOTHING"#,
        )
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() as i64)
    }

    async fn merge_summaries(
        &self,
        tx: &mut sqlx::Transaction<'_, Postgres>,
        ctx: &ImportContext,
        batch: &RecordBatch,
    ) -> Result<i64, sqlx::Error> {
        if batch.summaries.is_empty() {
            return Ok(0);
        }

        let count = batch.summaries.len();
        let mut dates = Vec::with_capacity(count);
        let mut energies = Vec::with_capacity(count);
        let mut energy_goals = Vec::with_capacity(count);
        let mut exercise = Vec::with_capacity(count);
        let mut exercise_goals = Vec::with_capacity(count);
        let mut stand_hours = Vec::with_capacity(count);
        let mut stand_goals = Vec::with_capacity(count);

        for summary in &batch.summaries {
            dates.push(summary.date);
            energies.push(summary.active_energy_burned_kj);
            energy_goals.push(summary.active_energy_goal_kj);
            exercise.push(summary.exercise_minutes);
            exercise_goals.push(summary.exercise_goal_minutes);
            stand_hours.push(summary.stand_hours);
            stand_goals.push(summary.stand_goal_hours);
        }

        sqlx::query(
            "CREATE TEMP TABLE _stage_activity_summaries
             (LIKE activity_summaries INCLUDING DEFAULTS) ON COMMIT DROP",
        )
        .execute(&mut **tx)
        .await?;

        sqlx::query(
            r#"INSERT INTO _stage_activity_summaries
               (date, user_id, active_energy_burned_kj, active_energy_goal_kj,
                exercise_minutes, exercise_goal_minutes, stand_hours, stand_goal_hours, batch_id)
               SELECT * FROM UNNEST(
                   $1::date[], $2::int[], $3::float8[], $4::float8[],
                   $5::float8[], $6::float8[], $7::int[], $8::int[], $9::uuid[]
               )"#,
        )
        .bind(&dates)
        .bind(vec![ctx.user_id; count])
        .bind(&energies)
        .bind(&energy_goals)
        .bind(&exercise)
        .bind(&exercise_goals)
        .bind(&stand_hours)
        .bind(&stand_goals)
        .bind(vec![ctx.batch_id; count])
        .execute(&mut **tx)
        .await?;

        let result = sqlx::query(
            r#"INSERT INTO activity_summaries
               (date, user_id, active_energy_burned_kj, active_energy_goal_kj,
                exercise_minutes, exercise_goal_minutes, stand_hours, stand_goal_hours, batch_id)
               SELECT date, user_id, active_energy_burned_kj, active_energy_goal_kj,
                      exercise_minutes, exercise_goal_minutes, stand_hours, stand_goal_hours, batch_id
               FROM _stage_activity_summaries
               ON CONFLICT (user_id, date) DO NOTHING"#,
        )
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() as i64)
    }

    /// Workouts go through ordinary batched parameterized inserts: the
    /// JSONB metadata payload has no columnar staging shape.
    async fn insert_workouts(
        &self,
        tx: &mut sqlx::Transaction<'_, Postgres>,
        ctx: &ImportContext,
        batch: &RecordBatch,
        source_ids: &HashMap<(String, Option<String>), i32>,
    ) -> Result<i64, sqlx::Error> {
        if batch.workouts.is_empty() {
            return Ok(0);
        }

        let mut inserted = 0i64;

        for chunk in batch.workouts.chunks(WORKOUT_INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO workouts (id, user_id, start_time, end_time, activity_type, \
                 duration_sec, total_distance_m, total_energy_kj, source_id, batch_id, metadata) ",
            );

            builder.push_values(chunk, |mut row, workout| {
                row.push_bind(workout.id)
                    .push_bind(ctx.user_id)
                    .push_bind(workout.start_time)
                    .push_bind(workout.end_time)
                    .push_bind(workout.activity_type.clone())
                    .push_bind(workout.duration_sec)
                    .push_bind(workout.total_distance_m)
                    .push_bind(workout.total_energy_kj)
                    .push_bind(lookup_source(source_ids, workout.source.as_ref()))
                    .push_bind(ctx.batch_id)
                    .push_bind(workout.metadata.clone());
            });
            builder.push(" ON CONFLICT (user_id, start_time, activity_type) DO NOTHING");

            let result = builder.build().execute(&mut **tx).await?;
            inserted += result.rows_affected() as i64;
        }

        Ok(inserted)
    }

    /// Route points are owned by their workout; conflicts here are not
    /// counted, they only keep re-imported routes from duplicating.
    async fn merge_route_points(
        &self,
        tx: &mut sqlx::Transaction<'_, Postgres>,
        batch: &RecordBatch,
    ) -> Result<(), sqlx::Error> {
        if batch.route_points.is_empty() {
            return Ok(());
        }

        let count = batch.route_points.len();
        let mut times = Vec::with_capacity(count);
        let mut workout_ids = Vec::with_capacity(count);
        let mut latitudes = Vec::with_capacity(count);
        let mut longitudes = Vec::with_capacity(count);
        let mut altitudes = Vec::with_capacity(count);

        for point in &batch.route_points {
            times.push(point.time);
            workout_ids.push(point.workout_id);
            latitudes.push(point.latitude);
            longitudes.push(point.longitude);
            altitudes.push(point.altitude_m);
        }

        sqlx::query(
            "CREATE TEMP TABLE _stage_workout_route_points
             (LIKE workout_route_points INCLUDING DEFAULTS) ON COMMIT DROP",
        )
        .execute(&mut **tx)
        .await?;

        sqlx::query(
            r#"INSERT INTO _stage_workout_route_points
               (time, workout_id, latitude, longitude, altitude_m)
               SELECT * FROM UNNEST(
                   $1::timestamptz[], $2::uuid[], $3::float8[], $4::float8[], $5::float8[]
               )"#,
        )
        .bind(&times)
        .bind(&workout_ids)
        .bind(&latitudes)
        .bind(&longitudes)
        .bind(&altitudes)
        .execute(&mut **tx)
        .await?;

        sqlx::query(
            r#"INSERT INTO workout_route_points
               (time, workout_id, latitude, longitude, altitude_m)
               SELECT time, workout_id, latitude, longitude, altitude_m
               FROM _stage_workout_route_points
               ON CONFLICT (workout_id, time) DO NOTHING"#,
        )
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}

fn lookup_source(
    source_ids: &HashMap<(String, Option<String>), i32>,
    source: Option<&SourceRef>,
) -> Option<i32> {
    let source = source?;
    source_ids
        .get(&(source.name.clone(), source.bundle_id.clone()))
        .copied()
}
