//! End-to-end pipeline tests against a containerized PostgreSQL.
//!
//! These drive `run_import` directly with fixture files on disk and assert
//! the ledger counters and table contents the pipeline must produce.

use rocket_db_pools::sqlx::{self, PgPool};
use std::fs;
use std::path::PathBuf;
use uuid::Uuid;
use vitals_server::ingest::extract::SourceKind;
use vitals_server::ingest::ledger::BatchLedger;
use vitals_server::ingest::{purge_batch_records, run_import};
use vitals_server::models::BatchStatus;
use vitals_server::test_support::{TestDatabase, TestDatabaseError, TestFixtures};

/// The concrete acceptance scenario: 3 samples, 1 workout with 2 route
/// points, and 1 malformed sample.
const FIXTURE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<HealthData locale="en_US">
 <Record type="HKQuantityTypeIdentifierStepCount" sourceName="Watch" unit="count" value="523"
         startDate="2024-01-01 08:00:00 +0000" endDate="2024-01-01 08:10:00 +0000"/>
 <Record type="HKQuantityTypeIdentifierStepCount" sourceName="Watch" unit="count" value="610"
         startDate="2024-01-01 09:00:00 +0000"/>
 <Record type="HKQuantityTypeIdentifierHeartRate" sourceName="Watch" unit="count/min" value="62"
         startDate="2024-01-01 09:30:00 +0000"/>
 <Record type="HKQuantityTypeIdentifierStepCount" sourceName="Watch" unit="count" value="701"
         startDate="this is not a timestamp"/>
 <Workout workoutActivityType="HKWorkoutActivityTypeRunning" duration="30" durationUnit="min"
          totalDistance="5" totalDistanceUnit="km" totalEnergyBurned="300" totalEnergyBurnedUnit="kcal"
          sourceName="Watch" startDate="2024-01-02 07:00:00 +0000" endDate="2024-01-02 07:30:00 +0000">
  <MetadataEntry key="HKIndoorWorkout" value="0"/>
  <WorkoutRoute sourceName="Watch">
   <Location date="2024-01-02 07:01:00 +0000" latitude="51.5007" longitude="-0.1246" altitude="11.0"/>
   <Location date="2024-01-02 07:02:00 +0000" latitude="51.5010" longitude="-0.1250" altitude="11.5"/>
  </WorkoutRoute>
 </Workout>
</HealthData>"#;

/// A second, fully disjoint export used for batch isolation tests. Also
/// exercises category events and activity summaries.
const OTHER_FIXTURE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<HealthData locale="en_US">
 <Record type="HKQuantityTypeIdentifierStepCount" sourceName="Phone" unit="count" value="88"
         startDate="2024-03-05 10:00:00 +0000"/>
 <Record type="HKCategoryTypeIdentifierSleepAnalysis" sourceName="Phone"
         value="HKCategoryValueSleepAnalysisAsleepDeep"
         startDate="2024-03-05 01:00:00 +0000" endDate="2024-03-05 02:30:00 +0000"/>
 <ActivitySummary dateComponents="2024-03-05" activeEnergyBurned="450" activeEnergyBurnedUnit="kcal"
         activeEnergyBurnedGoal="500" appleExerciseTime="40" appleStandHours="11"/>
</HealthData>"#;

async fn provision() -> Option<TestDatabase> {
    match TestDatabase::new_from_env().await {
        Ok(db) => Some(db),
        Err(TestDatabaseError::MissingUrl) => {
            eprintln!("skipping pipeline test: TEST_DATABASE_URL not set");
            None
        }
        Err(err) => panic!("failed to provision test database: {err:?}"),
    }
}

fn write_fixture(dir: &tempfile::TempDir, name: &str, contents: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, contents).expect("fixture written");
    path
}

async fn import_fixture(pool: &PgPool, user_id: i32, contents: &str) -> Uuid {
    let fixtures = TestFixtures::new(pool);
    let batch_id = fixtures
        .insert_import_batch(user_id, "export.xml", "pending")
        .await
        .expect("ledger row created");

    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_fixture(&dir, "export.xml", contents);

    run_import(pool.clone(), user_id, batch_id, path, SourceKind::Xml).await;
    batch_id
}

async fn batch_row(pool: &PgPool, batch_id: Uuid) -> (BatchStatus, i64, i64, i32, Vec<String>) {
    sqlx::query_as(
        "SELECT status, record_count, skipped_count, error_count, error_messages \
         FROM import_batches WHERE id = $1",
    )
    .bind(batch_id)
    .fetch_one(pool)
    .await
    .expect("batch row exists")
}

async fn count(pool: &PgPool, sql: &str) -> i64 {
    sqlx::query_scalar(sql)
        .fetch_one(pool)
        .await
        .expect("count query succeeded")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn imports_fixture_with_expected_counts() {
    let Some(db) = provision().await else { return };
    let pool = db.pool_clone();

    let user_id = TestFixtures::new(&pool)
        .insert_user("pipeline@example.com", None)
        .await
        .expect("user created");

    let batch_id = import_fixture(&pool, user_id, FIXTURE).await;

    let (status, records, skipped, errors, messages) = batch_row(&pool, batch_id).await;
    assert_eq!(status, BatchStatus::Completed);
    assert_eq!(records, 4, "3 samples + 1 workout");
    assert_eq!(skipped, 1, "the malformed sample");
    assert_eq!(errors, 0);
    assert!(messages.is_empty());

    assert_eq!(count(&pool, "SELECT COUNT(*) FROM health_samples").await, 3);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM workouts").await, 1);
    assert_eq!(
        count(&pool, "SELECT COUNT(*) FROM workout_route_points").await,
        2
    );

    // Every row carries the batch that produced it.
    let tagged: i64 = sqlx::query_scalar(
        "SELECT (SELECT COUNT(*) FROM health_samples WHERE batch_id = $1) \
               + (SELECT COUNT(*) FROM workouts WHERE batch_id = $1)",
    )
    .bind(batch_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(tagged, 4);

    // The workout's exporting source was resolved.
    let sources = count(&pool, "SELECT COUNT(*) FROM data_sources").await;
    assert_eq!(sources, 1, "one distinct source in the fixture");

    db.close().await.expect("failed to drop test database");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reimporting_the_same_file_is_a_noop() {
    let Some(db) = provision().await else { return };
    let pool = db.pool_clone();

    let user_id = TestFixtures::new(&pool)
        .insert_user("reimport@example.com", None)
        .await
        .expect("user created");

    let first = import_fixture(&pool, user_id, FIXTURE).await;
    let second = import_fixture(&pool, user_id, FIXTURE).await;

    let (status, records, skipped, ..) = batch_row(&pool, first).await;
    assert_eq!(status, BatchStatus::Completed);
    assert_eq!(records, 4);
    assert_eq!(skipped, 1);

    // Second pass: every well-formed record is a dedup conflict.
    let (status, records, skipped, ..) = batch_row(&pool, second).await;
    assert_eq!(status, BatchStatus::Completed);
    assert_eq!(records, 0);
    assert_eq!(skipped, 5, "4 duplicates + 1 malformed");

    // Zero net change in stored rows.
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM health_samples").await, 3);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM workouts").await, 1);
    assert_eq!(
        count(&pool, "SELECT COUNT(*) FROM workout_route_points").await,
        2
    );

    db.close().await.expect("failed to drop test database");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fragment_corruption_never_fails_the_job() {
    let Some(db) = provision().await else { return };
    let pool = db.pool_clone();

    let user_id = TestFixtures::new(&pool)
        .insert_user("fragments@example.com", None)
        .await
        .expect("user created");

    // A stray closing tag between two well-formed records.
    let corrupted = r#"<HealthData>
 <Record type="HKQuantityTypeIdentifierStepCount" unit="count" value="1"
         startDate="2024-04-01 08:00:00 +0000"/>
 </Workout>
 <Record type="HKQuantityTypeIdentifierStepCount" unit="count" value="2"
         startDate="2024-04-01 09:00:00 +0000"/>
</HealthData>"#;

    let batch_id = import_fixture(&pool, user_id, corrupted).await;

    let (status, records, skipped, errors, _) = batch_row(&pool, batch_id).await;
    assert_eq!(status, BatchStatus::Completed, "fragment-level corruption must not fail the job");
    assert_eq!(records, 2);
    assert!(skipped >= 1);
    assert_eq!(errors, 0);

    db.close().await.expect("failed to drop test database");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn truncated_export_fails_the_job() {
    let Some(db) = provision().await else { return };
    let pool = db.pool_clone();

    let user_id = TestFixtures::new(&pool)
        .insert_user("truncated@example.com", None)
        .await
        .expect("user created");

    let fixtures = TestFixtures::new(&pool);
    let batch_id = fixtures
        .insert_import_batch(user_id, "export.xml", "pending")
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = write_fixture(
        &dir,
        "export.xml",
        "<HealthData>\n <Record type=\"HKQuantityTypeIdentifierStepCount\"",
    );

    run_import(pool.clone(), user_id, batch_id, path, SourceKind::Xml).await;

    let (status, _, _, errors, messages) = batch_row(&pool, batch_id).await;
    assert_eq!(status, BatchStatus::Failed);
    assert!(errors >= 1);
    assert!(
        messages.iter().any(|m| m.contains("truncated")),
        "failure reason is recorded: {messages:?}"
    );

    db.close().await.expect("failed to drop test database");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn archived_export_imports_like_plain_xml() {
    use std::io::Write;

    let Some(db) = provision().await else { return };
    let pool = db.pool_clone();

    let user_id = TestFixtures::new(&pool)
        .insert_user("archive@example.com", None)
        .await
        .expect("user created");

    let fixtures = TestFixtures::new(&pool);
    let batch_id = fixtures
        .insert_import_batch(user_id, "export.zip", "pending")
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let zip_path = dir.path().join(format!("{batch_id}.zip"));
    let file = fs::File::create(&zip_path).unwrap();
    let mut writer = zip::ZipWriter::new(file);
    writer
        .start_file(
            "apple_health_export/export.xml",
            zip::write::SimpleFileOptions::default(),
        )
        .unwrap();
    writer.write_all(OTHER_FIXTURE.as_bytes()).unwrap();
    writer.finish().unwrap();

    run_import(pool.clone(), user_id, batch_id, zip_path, SourceKind::Archive).await;

    let (status, records, skipped, ..) = batch_row(&pool, batch_id).await;
    assert_eq!(status, BatchStatus::Completed);
    assert_eq!(records, 3, "1 sample + 1 category event + 1 summary");
    assert_eq!(skipped, 0);

    assert_eq!(count(&pool, "SELECT COUNT(*) FROM category_events").await, 1);
    assert_eq!(
        count(&pool, "SELECT COUNT(*) FROM activity_summaries").await,
        1
    );

    db.close().await.expect("failed to drop test database");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deleting_one_batch_leaves_the_other_intact() {
    let Some(db) = provision().await else { return };
    let pool = db.pool_clone();

    let user_id = TestFixtures::new(&pool)
        .insert_user("isolation@example.com", None)
        .await
        .expect("user created");

    let first = import_fixture(&pool, user_id, FIXTURE).await;
    let second = import_fixture(&pool, user_id, OTHER_FIXTURE).await;

    purge_batch_records(&pool, first).await.expect("purge succeeded");
    sqlx::query("DELETE FROM import_batches WHERE id = $1")
        .bind(first)
        .execute(&pool)
        .await
        .unwrap();

    // Only the second batch's rows survive.
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM workouts").await, 0);
    assert_eq!(
        count(&pool, "SELECT COUNT(*) FROM workout_route_points").await,
        0
    );
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM health_samples").await, 1);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM category_events").await, 1);
    assert_eq!(
        count(&pool, "SELECT COUNT(*) FROM activity_summaries").await,
        1
    );

    let remaining: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM health_samples WHERE batch_id = $1",
    )
    .bind(second)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(remaining, 1);

    db.close().await.expect("failed to drop test database");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ledger_transitions_are_monotonic() {
    let Some(db) = provision().await else { return };
    let pool = db.pool_clone();

    let user_id = TestFixtures::new(&pool)
        .insert_user("ledger@example.com", None)
        .await
        .expect("user created");

    let fixtures = TestFixtures::new(&pool);
    let ledger = BatchLedger::new(pool.clone());

    // pending -> processing -> cancelling -> cancelled, and no way back.
    let batch_id = fixtures
        .insert_import_batch(user_id, "a.xml", "pending")
        .await
        .unwrap();

    assert!(!ledger.request_cancel(batch_id).await.unwrap(), "pending cannot cancel");
    assert!(ledger.mark_processing(batch_id).await.unwrap());
    assert!(!ledger.mark_processing(batch_id).await.unwrap(), "second transition is a no-op");
    assert!(ledger.request_cancel(batch_id).await.unwrap());
    assert!(!ledger.mark_completed(batch_id).await.unwrap(), "cancelling cannot complete");
    assert!(ledger.mark_cancelled(batch_id).await.unwrap());
    assert!(!ledger.mark_failed(batch_id, "late failure").await.unwrap(), "terminal states stay terminal");
    assert_eq!(
        ledger.status(batch_id).await.unwrap(),
        Some(BatchStatus::Cancelled)
    );

    // Extractor death before the first dequeued batch: pending -> failed.
    let batch_id = fixtures
        .insert_import_batch(user_id, "b.xml", "pending")
        .await
        .unwrap();
    assert!(ledger.mark_failed(batch_id, "corrupt archive").await.unwrap());
    assert!(!ledger.mark_processing(batch_id).await.unwrap());
    assert_eq!(
        ledger.status(batch_id).await.unwrap(),
        Some(BatchStatus::Failed)
    );

    db.close().await.expect("failed to drop test database");
}
