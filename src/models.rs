use chrono::{DateTime, NaiveDate, Utc};
use rocket_db_pools::sqlx::FromRow;
use rocket_okapi::okapi::schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ===== Import Ledger =====

/// Lifecycle of an import job. Transitions are monotonic:
/// `pending -> processing -> {completed, failed}` with the orthogonal
/// branch `processing -> cancelling -> cancelled`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "batch_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Processing,
    Cancelling,
    Cancelled,
    Completed,
    Failed,
}

impl BatchStatus {
    /// Terminal states are never revisited.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Cancelled | BatchStatus::Failed
        )
    }

    /// States during which the pipeline still owns the batch's rows.
    pub fn is_active(&self) -> bool {
        matches!(self, BatchStatus::Processing | BatchStatus::Cancelling)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ImportBatch {
    pub id: Uuid,
    pub user_id: i32,
    pub filename: String,
    pub status: BatchStatus,
    pub record_count: i64,
    pub skipped_count: i64,
    pub error_count: i32,
    pub error_messages: Vec<String>,
    pub imported_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ===== Identity =====

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[allow(dead_code)]
pub struct User {
    pub id: i32,
    pub email: String,
    pub display_name: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

// ===== Record tables =====

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[allow(dead_code)]
pub struct DataSource {
    pub id: i32,
    pub name: String,
    pub bundle_id: Option<String>,
    pub device_info: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[allow(dead_code)]
pub struct HealthSample {
    pub time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub user_id: i32,
    pub metric_type: String,
    pub value: f64,
    pub unit: String,
    pub source_id: Option<i32>,
    pub batch_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[allow(dead_code)]
pub struct CategoryEvent {
    pub time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub user_id: i32,
    pub category_type: String,
    pub value: String,
    pub value_label: Option<String>,
    pub source_id: Option<i32>,
    pub batch_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[allow(dead_code)]
pub struct Workout {
    pub id: Uuid,
    pub user_id: i32,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub activity_type: String,
    pub duration_sec: Option<f64>,
    pub total_distance_m: Option<f64>,
    pub total_energy_kj: Option<f64>,
    pub source_id: Option<i32>,
    pub batch_id: Uuid,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[allow(dead_code)]
pub struct WorkoutRoutePoint {
    pub time: DateTime<Utc>,
    pub workout_id: Uuid,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_m: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[allow(dead_code)]
pub struct ActivitySummary {
    pub date: NaiveDate,
    pub user_id: i32,
    pub active_energy_burned_kj: Option<f64>,
    pub active_energy_goal_kj: Option<f64>,
    pub exercise_minutes: Option<f64>,
    pub exercise_goal_minutes: Option<f64>,
    pub stand_hours: Option<i32>,
    pub stand_goal_hours: Option<i32>,
    pub batch_id: Uuid,
}
