use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::QueueError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Result<Self, QueueError> {
        match s {
            "queued" => Ok(JobState::Queued),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "canceled" => Ok(JobState::Canceled),
            other => Err(QueueError::validation(format!("unknown job state: {other}"))),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub payload: Value,
    pub state: String,

    pub run_at: DateTime<Utc>,
    pub lease_until: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,

    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub last_run_at: Option<DateTime<Utc>>,

    pub idempotency_key: Option<String>,
    pub schedule_id: Option<Uuid>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
}

/// Caller-controlled knobs for `JobStore::enqueue`.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub run_at: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
    pub max_attempts: Option<i32>,
    pub schedule_id: Option<Uuid>,
}

/// List filter for the admin surface.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub job_type: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

/// Counts by state plus the age of the oldest queued row, the queue-depth
/// indicator operators watch.
#[derive(Debug, Clone, Serialize)]
pub struct JobStats {
    pub queued: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub canceled: i64,
    pub oldest_queued_age_seconds: i64,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Schedule {
    pub id: Uuid,
    pub name: String,
    pub job_type: String,
    pub payload: Value,
    pub cron_expr: String,
    pub timezone: String,
    pub max_attempts: i32,
    pub enabled: bool,

    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub name: String,
    pub job_type: String,
    pub payload: Value,
    pub cron_expr: String,
    pub timezone: String,
    pub max_attempts: i32,
    pub enabled: bool,
    pub next_run_at: DateTime<Utc>,
}

/// Field-wise patch for `ScheduleStore::update`. `None` leaves the column
/// untouched; `next_run_at` is recomputed by the caller when the cron,
/// timezone or enabled flag changes.
#[derive(Debug, Clone, Default)]
pub struct ScheduleUpdate {
    pub job_type: Option<String>,
    pub payload: Option<Value>,
    pub cron_expr: Option<String>,
    pub timezone: Option<String>,
    pub max_attempts: Option<i32>,
    pub enabled: Option<bool>,
    pub next_run_at: Option<DateTime<Utc>>,
}
