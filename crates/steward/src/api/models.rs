use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub state: Option<String>,
    #[serde(rename = "type")]
    pub job_type: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub job_type: String,
    #[serde(default)]
    pub payload: Option<Value>,
    pub run_at: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
    pub max_attempts: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct CreateScheduleRequest {
    pub name: String,
    pub job_type: String,
    pub cron_expr: String,
    pub timezone: Option<String>,
    #[serde(default)]
    pub payload: Option<Value>,
    pub max_attempts: Option<i32>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateScheduleRequest {
    pub job_type: Option<String>,
    pub cron_expr: Option<String>,
    pub timezone: Option<String>,
    pub payload: Option<Value>,
    pub max_attempts: Option<i32>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterMatviewRequest {
    pub schema: Option<String>,
    pub view_name: String,
    pub refresh_mode: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateMatviewRequest {
    pub refresh_mode: String,
}

#[derive(Debug, Serialize)]
pub struct DeletedResponse {
    pub deleted: Uuid,
}
