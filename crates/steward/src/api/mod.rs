//! Admin HTTP surface. Thin adapter: every handler validates, calls a
//! store or the refresh engine, and maps `QueueError` kinds onto status
//! codes. No queue logic lives here.

use axum::{
    extract::{Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::error::QueueError;
use crate::jobs::cron;
use crate::jobs::model::{
    EnqueueOptions, Job, JobFilter, JobState, JobStats, NewSchedule, Schedule, ScheduleUpdate,
};
use crate::jobs::service::JobService;
use crate::matview::{MatviewEntry, RefreshMode, RefreshOutcome};

pub mod models;

use models::*;

#[derive(Clone)]
pub struct ApiState {
    pub service: JobService,
    pub admin_token: Option<String>,
}

pub fn router(state: ApiState) -> Router {
    let admin = Router::new()
        .route("/jobs", get(list_jobs).post(enqueue_job))
        .route("/jobs/stats", get(job_stats))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/retry", post(retry_job))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/schedules", get(list_schedules).post(create_schedule))
        .route(
            "/schedules/:id",
            put(update_schedule).delete(delete_schedule),
        )
        .route("/schedules/:id/enable", post(enable_schedule))
        .route("/schedules/:id/disable", post(disable_schedule))
        .route("/matviews", get(list_matviews).post(register_matview))
        .route(
            "/matviews/:id",
            get(get_matview).put(update_matview).delete(delete_matview),
        )
        .route("/matviews/:id/refresh", post(refresh_matview))
        .layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .nest("/admin", admin)
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn require_admin(
    State(state): State<ApiState>,
    req: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.admin_token.as_deref() else {
        return next.run(req).await;
    };

    let authorized = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|token| token == expected)
        .unwrap_or(false);

    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            Json(ErrorBody {
                error: "missing or invalid admin token".to_string(),
            }),
        )
            .into_response();
    }

    next.run(req).await
}

/// Wrapper so handlers can `?` a `QueueError` straight into a response.
pub struct ApiError(QueueError);

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            QueueError::Validation(_) => StatusCode::BAD_REQUEST,
            QueueError::Conflict(_) => StatusCode::CONFLICT,
            QueueError::NotFound(_) => StatusCode::NOT_FOUND,
            QueueError::Precondition(_) => StatusCode::PRECONDITION_FAILED,
            QueueError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // Database details stay in the logs, not in responses.
        let message = match &self.0 {
            QueueError::Database(e) => {
                tracing::error!(error = %e, "admin api database error");
                "internal error".to_string()
            }
            other => other.to_string(),
        };

        (status, Json(ErrorBody { error: message })).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ----------------------------
// Jobs
// ----------------------------

async fn list_jobs(
    State(state): State<ApiState>,
    Query(q): Query<ListJobsQuery>,
) -> ApiResult<Vec<Job>> {
    let filter = JobFilter {
        state: q.state.as_deref().map(JobState::parse).transpose()?,
        job_type: q.job_type,
        limit: q.limit.unwrap_or(100),
        offset: q.offset.unwrap_or(0),
    };

    Ok(Json(state.service.jobs().list(filter).await?))
}

async fn enqueue_job(
    State(state): State<ApiState>,
    Json(body): Json<EnqueueRequest>,
) -> ApiResult<Job> {
    let job = state
        .service
        .enqueue(
            &body.job_type,
            body.payload.unwrap_or_else(|| json!({})),
            EnqueueOptions {
                run_at: body.run_at,
                idempotency_key: body.idempotency_key,
                max_attempts: body.max_attempts,
                schedule_id: None,
            },
        )
        .await?;

    Ok(Json(job))
}

async fn get_job(State(state): State<ApiState>, Path(id): Path<Uuid>) -> ApiResult<Job> {
    Ok(Json(state.service.jobs().get(id).await?))
}

async fn retry_job(State(state): State<ApiState>, Path(id): Path<Uuid>) -> ApiResult<Job> {
    Ok(Json(state.service.jobs().retry_now(id).await?))
}

async fn cancel_job(State(state): State<ApiState>, Path(id): Path<Uuid>) -> ApiResult<Job> {
    Ok(Json(state.service.jobs().cancel(id).await?))
}

async fn job_stats(State(state): State<ApiState>) -> ApiResult<JobStats> {
    Ok(Json(state.service.jobs().stats().await?))
}

// ----------------------------
// Schedules
// ----------------------------

async fn list_schedules(State(state): State<ApiState>) -> ApiResult<Vec<Schedule>> {
    Ok(Json(state.service.schedules().list().await?))
}

async fn create_schedule(
    State(state): State<ApiState>,
    Json(body): Json<CreateScheduleRequest>,
) -> ApiResult<Schedule> {
    if body.name.trim().is_empty() {
        return Err(QueueError::validation("name must not be empty").into());
    }

    let timezone = body.timezone.unwrap_or_else(|| "UTC".to_string());
    let next_run_at = cron::next_occurrence(&body.cron_expr, &timezone, Utc::now())?;

    let schedule = state
        .service
        .schedules()
        .create(NewSchedule {
            name: body.name,
            job_type: body.job_type,
            payload: body.payload.unwrap_or_else(|| json!({})),
            cron_expr: body.cron_expr,
            timezone,
            max_attempts: body.max_attempts.unwrap_or(3),
            enabled: body.enabled.unwrap_or(true),
            next_run_at,
        })
        .await?;

    Ok(Json(schedule))
}

async fn update_schedule(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateScheduleRequest>,
) -> ApiResult<Schedule> {
    let existing = state.service.schedules().get(id).await?;

    let cron_expr = body.cron_expr.clone().unwrap_or_else(|| existing.cron_expr.clone());
    let timezone = body.timezone.clone().unwrap_or_else(|| existing.timezone.clone());
    cron::validate(&cron_expr, &timezone)?;

    // next_run_at is recomputed when the timing inputs change or the
    // schedule comes back to life; a plain payload edit leaves it alone.
    let enabling = body.enabled == Some(true) && !existing.enabled;
    let timing_changed = body.cron_expr.is_some() || body.timezone.is_some();
    let next_run_at = if enabling || timing_changed {
        Some(cron::next_occurrence(&cron_expr, &timezone, Utc::now())?)
    } else {
        None
    };

    let schedule = state
        .service
        .schedules()
        .update(
            id,
            ScheduleUpdate {
                job_type: body.job_type,
                payload: body.payload,
                cron_expr: body.cron_expr,
                timezone: body.timezone,
                max_attempts: body.max_attempts,
                enabled: body.enabled,
                next_run_at,
            },
        )
        .await?;

    Ok(Json(schedule))
}

async fn delete_schedule(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<DeletedResponse> {
    state.service.schedules().delete(id).await?;
    Ok(Json(DeletedResponse { deleted: id }))
}

async fn enable_schedule(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Schedule> {
    let existing = state.service.schedules().get(id).await?;
    let next_run_at =
        cron::next_occurrence(&existing.cron_expr, &existing.timezone, Utc::now())?;

    let schedule = state
        .service
        .schedules()
        .set_enabled(id, true, Some(next_run_at))
        .await?;

    Ok(Json(schedule))
}

async fn disable_schedule(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Schedule> {
    Ok(Json(state.service.schedules().set_enabled(id, false, None).await?))
}

// ----------------------------
// Matview registry
// ----------------------------

async fn list_matviews(State(state): State<ApiState>) -> ApiResult<Vec<MatviewEntry>> {
    Ok(Json(state.service.matviews().list().await?))
}

async fn get_matview(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<MatviewEntry> {
    Ok(Json(state.service.matviews().get(id).await?))
}

async fn register_matview(
    State(state): State<ApiState>,
    Json(body): Json<RegisterMatviewRequest>,
) -> ApiResult<MatviewEntry> {
    let schema = body.schema.unwrap_or_else(|| "public".to_string());
    let mode = match body.refresh_mode.as_deref() {
        Some(raw) => RefreshMode::parse(raw)?,
        None => RefreshMode::Standard,
    };

    let entry = state
        .service
        .matviews()
        .register(&schema, &body.view_name, mode)
        .await?;

    Ok(Json(entry))
}

async fn update_matview(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateMatviewRequest>,
) -> ApiResult<MatviewEntry> {
    let mode = RefreshMode::parse(&body.refresh_mode)?;
    Ok(Json(state.service.matviews().set_mode(id, mode).await?))
}

async fn delete_matview(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<DeletedResponse> {
    state.service.matviews().delete(id).await?;
    Ok(Json(DeletedResponse { deleted: id }))
}

async fn refresh_matview(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<RefreshOutcome> {
    Ok(Json(state.service.refresh_engine().refresh_now(id).await?))
}
