use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{QueueError, QueueResult};
use crate::jobs::model::{NewSchedule, Schedule, ScheduleUpdate};

/// Every SQL operation on the `schedules` table.
#[derive(Clone)]
pub struct ScheduleStore {
    pool: PgPool,
}

impl ScheduleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, schedule: NewSchedule) -> QueueResult<Schedule> {
        let res = sqlx::query_as::<_, Schedule>(
            r#"
            INSERT INTO schedules (name, job_type, payload, cron_expr, timezone, max_attempts, enabled, next_run_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(&schedule.name)
        .bind(&schedule.job_type)
        .bind(&schedule.payload)
        .bind(&schedule.cron_expr)
        .bind(&schedule.timezone)
        .bind(schedule.max_attempts)
        .bind(schedule.enabled)
        .bind(schedule.next_run_at)
        .fetch_one(&self.pool)
        .await;

        match res {
            Ok(s) => Ok(s),
            Err(e) if QueueError::is_unique_violation(&e) => Err(QueueError::conflict(format!(
                "schedule name already exists: {}",
                schedule.name
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Insert-or-leave-existing keyed by `name`. Used to register built-in
    /// defaults on startup; an operator-tuned cron is never overwritten.
    pub async fn upsert(&self, schedule: NewSchedule) -> QueueResult<Schedule> {
        let inserted = sqlx::query_as::<_, Schedule>(
            r#"
            INSERT INTO schedules (name, job_type, payload, cron_expr, timezone, max_attempts, enabled, next_run_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (name) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(&schedule.name)
        .bind(&schedule.job_type)
        .bind(&schedule.payload)
        .bind(&schedule.cron_expr)
        .bind(&schedule.timezone)
        .bind(schedule.max_attempts)
        .bind(schedule.enabled)
        .bind(schedule.next_run_at)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(s) => Ok(s),
            None => self.get_by_name(&schedule.name).await,
        }
    }

    pub async fn get(&self, id: Uuid) -> QueueResult<Schedule> {
        let schedule = sqlx::query_as::<_, Schedule>("SELECT * FROM schedules WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        schedule.ok_or_else(|| QueueError::not_found(format!("schedule {id}")))
    }

    pub async fn get_by_name(&self, name: &str) -> QueueResult<Schedule> {
        let schedule = sqlx::query_as::<_, Schedule>("SELECT * FROM schedules WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        schedule.ok_or_else(|| QueueError::not_found(format!("schedule {name}")))
    }

    pub async fn list(&self) -> QueueResult<Vec<Schedule>> {
        let schedules =
            sqlx::query_as::<_, Schedule>("SELECT * FROM schedules ORDER BY name ASC")
                .fetch_all(&self.pool)
                .await?;

        Ok(schedules)
    }

    pub async fn update(&self, id: Uuid, patch: ScheduleUpdate) -> QueueResult<Schedule> {
        let schedule = sqlx::query_as::<_, Schedule>(
            r#"
            UPDATE schedules
            SET job_type     = COALESCE($2, job_type),
                payload      = COALESCE($3, payload),
                cron_expr    = COALESCE($4, cron_expr),
                timezone     = COALESCE($5, timezone),
                max_attempts = COALESCE($6, max_attempts),
                enabled      = COALESCE($7, enabled),
                next_run_at  = COALESCE($8, next_run_at),
                updated_at   = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(patch.job_type.as_deref())
        .bind(patch.payload.as_ref())
        .bind(patch.cron_expr.as_deref())
        .bind(patch.timezone.as_deref())
        .bind(patch.max_attempts)
        .bind(patch.enabled)
        .bind(patch.next_run_at)
        .fetch_optional(&self.pool)
        .await?;

        schedule.ok_or_else(|| QueueError::not_found(format!("schedule {id}")))
    }

    /// Flip the enabled flag. `next_run_at` is supplied by the caller on a
    /// false-to-true transition (recomputed from now); disabling leaves it
    /// alone so the scheduler simply skips the row.
    pub async fn set_enabled(
        &self,
        id: Uuid,
        enabled: bool,
        next_run_at: Option<DateTime<Utc>>,
    ) -> QueueResult<Schedule> {
        let schedule = sqlx::query_as::<_, Schedule>(
            r#"
            UPDATE schedules
            SET enabled = $2,
                next_run_at = COALESCE($3, next_run_at),
                updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(enabled)
        .bind(next_run_at)
        .fetch_optional(&self.pool)
        .await?;

        schedule.ok_or_else(|| QueueError::not_found(format!("schedule {id}")))
    }

    pub async fn delete(&self, id: Uuid) -> QueueResult<()> {
        let res = sqlx::query("DELETE FROM schedules WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if res.rows_affected() == 0 {
            return Err(QueueError::not_found(format!("schedule {id}")));
        }
        Ok(())
    }

    pub async fn due_schedules(&self) -> QueueResult<Vec<Schedule>> {
        let schedules = sqlx::query_as::<_, Schedule>(
            r#"
            SELECT *
            FROM schedules
            WHERE enabled = true
              AND next_run_at <= now()
            ORDER BY next_run_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(schedules)
    }

    /// Advance a due schedule and enqueue its job, atomically.
    ///
    /// The conditional update re-checks `enabled` and `next_run_at <= now()`
    /// under the row lock; when another instance already ticked (or the
    /// schedule was disabled between read and write) zero rows match, the
    /// transaction rolls back and the caller gets `false`. Exactly one job
    /// row per tick across all replicas.
    pub async fn advance_and_enqueue(
        &self,
        schedule_id: Uuid,
        next_run_at: DateTime<Utc>,
        job_type: &str,
        payload: &Value,
        max_attempts: i32,
    ) -> QueueResult<bool> {
        let mut tx = self.pool.begin().await?;

        let advanced = sqlx::query(
            r#"
            UPDATE schedules
            SET last_run_at = now(),
                next_run_at = $2,
                updated_at = now()
            WHERE id = $1
              AND enabled = true
              AND next_run_at <= now()
            "#,
        )
        .bind(schedule_id)
        .bind(next_run_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if advanced == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO jobs (job_type, payload, state, run_at, max_attempts, schedule_id)
            VALUES ($1, $2, 'queued', now(), $3, $4)
            "#,
        )
        .bind(job_type)
        .bind(payload)
        .bind(max_attempts)
        .bind(schedule_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }
}
