use std::time::Duration;

use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{QueueError, QueueResult};
use crate::jobs::model::{EnqueueOptions, Job, JobFilter, JobState, JobStats};

/// Every SQL operation on the `jobs` table. No other component writes SQL
/// against it.
#[derive(Clone)]
pub struct JobStore {
    pool: PgPool,
}

impl JobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ----------------------------
    // Enqueue
    // ----------------------------

    pub async fn enqueue(
        &self,
        job_type: &str,
        payload: Value,
        opts: EnqueueOptions,
    ) -> QueueResult<Job> {
        if job_type.trim().is_empty() {
            return Err(QueueError::validation("job_type must not be empty"));
        }
        let max_attempts = opts.max_attempts.unwrap_or(3);
        if max_attempts < 1 {
            return Err(QueueError::validation("max_attempts must be >= 1"));
        }

        let res = sqlx::query_as::<_, Job>(
            r#"
            INSERT INTO jobs (job_type, payload, state, run_at, max_attempts, idempotency_key, schedule_id)
            VALUES ($1, $2, 'queued', COALESCE($3, now()), $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(job_type)
        .bind(payload)
        .bind(opts.run_at)
        .bind(max_attempts)
        .bind(opts.idempotency_key.as_deref())
        .bind(opts.schedule_id)
        .fetch_one(&self.pool)
        .await;

        match res {
            Ok(job) => Ok(job),
            Err(e) if QueueError::is_unique_violation(&e) => Err(QueueError::conflict(format!(
                "idempotency key already used: {}",
                opts.idempotency_key.as_deref().unwrap_or("")
            ))),
            Err(e) => Err(e.into()),
        }
    }

    // ----------------------------
    // Claim / outcome transitions
    // ----------------------------

    /// Atomically claim the eligible job with the smallest `run_at`.
    ///
    /// Single statement: the inner select locks the row with
    /// `FOR UPDATE SKIP LOCKED`, so concurrent claimers (in this process or
    /// any other instance) never observe the same candidate. This is the
    /// primary mutual-exclusion guarantee of the queue.
    pub async fn claim(&self, worker_id: &str, lease: Duration) -> QueueResult<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET state = 'running',
                lease_until = now() + ($2::bigint * interval '1 second'),
                worker_id = $1,
                attempts = attempts + 1,
                last_run_at = now(),
                updated_at = now()
            WHERE id = (
                SELECT id
                FROM jobs
                WHERE state = 'queued'
                  AND run_at <= now()
                ORDER BY run_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(lease.as_secs() as i64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    pub async fn complete(&self, job_id: Uuid) -> QueueResult<Job> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET state = 'completed',
                completed_at = now(),
                lease_until = NULL,
                worker_id = NULL,
                updated_at = now()
            WHERE id = $1
              AND state = 'running'
            RETURNING *
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        match job {
            Some(job) => Ok(job),
            None => Err(self.transition_error(job_id, JobState::Running).await?),
        }
    }

    /// Record a failed attempt.
    ///
    /// Two conditional updates in one transaction: the first re-queues with
    /// backoff while attempts remain, the second marks the row terminally
    /// failed. The first's `attempts < max_attempts` guard rules out the
    /// second ever applying to the same attempt.
    pub async fn fail(
        &self,
        job_id: Uuid,
        error_message: &str,
        backoff: Duration,
    ) -> QueueResult<Job> {
        let mut tx = self.pool.begin().await?;

        let requeued = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET state = 'queued',
                run_at = now() + ($2::bigint * interval '1 second'),
                last_error = $3,
                lease_until = NULL,
                worker_id = NULL,
                updated_at = now()
            WHERE id = $1
              AND state = 'running'
              AND attempts < max_attempts
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(backoff.as_secs() as i64)
        .bind(error_message)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(job) = requeued {
            tx.commit().await?;
            return Ok(job);
        }

        let failed = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET state = 'failed',
                last_error = $2,
                lease_until = NULL,
                worker_id = NULL,
                updated_at = now()
            WHERE id = $1
              AND state = 'running'
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(error_message)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;

        match failed {
            Some(job) => Ok(job),
            None => Err(self.transition_error(job_id, JobState::Running).await?),
        }
    }

    /// Cancel a queued job. Running jobs cannot be canceled; they finish or
    /// time out.
    pub async fn cancel(&self, job_id: Uuid) -> QueueResult<Job> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET state = 'canceled',
                canceled_at = now(),
                updated_at = now()
            WHERE id = $1
              AND state = 'queued'
            RETURNING *
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        match job {
            Some(job) => Ok(job),
            None => Err(self.transition_error(job_id, JobState::Queued).await?),
        }
    }

    /// Admin-only: move a failed job back to the queue with a fresh attempt
    /// budget.
    pub async fn retry_now(&self, job_id: Uuid) -> QueueResult<Job> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET state = 'queued',
                attempts = 0,
                run_at = now(),
                updated_at = now()
            WHERE id = $1
              AND state = 'failed'
            RETURNING *
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        match job {
            Some(job) => Ok(job),
            None => Err(self.transition_error(job_id, JobState::Failed).await?),
        }
    }

    pub async fn extend_lease(&self, job_id: Uuid, lease: Duration) -> QueueResult<Job> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET lease_until = now() + ($2::bigint * interval '1 second'),
                updated_at = now()
            WHERE id = $1
              AND state = 'running'
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(lease.as_secs() as i64)
        .fetch_optional(&self.pool)
        .await?;

        match job {
            Some(job) => Ok(job),
            None => Err(self.transition_error(job_id, JobState::Running).await?),
        }
    }

    /// Crash recovery: re-queue every running row whose lease expired.
    /// Attempt counters are preserved so `fail` still respects
    /// `max_attempts` on subsequent claims.
    pub async fn recover_stalled_jobs(&self) -> QueueResult<u64> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'queued',
                lease_until = NULL,
                worker_id = NULL,
                updated_at = now()
            WHERE state = 'running'
              AND lease_until < now()
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    // ----------------------------
    // Reads
    // ----------------------------

    pub async fn get(&self, job_id: Uuid) -> QueueResult<Job> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        job.ok_or_else(|| QueueError::not_found(format!("job {job_id}")))
    }

    pub async fn list(&self, filter: JobFilter) -> QueueResult<Vec<Job>> {
        let limit = if filter.limit <= 0 { 100 } else { filter.limit.min(500) };
        let offset = filter.offset.max(0);

        let jobs = sqlx::query_as::<_, Job>(
            r#"
            SELECT *
            FROM jobs
            WHERE ($1::text IS NULL OR state = $1)
              AND ($2::text IS NULL OR job_type = $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(filter.state.map(|s| s.as_str()))
        .bind(filter.job_type.as_deref())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    pub async fn stats(&self) -> QueueResult<JobStats> {
        let counts: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM jobs GROUP BY state")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = JobStats {
            queued: 0,
            running: 0,
            completed: 0,
            failed: 0,
            canceled: 0,
            oldest_queued_age_seconds: 0,
        };
        for (state, count) in counts {
            match state.as_str() {
                "queued" => stats.queued = count,
                "running" => stats.running = count,
                "completed" => stats.completed = count,
                "failed" => stats.failed = count,
                "canceled" => stats.canceled = count,
                _ => {}
            }
        }

        let oldest: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT EXTRACT(EPOCH FROM (now() - MIN(created_at)))::bigint
            FROM jobs
            WHERE state = 'queued'
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        stats.oldest_queued_age_seconds = oldest.unwrap_or(0).max(0);
        Ok(stats)
    }

    // Distinguishes "no such job" from "job exists in the wrong state" so
    // the admin surface can answer 404 vs 412 precisely.
    async fn transition_error(
        &self,
        job_id: Uuid,
        expected: JobState,
    ) -> Result<QueueError, sqlx::Error> {
        let state: Option<String> = sqlx::query_scalar("SELECT state FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(match state {
            None => QueueError::not_found(format!("job {job_id}")),
            Some(actual) => QueueError::precondition(format!(
                "job {job_id} is {actual}, expected {}",
                expected.as_str()
            )),
        })
    }
}
