use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::QueueError;
use crate::jobs::backoff::BackoffPolicy;
use crate::jobs::model::Job;
use crate::jobs::registry::{HandlerContext, HandlerRegistry};
use crate::jobs::store::JobStore;

#[derive(Clone)]
pub struct WorkerConfig {
    pub instance_id: String,
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub lease_duration: Duration,
    pub shutdown_timeout: Duration,
}

/// One polling worker. The pool spawns `concurrency` of these, each with
/// its own id, all sharing the store and registry.
pub struct Worker {
    store: JobStore,
    pool: PgPool,
    registry: Arc<HandlerRegistry>,
    backoff: BackoffPolicy,
    config: WorkerConfig,
    worker_id: String,
}

impl Worker {
    pub fn new(
        store: JobStore,
        pool: PgPool,
        registry: Arc<HandlerRegistry>,
        backoff: BackoffPolicy,
        config: WorkerConfig,
        index: usize,
    ) -> Self {
        let worker_id = format!("{}-{}", config.instance_id, index);
        Self {
            store,
            pool,
            registry,
            backoff,
            config,
            worker_id,
        }
    }

    /// Poll-claim-dispatch loop. `poll_cancel` stops new claims; a dispatch
    /// already in flight always runs to its outcome before the loop exits,
    /// which is what lets shutdown drain cleanly.
    pub async fn run(self, poll_cancel: CancellationToken) {
        debug!(worker_id = %self.worker_id, "worker started");

        loop {
            tokio::select! {
                _ = poll_cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }

            let claimed = match self
                .store
                .claim(&self.worker_id, self.config.lease_duration)
                .await
            {
                Ok(job) => job,
                Err(e) => {
                    // Transient: the next poll tick retries.
                    warn!(worker_id = %self.worker_id, error = %e, "claim failed");
                    continue;
                }
            };

            let Some(job) = claimed else { continue };
            self.dispatch(job).await;
        }

        debug!(worker_id = %self.worker_id, "worker stopped");
    }

    async fn dispatch(&self, job: Job) {
        let job_id = job.id;
        let job_type = job.job_type.clone();
        let attempt = job.attempts;

        debug!(
            worker_id = %self.worker_id,
            job_id = %job_id,
            job_type = %job_type,
            attempt,
            "claimed job"
        );

        let Some(handler) = self.registry.get(&job_type) else {
            let msg = format!("no handler registered for job type {job_type:?}");
            warn!(worker_id = %self.worker_id, job_id = %job_id, "{msg}");
            self.record_failure(&job, &msg).await;
            return;
        };

        // Renewer holds the lease while the handler runs; it dies with this
        // token, which is cancelled the moment the handler returns.
        let renew_cancel = CancellationToken::new();
        let renewer = tokio::spawn(renew_lease(
            self.store.clone(),
            job_id,
            self.config.lease_duration,
            renew_cancel.clone(),
        ));

        // The handler context is detached from the poll loop: a draining
        // instance keeps executing in-flight jobs up to the shutdown
        // timeout, then finalizes their outcome.
        let handler_cancel = CancellationToken::new();
        let ctx = HandlerContext {
            db: self.pool.clone(),
            cancel: handler_cancel.clone(),
        };

        let result = tokio::time::timeout(
            self.config.shutdown_timeout,
            handler(ctx, job.payload.clone()),
        )
        .await;

        handler_cancel.cancel();
        renew_cancel.cancel();
        let _ = renewer.await;

        match result {
            Ok(Ok(())) => {
                match self.store.complete(job_id).await {
                    Ok(_) => info!(
                        worker_id = %self.worker_id,
                        job_id = %job_id,
                        job_type = %job_type,
                        attempt,
                        "job completed"
                    ),
                    Err(e) => self.log_finalize_error(job_id, &e),
                }
            }
            Ok(Err(e)) => {
                self.record_failure(&job, &e.to_string()).await;
            }
            Err(_) => {
                let msg = format!(
                    "handler exceeded execution deadline of {:?}",
                    self.config.shutdown_timeout
                );
                self.record_failure(&job, &msg).await;
            }
        }
    }

    async fn record_failure(&self, job: &Job, message: &str) {
        let delay = self.backoff.delay(job.attempts);

        match self.store.fail(job.id, message, delay).await {
            Ok(updated) => warn!(
                worker_id = %self.worker_id,
                job_id = %job.id,
                job_type = %job.job_type,
                attempt = job.attempts,
                state = %updated.state,
                error = %message,
                "job failed"
            ),
            Err(e) => self.log_finalize_error(job.id, &e),
        }
    }

    // A worker never takes the process down over a final-state write; the
    // lease will expire and recovery re-queues the row.
    fn log_finalize_error(&self, job_id: uuid::Uuid, err: &QueueError) {
        error!(
            worker_id = %self.worker_id,
            job_id = %job_id,
            error = %err,
            "failed to record job outcome"
        );
    }
}

/// Extends the lease every `lease / 2` (at least 1s) until cancelled.
/// Stops on its own when the job left the running state.
async fn renew_lease(
    store: JobStore,
    job_id: uuid::Uuid,
    lease: Duration,
    cancel: CancellationToken,
) {
    let period = Duration::from_secs((lease.as_secs() / 2).max(1));
    let mut interval = tokio::time::interval(period);
    interval.tick().await; // immediate first tick

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                match store.extend_lease(job_id, lease).await {
                    Ok(_) => debug!(job_id = %job_id, "lease extended"),
                    Err(QueueError::Precondition(_)) | Err(QueueError::NotFound(_)) => break,
                    Err(e) => warn!(job_id = %job_id, error = %e, "lease renewal failed"),
                }
            }
        }
    }
}
