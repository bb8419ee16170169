use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use sqlx::PgPool;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::QueueResult;
use crate::jobs::backoff::BackoffPolicy;
use crate::jobs::cron;
use crate::jobs::handlers;
use crate::jobs::model::{EnqueueOptions, Job, NewSchedule};
use crate::jobs::recovery::RecoveryLoop;
use crate::jobs::registry::HandlerRegistry;
use crate::jobs::scheduler::Scheduler;
use crate::jobs::schedules::ScheduleStore;
use crate::jobs::store::JobStore;
use crate::jobs::worker::{Worker, WorkerConfig};
use crate::matview::{MatviewStore, RefreshEngine};

/// Default schedules registered idempotently on startup. An operator who
/// tuned one of these keeps their tuning; upsert never overwrites.
const DEFAULT_SCHEDULES: &[(&str, &str, &str)] = &[
    ("session_cleanup_hourly", "0 * * * *", handlers::STALE_SESSION_CLEANUP),
    ("webhook_delivery_prune_daily", "0 3 * * *", handlers::WEBHOOK_DELIVERY_PRUNE),
    ("expired_oauth_cleanup_daily", "0 4 * * *", handlers::EXPIRED_OAUTH_CLEANUP),
    ("expired_auth_cleanup_daily", "0 5 * * *", handlers::EXPIRED_AUTH_CLEANUP),
];

/// The facade that wires the store, the registry and the background loops
/// together. One `JobService` per instance; any number of instances share
/// the database.
#[derive(Clone)]
pub struct JobService {
    config: Config,
    jobs: JobStore,
    schedules: ScheduleStore,
    matviews: MatviewStore,
    refresh: RefreshEngine,
    registry: Arc<HandlerRegistry>,
    pool: PgPool,
}

impl JobService {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let jobs = JobStore::new(pool.clone());
        let schedules = ScheduleStore::new(pool.clone());
        let matviews = MatviewStore::new(pool.clone());
        let refresh = RefreshEngine::new(pool.clone(), matviews.clone());

        let service = Self {
            config,
            jobs,
            schedules,
            matviews,
            refresh,
            registry: Arc::new(HandlerRegistry::new()),
            pool,
        };
        service.register_builtin_handlers();
        service
    }

    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    pub fn schedules(&self) -> &ScheduleStore {
        &self.schedules
    }

    pub fn matviews(&self) -> &MatviewStore {
        &self.matviews
    }

    pub fn refresh_engine(&self) -> &RefreshEngine {
        &self.refresh
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// New job types are added here at startup, never by editing the queue.
    pub fn register_handler<F, Fut>(&self, job_type: &str, handler: F)
    where
        F: Fn(crate::jobs::registry::HandlerContext, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.registry.register(job_type, handler);
    }

    fn register_builtin_handlers(&self) {
        self.registry.register(handlers::NO_OP, handlers::no_op);
        self.registry
            .register(handlers::STALE_SESSION_CLEANUP, handlers::stale_session_cleanup);
        self.registry
            .register(handlers::WEBHOOK_DELIVERY_PRUNE, handlers::webhook_delivery_prune);
        self.registry
            .register(handlers::EXPIRED_OAUTH_CLEANUP, handlers::expired_oauth_cleanup);
        self.registry
            .register(handlers::EXPIRED_AUTH_CLEANUP, handlers::expired_auth_cleanup);

        let engine = self.refresh.clone();
        self.registry
            .register(handlers::MATERIALIZED_VIEW_REFRESH, move |_ctx, payload| {
                handlers::materialized_view_refresh(engine.clone(), payload)
            });
    }

    /// Insert-on-conflict-do-nothing for each built-in schedule.
    pub async fn register_default_schedules(&self) -> QueueResult<()> {
        for (name, cron_expr, job_type) in DEFAULT_SCHEDULES {
            let next_run_at = cron::next_occurrence(cron_expr, "UTC", Utc::now())?;

            self.schedules
                .upsert(NewSchedule {
                    name: name.to_string(),
                    job_type: job_type.to_string(),
                    payload: json!({}),
                    cron_expr: cron_expr.to_string(),
                    timezone: "UTC".to_string(),
                    max_attempts: self.config.max_retries_default.max(1),
                    enabled: true,
                    next_run_at,
                })
                .await?;
        }
        Ok(())
    }

    pub async fn enqueue(
        &self,
        job_type: &str,
        payload: Value,
        mut opts: EnqueueOptions,
    ) -> QueueResult<Job> {
        if opts.max_attempts.is_none() {
            opts.max_attempts = Some(self.config.max_retries_default.max(1));
        }
        self.jobs.enqueue(job_type, payload, opts).await
    }

    /// Start the background loops. With `enabled = false` nothing runs and
    /// the returned handle shuts down instantly; the store and admin
    /// surface stay fully usable either way.
    pub fn start(&self) -> ServiceHandle {
        let scheduler_cancel = CancellationToken::new();
        let recovery_cancel = CancellationToken::new();
        let poll_cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();

        if !self.config.enabled {
            info!("job service disabled; no background tasks started");
            return ServiceHandle {
                scheduler_cancel,
                recovery_cancel,
                poll_cancel,
                tasks,
                shutdown_timeout: self.config.shutdown_timeout,
            };
        }

        info!(
            instance_id = %self.config.instance_id,
            concurrency = self.config.worker_concurrency,
            scheduler = self.config.scheduler_enabled,
            "job service starting"
        );

        if self.config.scheduler_enabled {
            let scheduler = Scheduler::new(
                self.schedules.clone(),
                self.config.scheduler_tick,
                self.config.instance_id.clone(),
            );
            let cancel = scheduler_cancel.clone();
            tasks.spawn(async move { scheduler.run(cancel).await });
        }

        let recovery = RecoveryLoop::new(self.jobs.clone(), self.config.lease_duration);
        let cancel = recovery_cancel.clone();
        tasks.spawn(async move { recovery.run(cancel).await });

        let worker_config = WorkerConfig {
            instance_id: self.config.instance_id.clone(),
            concurrency: self.config.worker_concurrency,
            poll_interval: self.config.poll_interval,
            lease_duration: self.config.lease_duration,
            shutdown_timeout: self.config.shutdown_timeout,
        };
        for index in 0..worker_config.concurrency {
            let worker = Worker::new(
                self.jobs.clone(),
                self.pool.clone(),
                Arc::clone(&self.registry),
                BackoffPolicy::default(),
                worker_config.clone(),
                index,
            );
            let cancel = poll_cancel.clone();
            tasks.spawn(async move { worker.run(cancel).await });
        }

        ServiceHandle {
            scheduler_cancel,
            recovery_cancel,
            poll_cancel,
            tasks,
            shutdown_timeout: self.config.shutdown_timeout,
        }
    }
}

/// Owns the running background tasks. Dropping it aborts them; call
/// `shutdown` for the graceful path.
pub struct ServiceHandle {
    scheduler_cancel: CancellationToken,
    recovery_cancel: CancellationToken,
    poll_cancel: CancellationToken,
    tasks: JoinSet<()>,
    shutdown_timeout: Duration,
}

impl ServiceHandle {
    /// Graceful drain: stop the scheduler, stop recovery, stop claiming,
    /// then wait for in-flight handlers up to the shutdown timeout.
    /// Handlers already executing keep running on a detached context, so a
    /// draining instance still finalizes their outcomes.
    pub async fn shutdown(self) {
        let ServiceHandle {
            scheduler_cancel,
            recovery_cancel,
            poll_cancel,
            mut tasks,
            shutdown_timeout,
        } = self;

        scheduler_cancel.cancel();
        recovery_cancel.cancel();
        poll_cancel.cancel();

        // Workers finish their in-flight dispatch before observing the
        // cancel, and each dispatch is itself bounded by shutdown_timeout;
        // a small grace period covers the outcome writes.
        let budget = shutdown_timeout + Duration::from_secs(1);
        let drain = async {
            while tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(budget, drain).await.is_err() {
            warn!("shutdown timeout elapsed with tasks still running; aborting them");
            tasks.abort_all();
        }

        info!("job service stopped");
    }
}
