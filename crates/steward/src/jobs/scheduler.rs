use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::jobs::cron;
use crate::jobs::schedules::ScheduleStore;

/// Turns due schedules into queued jobs, exactly once per tick per
/// schedule across all replicas. The per-schedule advance is delegated to
/// `ScheduleStore::advance_and_enqueue`, whose conditional update is the
/// actual race arbiter; losing that race is the normal outcome on a
/// multi-instance deployment and only worth a debug line.
pub struct Scheduler {
    store: ScheduleStore,
    tick: Duration,
    instance_id: String,
}

impl Scheduler {
    pub fn new(store: ScheduleStore, tick: Duration, instance_id: String) -> Self {
        Self {
            store,
            tick,
            instance_id,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(instance_id = %self.instance_id, tick = ?self.tick, "scheduler started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.tick) => {}
            }

            self.tick_once().await;
        }

        info!(instance_id = %self.instance_id, "scheduler stopped");
    }

    /// One evaluation pass. Failures are isolated per schedule: a bad cron
    /// expression or a dropped connection on one row never aborts the tick.
    pub async fn tick_once(&self) {
        let due = match self.store.due_schedules().await {
            Ok(due) => due,
            Err(e) => {
                warn!(error = %e, "failed to read due schedules");
                return;
            }
        };

        for schedule in due {
            let next_run_at =
                match cron::next_occurrence(&schedule.cron_expr, &schedule.timezone, Utc::now()) {
                    Ok(next) => next,
                    Err(e) => {
                        error!(
                            schedule = %schedule.name,
                            cron_expr = %schedule.cron_expr,
                            error = %e,
                            "cannot evaluate schedule"
                        );
                        continue;
                    }
                };

            match self
                .store
                .advance_and_enqueue(
                    schedule.id,
                    next_run_at,
                    &schedule.job_type,
                    &schedule.payload,
                    schedule.max_attempts,
                )
                .await
            {
                Ok(true) => info!(
                    schedule = %schedule.name,
                    job_type = %schedule.job_type,
                    next_run_at = %next_run_at,
                    "schedule advanced, job enqueued"
                ),
                Ok(false) => debug!(
                    schedule = %schedule.name,
                    "schedule already advanced by another instance"
                ),
                Err(e) => warn!(schedule = %schedule.name, error = %e, "advance failed"),
            }
        }
    }
}
