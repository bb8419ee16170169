use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::jobs::store::JobStore;

/// Periodic sweep that re-queues jobs whose lease expired because their
/// worker died mid-execution. Wakes every `max(lease_duration, 30s)`.
pub struct RecoveryLoop {
    store: JobStore,
    period: Duration,
}

impl RecoveryLoop {
    pub fn new(store: JobStore, lease_duration: Duration) -> Self {
        Self {
            store,
            period: lease_duration.max(Duration::from_secs(30)),
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(period = ?self.period, "recovery loop started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.period) => {}
            }

            match self.store.recover_stalled_jobs().await {
                Ok(0) => {}
                Ok(n) => info!(recovered = n, "re-queued stalled jobs"),
                Err(e) => warn!(error = %e, "recovery sweep failed"),
            }
        }

        info!("recovery loop stopped");
    }
}
