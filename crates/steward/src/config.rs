use std::time::Duration;

use uuid::Uuid;

/// Runtime configuration, loaded from environment variables.
///
/// Every numeric knob is clamped to its documented range rather than
/// rejected, so a fat-fingered deployment degrades to a sane value.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub instance_id: String,

    /// Master switch. When false no background tasks run at all.
    pub enabled: bool,
    /// Worker tasks per instance (1-64).
    pub worker_concurrency: usize,
    /// Worker poll period (100ms-60s).
    pub poll_interval: Duration,
    /// Claim lease length (30s-3600s); also paces the recovery loop.
    pub lease_duration: Duration,
    /// Default max_attempts for enqueues that omit it (0 is bumped to 1).
    pub max_retries_default: i32,
    /// Runs the scheduler loop on this instance.
    pub scheduler_enabled: bool,
    /// Scheduler wake period (5s-3600s).
    pub scheduler_tick: Duration,
    /// Bounds in-flight handler execution during drain.
    pub shutdown_timeout: Duration,

    /// Admin API bind address; None disables the API.
    pub admin_addr: Option<String>,
    /// Bearer token required by the admin API; None disables auth.
    pub admin_token: Option<String>,
    pub migrate_on_startup: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL is missing"))?;

        let instance_id = env_str("STEWARD_INSTANCE_ID")
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| format!("steward-{}", Uuid::new_v4()));

        let enabled = env_bool("STEWARD_JOBS_ENABLED").unwrap_or(false);

        let worker_concurrency = env_i64("STEWARD_WORKER_CONCURRENCY")
            .unwrap_or(4)
            .clamp(1, 64) as usize;

        let poll_interval_ms = env_i64("STEWARD_POLL_INTERVAL_MS")
            .unwrap_or(1_000)
            .clamp(100, 60_000) as u64;

        let lease_duration_s = env_i64("STEWARD_LEASE_DURATION_S")
            .unwrap_or(300)
            .clamp(30, 3_600) as u64;

        let max_retries_default =
            env_i64("STEWARD_MAX_RETRIES_DEFAULT").unwrap_or(3).clamp(0, 100) as i32;

        let scheduler_enabled = env_bool("STEWARD_SCHEDULER_ENABLED").unwrap_or(true);

        let scheduler_tick_s = env_i64("STEWARD_SCHEDULER_TICK_S")
            .unwrap_or(15)
            .clamp(5, 3_600) as u64;

        let shutdown_timeout_s = env_i64("STEWARD_SHUTDOWN_TIMEOUT_S")
            .unwrap_or(30)
            .clamp(1, 600) as u64;

        let admin_addr = env_str("STEWARD_ADMIN_ADDR").and_then(|s| normalize_addr(&s));
        let admin_token = env_str("STEWARD_ADMIN_TOKEN");
        let migrate_on_startup = env_bool("STEWARD_MIGRATE_ON_STARTUP").unwrap_or(false);

        Ok(Self {
            database_url,
            instance_id,
            enabled,
            worker_concurrency,
            poll_interval: Duration::from_millis(poll_interval_ms),
            lease_duration: Duration::from_secs(lease_duration_s),
            max_retries_default,
            scheduler_enabled,
            scheduler_tick: Duration::from_secs(scheduler_tick_s),
            shutdown_timeout: Duration::from_secs(shutdown_timeout_s),
            admin_addr,
            admin_token,
            migrate_on_startup,
        })
    }

    /// Defaults suitable for tests: everything on, short timings.
    pub fn for_tests(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            instance_id: format!("test-{}", Uuid::new_v4()),
            enabled: true,
            worker_concurrency: 2,
            poll_interval: Duration::from_millis(100),
            lease_duration: Duration::from_secs(30),
            max_retries_default: 3,
            scheduler_enabled: true,
            scheduler_tick: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
            admin_addr: None,
            admin_token: None,
            migrate_on_startup: false,
        }
    }
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn env_i64(key: &str) -> Option<i64> {
    env_str(key).and_then(|s| s.parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn normalize_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() || matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}
