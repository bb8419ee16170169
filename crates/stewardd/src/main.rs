//! Single-binary server: job service + admin API, sharing one pool.

use anyhow::Context;
use steward::api::{self, ApiState};
use steward::{db, Config, JobService};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,steward=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("failed to load configuration")?;

    tracing::info!(
        instance_id = %config.instance_id,
        enabled = config.enabled,
        scheduler = config.scheduler_enabled,
        concurrency = config.worker_concurrency,
        "stewardd starting"
    );

    let pool = db::make_pool(&config.database_url)
        .await
        .context("failed to connect to database")?;

    if config.migrate_on_startup {
        db::run_migrations(&pool)
            .await
            .context("failed to run migrations")?;
        tracing::info!("migrations applied");
    }

    let service = JobService::new(pool, config.clone());

    if config.enabled {
        service
            .register_default_schedules()
            .await
            .context("failed to register default schedules")?;
    }

    let handle = service.start();

    // Admin API task; pending forever when no bind address is configured.
    let api_state = ApiState {
        service: service.clone(),
        admin_token: config.admin_token.clone(),
    };
    let admin_addr = config.admin_addr.clone();
    let api_task = tokio::spawn(async move {
        if let Some(addr) = admin_addr {
            let app = api::router(api_state);
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            tracing::info!(addr = %addr, "admin api listening");
            axum::serve(listener, app).await?;
        } else {
            std::future::pending::<()>().await;
        }
        Ok::<(), anyhow::Error>(())
    });

    tokio::select! {
        res = api_task => res??,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received, draining");
        }
    }

    handle.shutdown().await;
    Ok(())
}
