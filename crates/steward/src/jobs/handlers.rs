//! Built-in job handlers.
//!
//! Every handler is idempotent: the queue is at-least-once, so a handler
//! may run again for work that already happened (a worker can die after
//! its side effects but before recording completion). All of these are
//! either pure deletes of already-expired rows or a matview refresh, which
//! re-running only wastes.

use anyhow::Context;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::jobs::registry::HandlerContext;
use crate::matview::RefreshEngine;

pub const STALE_SESSION_CLEANUP: &str = "stale_session_cleanup";
pub const WEBHOOK_DELIVERY_PRUNE: &str = "webhook_delivery_prune";
pub const EXPIRED_OAUTH_CLEANUP: &str = "expired_oauth_cleanup";
pub const EXPIRED_AUTH_CLEANUP: &str = "expired_auth_cleanup";
pub const MATERIALIZED_VIEW_REFRESH: &str = "materialized_view_refresh";
pub const NO_OP: &str = "no_op";

fn parse_payload<T: for<'de> Deserialize<'de>>(payload: Value) -> anyhow::Result<T> {
    serde_json::from_value(payload).context("invalid payload shape")
}

pub async fn no_op(_ctx: HandlerContext, _payload: Value) -> anyhow::Result<()> {
    Ok(())
}

pub async fn stale_session_cleanup(ctx: HandlerContext, _payload: Value) -> anyhow::Result<()> {
    let deleted = sqlx::query("DELETE FROM sessions WHERE expires_at < now()")
        .execute(&ctx.db)
        .await?
        .rows_affected();

    if deleted > 0 {
        info!(deleted, "removed expired sessions");
    }
    Ok(())
}

#[derive(Deserialize)]
struct WebhookPrunePayload {
    #[serde(default = "default_retention_hours")]
    retention_hours: i64,
}

fn default_retention_hours() -> i64 {
    168
}

pub async fn webhook_delivery_prune(ctx: HandlerContext, payload: Value) -> anyhow::Result<()> {
    let payload: WebhookPrunePayload = parse_payload(payload)?;
    if payload.retention_hours < 1 {
        anyhow::bail!("retention_hours must be >= 1");
    }

    let deleted = sqlx::query(
        "DELETE FROM webhook_deliveries WHERE created_at < now() - ($1::bigint * interval '1 hour')",
    )
    .bind(payload.retention_hours)
    .execute(&ctx.db)
    .await?
    .rows_affected();

    if deleted > 0 {
        info!(deleted, retention_hours = payload.retention_hours, "pruned webhook deliveries");
    }
    Ok(())
}

pub async fn expired_oauth_cleanup(ctx: HandlerContext, _payload: Value) -> anyhow::Result<()> {
    // Tokens linger one day past expiry or revocation so in-flight
    // introspection can still explain why a token stopped working.
    let tokens = sqlx::query(
        r#"
        DELETE FROM oauth_tokens
        WHERE expires_at < now() - interval '1 day'
           OR revoked_at < now() - interval '1 day'
        "#,
    )
    .execute(&ctx.db)
    .await?
    .rows_affected();

    let codes = sqlx::query(
        r#"
        DELETE FROM oauth_auth_codes
        WHERE expires_at < now()
           OR used_at < now() - interval '1 day'
        "#,
    )
    .execute(&ctx.db)
    .await?
    .rows_affected();

    if tokens > 0 || codes > 0 {
        info!(tokens, codes, "removed expired oauth rows");
    }
    Ok(())
}

pub async fn expired_auth_cleanup(ctx: HandlerContext, _payload: Value) -> anyhow::Result<()> {
    let magic_links = sqlx::query("DELETE FROM magic_links WHERE expires_at < now()")
        .execute(&ctx.db)
        .await?
        .rows_affected();

    let password_resets = sqlx::query("DELETE FROM password_resets WHERE expires_at < now()")
        .execute(&ctx.db)
        .await?
        .rows_affected();

    if magic_links > 0 || password_resets > 0 {
        info!(magic_links, password_resets, "removed expired auth artifacts");
    }
    Ok(())
}

#[derive(Deserialize)]
struct MatviewRefreshPayload {
    #[serde(default = "default_schema")]
    schema: String,
    view_name: String,
}

fn default_schema() -> String {
    "public".to_string()
}

pub async fn materialized_view_refresh(
    engine: RefreshEngine,
    payload: Value,
) -> anyhow::Result<()> {
    let payload: MatviewRefreshPayload = parse_payload(payload)?;

    let outcome = engine
        .refresh_target(&payload.schema, &payload.view_name)
        .await?;

    info!(
        schema = %outcome.schema_name,
        view = %outcome.view_name,
        duration_ms = outcome.duration_ms,
        "materialized view refreshed"
    );
    Ok(())
}
