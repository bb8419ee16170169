//! Built-in handlers exercised directly against their collaborator tables.
//! The tables belong to the surrounding system; tests create throwaway
//! versions with the columns the handlers touch.

mod common;

use common::setup_db;
use serde_json::json;
use serial_test::serial;
use sqlx::PgPool;
use steward::jobs::handlers;
use steward::jobs::registry::HandlerContext;
use tokio_util::sync::CancellationToken;

async fn exec(pool: &PgPool, sql: &str) {
    sqlx::query(sql).execute(pool).await.unwrap();
}

async fn count(pool: &PgPool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(pool)
        .await
        .unwrap()
}

fn ctx(pool: &PgPool) -> HandlerContext {
    HandlerContext {
        db: pool.clone(),
        cancel: CancellationToken::new(),
    }
}

#[tokio::test]
#[serial]
async fn stale_session_cleanup_deletes_only_expired_rows() {
    let Some(pool) = setup_db().await else { return };

    exec(&pool, "DROP TABLE IF EXISTS sessions").await;
    exec(
        &pool,
        "CREATE TABLE sessions (id UUID PRIMARY KEY DEFAULT gen_random_uuid(), \
         expires_at TIMESTAMPTZ NOT NULL)",
    )
    .await;
    exec(&pool, "INSERT INTO sessions (expires_at) VALUES (now() - interval '1 hour')").await;
    exec(&pool, "INSERT INTO sessions (expires_at) VALUES (now() + interval '1 hour')").await;

    handlers::stale_session_cleanup(ctx(&pool), json!({})).await.unwrap();

    assert_eq!(count(&pool, "sessions").await, 1);
}

#[tokio::test]
#[serial]
async fn webhook_prune_honors_retention_hours() {
    let Some(pool) = setup_db().await else { return };

    exec(&pool, "DROP TABLE IF EXISTS webhook_deliveries").await;
    exec(
        &pool,
        "CREATE TABLE webhook_deliveries (id UUID PRIMARY KEY DEFAULT gen_random_uuid(), \
         created_at TIMESTAMPTZ NOT NULL)",
    )
    .await;
    exec(
        &pool,
        "INSERT INTO webhook_deliveries (created_at) VALUES \
         (now() - interval '10 days'), (now() - interval '2 hours'), (now())",
    )
    .await;

    // Default retention is 168h: only the 10-day-old row goes.
    handlers::webhook_delivery_prune(ctx(&pool), json!({})).await.unwrap();
    assert_eq!(count(&pool, "webhook_deliveries").await, 2);

    // Tightened to 1h, the 2-hour-old row goes too.
    handlers::webhook_delivery_prune(ctx(&pool), json!({ "retention_hours": 1 }))
        .await
        .unwrap();
    assert_eq!(count(&pool, "webhook_deliveries").await, 1);
}

#[tokio::test]
#[serial]
async fn webhook_prune_rejects_bad_payloads() {
    let Some(pool) = setup_db().await else { return };

    let err = handlers::webhook_delivery_prune(ctx(&pool), json!({ "retention_hours": "soon" }))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("invalid payload"));

    let err = handlers::webhook_delivery_prune(ctx(&pool), json!({ "retention_hours": 0 }))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("retention_hours"));
}

#[tokio::test]
#[serial]
async fn oauth_cleanup_applies_one_day_grace() {
    let Some(pool) = setup_db().await else { return };

    exec(&pool, "DROP TABLE IF EXISTS oauth_tokens").await;
    exec(&pool, "DROP TABLE IF EXISTS oauth_auth_codes").await;
    exec(
        &pool,
        "CREATE TABLE oauth_tokens (id UUID PRIMARY KEY DEFAULT gen_random_uuid(), \
         expires_at TIMESTAMPTZ, revoked_at TIMESTAMPTZ)",
    )
    .await;
    exec(
        &pool,
        "CREATE TABLE oauth_auth_codes (id UUID PRIMARY KEY DEFAULT gen_random_uuid(), \
         expires_at TIMESTAMPTZ NOT NULL, used_at TIMESTAMPTZ)",
    )
    .await;

    // Tokens: expired 2 days ago (goes), expired 1 hour ago (grace, stays),
    // revoked 2 days ago (goes), live (stays).
    exec(
        &pool,
        "INSERT INTO oauth_tokens (expires_at, revoked_at) VALUES \
         (now() - interval '2 days', NULL), \
         (now() - interval '1 hour', NULL), \
         (now() + interval '1 day', now() - interval '2 days'), \
         (now() + interval '1 day', NULL)",
    )
    .await;

    // Codes: expired (goes), used 2 days ago (goes), used just now (stays).
    exec(
        &pool,
        "INSERT INTO oauth_auth_codes (expires_at, used_at) VALUES \
         (now() - interval '1 minute', NULL), \
         (now() + interval '1 hour', now() - interval '2 days'), \
         (now() + interval '1 hour', now())",
    )
    .await;

    handlers::expired_oauth_cleanup(ctx(&pool), json!({})).await.unwrap();

    assert_eq!(count(&pool, "oauth_tokens").await, 2);
    assert_eq!(count(&pool, "oauth_auth_codes").await, 1);
}

#[tokio::test]
#[serial]
async fn auth_cleanup_removes_expired_links_and_resets() {
    let Some(pool) = setup_db().await else { return };

    exec(&pool, "DROP TABLE IF EXISTS magic_links").await;
    exec(&pool, "DROP TABLE IF EXISTS password_resets").await;
    exec(
        &pool,
        "CREATE TABLE magic_links (id UUID PRIMARY KEY DEFAULT gen_random_uuid(), \
         expires_at TIMESTAMPTZ NOT NULL)",
    )
    .await;
    exec(
        &pool,
        "CREATE TABLE password_resets (id UUID PRIMARY KEY DEFAULT gen_random_uuid(), \
         expires_at TIMESTAMPTZ NOT NULL)",
    )
    .await;
    exec(
        &pool,
        "INSERT INTO magic_links (expires_at) VALUES \
         (now() - interval '1 minute'), (now() + interval '10 minutes')",
    )
    .await;
    exec(
        &pool,
        "INSERT INTO password_resets (expires_at) VALUES \
         (now() - interval '1 minute'), (now() + interval '10 minutes')",
    )
    .await;

    handlers::expired_auth_cleanup(ctx(&pool), json!({})).await.unwrap();

    assert_eq!(count(&pool, "magic_links").await, 1);
    assert_eq!(count(&pool, "password_resets").await, 1);
}

#[tokio::test]
#[serial]
async fn handlers_are_idempotent_on_rerun() {
    let Some(pool) = setup_db().await else { return };

    exec(&pool, "DROP TABLE IF EXISTS sessions").await;
    exec(
        &pool,
        "CREATE TABLE sessions (id UUID PRIMARY KEY DEFAULT gen_random_uuid(), \
         expires_at TIMESTAMPTZ NOT NULL)",
    )
    .await;
    exec(&pool, "INSERT INTO sessions (expires_at) VALUES (now() - interval '1 hour')").await;

    // At-least-once delivery: a second run of the same cleanup is a no-op.
    handlers::stale_session_cleanup(ctx(&pool), json!({})).await.unwrap();
    handlers::stale_session_cleanup(ctx(&pool), json!({})).await.unwrap();

    assert_eq!(count(&pool, "sessions").await, 0);
}
