mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::setup_db;
use serde_json::json;
use serial_test::serial;
use sqlx::PgPool;
use steward::jobs::model::EnqueueOptions;
use steward::{Config, JobService};
use uuid::Uuid;

/// Polls until the job satisfies `pred(state, attempts)` or the timeout
/// elapses. Predicates include the attempt counter because a job is
/// `queued` both before its first claim and after a retryable failure.
async fn wait_for(
    pool: &PgPool,
    id: Uuid,
    timeout: Duration,
    pred: impl Fn(&str, i32) -> bool,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        let (state, attempts): (String, i32) =
            sqlx::query_as("SELECT state, attempts FROM jobs WHERE id = $1")
                .bind(id)
                .fetch_one(pool)
                .await
                .unwrap();
        if pred(&state, attempts) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

fn test_service(pool: &PgPool) -> JobService {
    JobService::new(pool.clone(), Config::for_tests("postgres://unused"))
}

async fn skip_backoff(pool: &PgPool, id: Uuid) {
    sqlx::query("UPDATE jobs SET run_at = now() WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .unwrap();
}

#[tokio::test]
#[serial]
async fn happy_path_queued_running_completed() {
    let Some(pool) = setup_db().await else { return };

    let service = test_service(&pool);
    let job = service
        .enqueue("no_op", json!({}), EnqueueOptions::default())
        .await
        .unwrap();

    let handle = service.start();
    assert!(
        wait_for(&pool, job.id, Duration::from_secs(5), |s, _| s == "completed").await,
        "job never completed"
    );
    handle.shutdown().await;

    let job = service.jobs().get(job.id).await.unwrap();
    assert_eq!(job.state, "completed");
    assert_eq!(job.attempts, 1);
    assert!(job.completed_at.is_some());
    assert!(job.lease_until.is_none());
    assert!(job.worker_id.is_none());
}

#[tokio::test]
#[serial]
async fn failing_handler_retries_then_succeeds() {
    let Some(pool) = setup_db().await else { return };

    let service = test_service(&pool);
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_in_handler = Arc::clone(&calls);
    service.register_handler("flaky_once", move |_ctx, _payload| {
        let calls = Arc::clone(&calls_in_handler);
        async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("transient wobble");
            }
            Ok(())
        }
    });

    let job = service
        .enqueue("flaky_once", json!({}), EnqueueOptions::default())
        .await
        .unwrap();

    let handle = service.start();

    // Attempt 1 fails and is re-queued with backoff.
    assert!(
        wait_for(&pool, job.id, Duration::from_secs(5), |s, a| s == "queued" && a == 1).await,
        "job was not re-queued after the first failure"
    );

    let after_first = service.jobs().get(job.id).await.unwrap();
    assert_eq!(after_first.last_error.as_deref(), Some("transient wobble"));
    let delay = after_first.run_at - after_first.last_run_at.unwrap();
    assert!(
        delay >= chrono::Duration::seconds(5),
        "backoff must push the retry out by at least the base, got {delay}"
    );

    // Skip the backoff wait instead of sleeping through it.
    skip_backoff(&pool, job.id).await;

    assert!(
        wait_for(&pool, job.id, Duration::from_secs(5), |s, _| s == "completed").await,
        "job never completed on the second attempt"
    );
    handle.shutdown().await;

    let done = service.jobs().get(job.id).await.unwrap();
    assert_eq!(done.attempts, 2);
    assert_eq!(done.last_error.as_deref(), Some("transient wobble"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
#[serial]
async fn always_failing_handler_exhausts_attempts() {
    let Some(pool) = setup_db().await else { return };

    let service = test_service(&pool);
    service.register_handler("doomed", |_ctx, _payload| async {
        anyhow::bail!("permanent failure")
    });

    let job = service
        .enqueue(
            "doomed",
            json!({}),
            EnqueueOptions {
                max_attempts: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let handle = service.start();

    assert!(
        wait_for(&pool, job.id, Duration::from_secs(5), |s, a| s == "queued" && a == 1).await,
        "first failure should re-queue"
    );
    skip_backoff(&pool, job.id).await;

    assert!(
        wait_for(&pool, job.id, Duration::from_secs(5), |s, _| s == "failed").await,
        "second failure should be terminal"
    );
    handle.shutdown().await;

    let done = service.jobs().get(job.id).await.unwrap();
    assert_eq!(done.attempts, 2);
    assert_eq!(done.last_error.as_deref(), Some("permanent failure"));
}

#[tokio::test]
#[serial]
async fn unknown_job_type_fails_with_structured_error() {
    let Some(pool) = setup_db().await else { return };

    let service = test_service(&pool);
    let job = service
        .enqueue(
            "ghost_type",
            json!({}),
            EnqueueOptions {
                max_attempts: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let handle = service.start();
    assert!(
        wait_for(&pool, job.id, Duration::from_secs(5), |s, _| s == "failed").await,
        "unregistered job type should fail"
    );
    handle.shutdown().await;

    let done = service.jobs().get(job.id).await.unwrap();
    assert!(
        done.last_error.unwrap().contains("no handler registered"),
        "error must name the missing handler"
    );
}

#[tokio::test]
#[serial]
async fn shutdown_drains_in_flight_work_and_stops_claiming() {
    let Some(pool) = setup_db().await else { return };

    let service = test_service(&pool);
    service.register_handler("slow", |_ctx, _payload| async {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(())
    });

    let job = service
        .enqueue("slow", json!({}), EnqueueOptions::default())
        .await
        .unwrap();

    let handle = service.start();
    assert!(
        wait_for(&pool, job.id, Duration::from_secs(5), |s, _| s == "running").await,
        "job never started"
    );

    // Shutdown mid-execution must wait for the handler, not abandon it.
    handle.shutdown().await;

    let done = service.jobs().get(job.id).await.unwrap();
    assert_eq!(done.state, "completed", "in-flight job must finish during drain");

    // No claims after shutdown: a fresh job stays queued.
    let late = service
        .enqueue("no_op", json!({}), EnqueueOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    let late = service.jobs().get(late.id).await.unwrap();
    assert_eq!(late.state, "queued");
}

#[tokio::test]
#[serial]
async fn disabled_service_starts_nothing() {
    let Some(pool) = setup_db().await else { return };

    let mut config = Config::for_tests("postgres://unused");
    config.enabled = false;
    let service = JobService::new(pool.clone(), config);

    let job = service
        .enqueue("no_op", json!({}), EnqueueOptions::default())
        .await
        .unwrap();

    let handle = service.start();
    tokio::time::sleep(Duration::from_millis(400)).await;
    handle.shutdown().await;

    let job = service.jobs().get(job.id).await.unwrap();
    assert_eq!(job.state, "queued", "disabled instance must not claim");
}

#[tokio::test]
#[serial]
async fn default_schedules_register_idempotently() {
    let Some(pool) = setup_db().await else { return };

    let service = test_service(&pool);
    service.register_default_schedules().await.unwrap();
    service.register_default_schedules().await.unwrap();

    let schedules = service.schedules().list().await.unwrap();
    assert_eq!(schedules.len(), 4);

    let names: Vec<&str> = schedules.iter().map(|s| s.name.as_str()).collect();
    assert!(names.contains(&"session_cleanup_hourly"));
    assert!(names.contains(&"webhook_delivery_prune_daily"));
    assert!(names.contains(&"expired_oauth_cleanup_daily"));
    assert!(names.contains(&"expired_auth_cleanup_daily"));

    for schedule in &schedules {
        assert!(schedule.enabled);
        assert!(schedule.next_run_at > chrono::Utc::now());
    }
}
