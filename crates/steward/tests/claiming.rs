mod common;

use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use common::{insert_job, job_state, setup_db};
use serde_json::json;
use serial_test::serial;
use steward::jobs::model::EnqueueOptions;
use steward::jobs::store::JobStore;
use steward::QueueError;

const LEASE: Duration = Duration::from_secs(30);

#[tokio::test]
#[serial]
async fn claiming_two_workers_never_get_same_job() {
    let Some(pool) = setup_db().await else { return };
    let store = JobStore::new(pool.clone());

    let job_id = insert_job(&pool, "no_op", 3).await;

    let store_a = store.clone();
    let store_b = store.clone();
    let (a, b) = tokio::join!(
        async move { store_a.claim("worker-a", LEASE).await.unwrap() },
        async move { store_b.claim("worker-b", LEASE).await.unwrap() },
    );

    // Exactly one claimer wins the single queued job.
    assert!(
        a.is_some() ^ b.is_some(),
        "expected exactly one claim to win, a={:?} b={:?}",
        a.is_some(),
        b.is_some()
    );

    let winner = a.or(b).unwrap();
    assert_eq!(winner.id, job_id);
    assert_eq!(winner.state, "running");
    assert_eq!(winner.attempts, 1);
    assert!(winner.lease_until.is_some());
    assert!(winner.worker_id.is_some());
    assert!(winner.last_run_at.is_some());
}

#[tokio::test]
#[serial]
async fn claim_orders_by_run_at_ascending() {
    let Some(pool) = setup_db().await else { return };
    let store = JobStore::new(pool.clone());

    let later = store
        .enqueue(
            "no_op",
            json!({}),
            EnqueueOptions {
                run_at: Some(Utc::now() - ChronoDuration::seconds(10)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let earlier = store
        .enqueue(
            "no_op",
            json!({}),
            EnqueueOptions {
                run_at: Some(Utc::now() - ChronoDuration::seconds(60)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let first = store.claim("worker-a", LEASE).await.unwrap().unwrap();
    let second = store.claim("worker-a", LEASE).await.unwrap().unwrap();

    assert_eq!(first.id, earlier.id);
    assert_eq!(second.id, later.id);
}

#[tokio::test]
#[serial]
async fn future_job_is_not_claimable() {
    let Some(pool) = setup_db().await else { return };
    let store = JobStore::new(pool.clone());

    store
        .enqueue(
            "no_op",
            json!({}),
            EnqueueOptions {
                run_at: Some(Utc::now() + ChronoDuration::seconds(30)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(store.claim("worker-a", LEASE).await.unwrap().is_none());
}

#[tokio::test]
#[serial]
async fn expired_lease_is_recovered_with_attempts_preserved() {
    let Some(pool) = setup_db().await else { return };
    let store = JobStore::new(pool.clone());

    let job_id = insert_job(&pool, "no_op", 3).await;

    let claimed = store
        .claim("worker-a", Duration::from_secs(1))
        .await
        .unwrap()
        .expect("claim should succeed");
    assert_eq!(claimed.id, job_id);

    // Worker dies: nobody calls complete or fail.
    tokio::time::sleep(Duration::from_millis(1200)).await;

    let recovered = store.recover_stalled_jobs().await.unwrap();
    assert_eq!(recovered, 1);

    let job = store.get(job_id).await.unwrap();
    assert_eq!(job.state, "queued");
    assert_eq!(job.attempts, 1, "attempt counter must survive recovery");
    assert!(job.lease_until.is_none());
    assert!(job.worker_id.is_none());

    // And it is claimable again.
    let reclaimed = store.claim("worker-b", LEASE).await.unwrap().unwrap();
    assert_eq!(reclaimed.id, job_id);
    assert_eq!(reclaimed.attempts, 2);
}

#[tokio::test]
#[serial]
async fn recovery_leaves_live_leases_alone() {
    let Some(pool) = setup_db().await else { return };
    let store = JobStore::new(pool.clone());

    let job_id = insert_job(&pool, "no_op", 3).await;
    store.claim("worker-a", LEASE).await.unwrap().unwrap();

    assert_eq!(store.recover_stalled_jobs().await.unwrap(), 0);
    assert_eq!(job_state(&pool, job_id).await, "running");
}

#[tokio::test]
#[serial]
async fn extend_lease_moves_the_deadline() {
    let Some(pool) = setup_db().await else { return };
    let store = JobStore::new(pool.clone());

    let job_id = insert_job(&pool, "no_op", 3).await;
    let claimed = store
        .claim("worker-a", Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();

    let extended = store
        .extend_lease(job_id, Duration::from_secs(600))
        .await
        .unwrap();
    assert!(extended.lease_until.unwrap() > claimed.lease_until.unwrap());
}

#[tokio::test]
#[serial]
async fn extend_lease_requires_running_state() {
    let Some(pool) = setup_db().await else { return };
    let store = JobStore::new(pool.clone());

    let job_id = insert_job(&pool, "no_op", 3).await;

    let err = store
        .extend_lease(job_id, Duration::from_secs(60))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::Precondition(_)));
}

#[tokio::test]
#[serial]
async fn idempotency_key_rejects_duplicates() {
    let Some(pool) = setup_db().await else { return };
    let store = JobStore::new(pool.clone());

    let opts = EnqueueOptions {
        idempotency_key: Some("nightly-2026-08-01".to_string()),
        ..Default::default()
    };

    store.enqueue("no_op", json!({}), opts.clone()).await.unwrap();
    let err = store.enqueue("no_op", json!({}), opts).await.unwrap_err();
    assert!(matches!(err, QueueError::Conflict(_)));

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 1, "the conflicting enqueue must not create a row");
}

#[tokio::test]
#[serial]
async fn jobs_without_keys_do_not_conflict() {
    let Some(pool) = setup_db().await else { return };
    let store = JobStore::new(pool.clone());

    store
        .enqueue("no_op", json!({}), EnqueueOptions::default())
        .await
        .unwrap();
    store
        .enqueue("no_op", json!({}), EnqueueOptions::default())
        .await
        .unwrap();

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 2);
}
