use sqlx::{postgres::PgPoolOptions, PgPool};
use uuid::Uuid;

/// Connects to TEST_DATABASE_URL, applies migrations and truncates the
/// queue tables. Returns None when TEST_DATABASE_URL is not set so the
/// suite can run (and pass) on machines without a database.
pub async fn setup_db() -> Option<PgPool> {
    let _ = dotenvy::dotenv();

    let url = match std::env::var("TEST_DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("skipping: TEST_DATABASE_URL not set");
            return None;
        }
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .expect("failed to connect to TEST_DATABASE_URL");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations failed");

    sqlx::query(
        r#"
        TRUNCATE TABLE
            jobs,
            schedules,
            matview_registry
        RESTART IDENTITY CASCADE
        "#,
    )
    .execute(&pool)
    .await
    .expect("truncate failed");

    Some(pool)
}

#[allow(dead_code)]
pub async fn insert_job(pool: &PgPool, job_type: &str, max_attempts: i32) -> Uuid {
    sqlx::query_scalar(
        r#"
        INSERT INTO jobs (job_type, payload, state, run_at, max_attempts)
        VALUES ($1, '{}'::jsonb, 'queued', now(), $2)
        RETURNING id
        "#,
    )
    .bind(job_type)
    .bind(max_attempts)
    .fetch_one(pool)
    .await
    .expect("failed to insert job")
}

#[allow(dead_code)]
pub async fn job_state(pool: &PgPool, id: Uuid) -> String {
    sqlx::query_scalar("SELECT state FROM jobs WHERE id = $1")
        .bind(id)
        .fetch_one(pool)
        .await
        .expect("failed to read job state")
}
