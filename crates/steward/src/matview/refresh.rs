use std::time::Instant;

use serde::Serialize;
use sqlx::{Connection, PgConnection, PgPool};
use uuid::Uuid;

use crate::error::{QueueError, QueueResult};
use crate::matview::registry::{MatviewEntry, MatviewStore, RefreshMode};

/// Result of a synchronous refresh, surfaced by the admin API and CLI.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshOutcome {
    pub id: Uuid,
    pub schema_name: String,
    pub view_name: String,
    pub refresh_mode: String,
    pub duration_ms: i64,
    pub status: String,
}

/// Executes `REFRESH MATERIALIZED VIEW` for registered targets.
///
/// Refreshes of the same `(schema, view)` are serialized across every
/// instance by a Postgres advisory lock keyed on
/// `hashtextextended('schema.view')`. The refresh itself cannot run inside
/// a transaction we hold open, which is exactly why an advisory lock is
/// used instead of a row lock.
#[derive(Clone)]
pub struct RefreshEngine {
    pool: PgPool,
    registry: MatviewStore,
}

impl RefreshEngine {
    pub fn new(pool: PgPool, registry: MatviewStore) -> Self {
        Self { pool, registry }
    }

    pub fn registry(&self) -> &MatviewStore {
        &self.registry
    }

    /// Refresh a registered view right now, synchronously.
    ///
    /// Any failure past the registry lookup is recorded on the registry row
    /// (status, duration, error text) before it is returned.
    pub async fn refresh_now(&self, id: Uuid) -> QueueResult<RefreshOutcome> {
        let entry = self.registry.get(id).await?;
        self.refresh_entry(&entry).await
    }

    /// Job-handler path: refresh by target, auto-registering unknown views
    /// in `standard` mode. Two handlers racing the same auto-registration
    /// both proceed: the insert loser re-reads the row the winner created.
    pub async fn refresh_target(
        &self,
        schema_name: &str,
        view_name: &str,
    ) -> QueueResult<RefreshOutcome> {
        let entry = match self.registry.get_by_target(schema_name, view_name).await {
            Ok(entry) => entry,
            Err(QueueError::NotFound(_)) => {
                match self
                    .registry
                    .register(schema_name, view_name, RefreshMode::Standard)
                    .await
                {
                    Ok(entry) => entry,
                    Err(QueueError::Conflict(_)) => {
                        self.registry.get_by_target(schema_name, view_name).await?
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        };

        self.refresh_entry(&entry).await
    }

    async fn refresh_entry(&self, entry: &MatviewEntry) -> QueueResult<RefreshOutcome> {
        let mode = RefreshMode::parse(&entry.refresh_mode)?;
        let started = Instant::now();

        let result = self.locked_refresh(entry, mode).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        match result {
            Ok(()) => {
                self.registry
                    .record_refresh(entry.id, duration_ms, "success", None)
                    .await?;

                Ok(RefreshOutcome {
                    id: entry.id,
                    schema_name: entry.schema_name.clone(),
                    view_name: entry.view_name.clone(),
                    refresh_mode: entry.refresh_mode.clone(),
                    duration_ms,
                    status: "success".to_string(),
                })
            }
            Err(e) => {
                self.registry
                    .record_refresh(entry.id, duration_ms, "error", Some(&e.to_string()))
                    .await?;
                Err(e)
            }
        }
    }

    async fn locked_refresh(&self, entry: &MatviewEntry, mode: RefreshMode) -> QueueResult<()> {
        let schema = entry.schema_name.as_str();
        let view = entry.view_name.as_str();

        // The registry row may outlive the view it points at.
        if !self.registry.target_is_matview(schema, view).await? {
            return Err(QueueError::not_found(format!(
                "materialized view {schema}.{view} is missing"
            )));
        }

        // Advisory locks are session-scoped, so lock, refresh and unlock
        // must share one connection. The connection is detached from the
        // pool: if this future is abandoned mid-refresh the session dies
        // with it and the server releases the lock, instead of a locked
        // session leaking back into the pool.
        let lock_key = format!("{schema}.{view}");
        let mut conn = self.pool.acquire().await?.detach();

        let locked: bool =
            sqlx::query_scalar("SELECT pg_try_advisory_lock(hashtextextended($1, 0))")
                .bind(&lock_key)
                .fetch_one(&mut conn)
                .await?;

        if !locked {
            let _ = conn.close().await;
            return Err(QueueError::conflict(format!(
                "refresh already in progress for {schema}.{view}"
            )));
        }

        let result = self.run_refresh(&mut conn, entry, mode).await;

        // Release the lock on the same session regardless of outcome; a
        // failed unlock only matters until the session closes right after.
        let _ = sqlx::query_scalar::<_, bool>(
            "SELECT pg_advisory_unlock(hashtextextended($1, 0))",
        )
        .bind(&lock_key)
        .fetch_one(&mut conn)
        .await;
        let _ = conn.close().await;

        result
    }

    async fn run_refresh(
        &self,
        conn: &mut PgConnection,
        entry: &MatviewEntry,
        mode: RefreshMode,
    ) -> QueueResult<()> {
        let schema = entry.schema_name.as_str();
        let view = entry.view_name.as_str();

        if mode == RefreshMode::Concurrent
            && !self.registry.has_full_unique_index(schema, view).await?
        {
            return Err(QueueError::precondition(format!(
                "concurrent refresh of {schema}.{view} requires a populated unique index"
            )));
        }

        // Identifiers were whitelist-validated at registration; quoting via
        // format('%I.%I') keeps even a corrupted registry row from reaching
        // the statement unquoted.
        let qualified: String = sqlx::query_scalar("SELECT format('%I.%I', $1::text, $2::text)")
            .bind(schema)
            .bind(view)
            .fetch_one(&mut *conn)
            .await?;

        let stmt = match mode {
            RefreshMode::Standard => format!("REFRESH MATERIALIZED VIEW {qualified}"),
            RefreshMode::Concurrent => {
                format!("REFRESH MATERIALIZED VIEW CONCURRENTLY {qualified}")
            }
        };

        sqlx::query(&stmt).execute(&mut *conn).await?;
        Ok(())
    }
}
