use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{QueueError, QueueResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshMode {
    Standard,
    Concurrent,
}

impl RefreshMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshMode::Standard => "standard",
            RefreshMode::Concurrent => "concurrent",
        }
    }

    pub fn parse(s: &str) -> QueueResult<Self> {
        match s {
            "standard" => Ok(RefreshMode::Standard),
            "concurrent" => Ok(RefreshMode::Concurrent),
            other => Err(QueueError::validation(format!(
                "refresh_mode must be standard or concurrent, got {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct MatviewEntry {
    pub id: Uuid,
    pub schema_name: String,
    pub view_name: String,
    pub refresh_mode: String,

    pub last_refresh_at: Option<DateTime<Utc>>,
    pub last_refresh_duration_ms: Option<i64>,
    pub last_refresh_status: Option<String>,
    pub last_refresh_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// True for `[A-Za-z_][A-Za-z0-9_]*` within Postgres' 63-byte identifier
/// limit. Validation is the first line of defense; quoting at the point of
/// use is the second.
pub fn is_valid_identifier(s: &str) -> bool {
    if s.is_empty() || s.len() > 63 {
        return false;
    }
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Registry of materialized views the refresh engine knows about.
#[derive(Clone)]
pub struct MatviewStore {
    pool: PgPool,
}

impl MatviewStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn register(
        &self,
        schema_name: &str,
        view_name: &str,
        mode: RefreshMode,
    ) -> QueueResult<MatviewEntry> {
        if !is_valid_identifier(schema_name) {
            return Err(QueueError::validation(format!(
                "invalid schema identifier: {schema_name:?}"
            )));
        }
        if !is_valid_identifier(view_name) {
            return Err(QueueError::validation(format!(
                "invalid view identifier: {view_name:?}"
            )));
        }
        if !self.target_is_matview(schema_name, view_name).await? {
            return Err(QueueError::not_found(format!(
                "no materialized view {schema_name}.{view_name}"
            )));
        }

        let res = sqlx::query_as::<_, MatviewEntry>(
            r#"
            INSERT INTO matview_registry (schema_name, view_name, refresh_mode)
            VALUES ($1, $2, $3)
            RETURNING *
            "#,
        )
        .bind(schema_name)
        .bind(view_name)
        .bind(mode.as_str())
        .fetch_one(&self.pool)
        .await;

        match res {
            Ok(entry) => Ok(entry),
            Err(e) if QueueError::is_unique_violation(&e) => Err(QueueError::conflict(format!(
                "{schema_name}.{view_name} is already registered"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, id: Uuid) -> QueueResult<MatviewEntry> {
        let entry =
            sqlx::query_as::<_, MatviewEntry>("SELECT * FROM matview_registry WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        entry.ok_or_else(|| QueueError::not_found(format!("matview registration {id}")))
    }

    pub async fn get_by_target(
        &self,
        schema_name: &str,
        view_name: &str,
    ) -> QueueResult<MatviewEntry> {
        let entry = sqlx::query_as::<_, MatviewEntry>(
            "SELECT * FROM matview_registry WHERE schema_name = $1 AND view_name = $2",
        )
        .bind(schema_name)
        .bind(view_name)
        .fetch_optional(&self.pool)
        .await?;

        entry.ok_or_else(|| {
            QueueError::not_found(format!("matview registration {schema_name}.{view_name}"))
        })
    }

    pub async fn list(&self) -> QueueResult<Vec<MatviewEntry>> {
        let entries = sqlx::query_as::<_, MatviewEntry>(
            "SELECT * FROM matview_registry ORDER BY schema_name, view_name",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    pub async fn set_mode(&self, id: Uuid, mode: RefreshMode) -> QueueResult<MatviewEntry> {
        let entry = sqlx::query_as::<_, MatviewEntry>(
            r#"
            UPDATE matview_registry
            SET refresh_mode = $2, updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(mode.as_str())
        .fetch_optional(&self.pool)
        .await?;

        entry.ok_or_else(|| QueueError::not_found(format!("matview registration {id}")))
    }

    pub async fn delete(&self, id: Uuid) -> QueueResult<()> {
        let res = sqlx::query("DELETE FROM matview_registry WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if res.rows_affected() == 0 {
            return Err(QueueError::not_found(format!("matview registration {id}")));
        }
        Ok(())
    }

    pub async fn record_refresh(
        &self,
        id: Uuid,
        duration_ms: i64,
        status: &str,
        error: Option<&str>,
    ) -> QueueResult<()> {
        sqlx::query(
            r#"
            UPDATE matview_registry
            SET last_refresh_at = now(),
                last_refresh_duration_ms = $2,
                last_refresh_status = $3,
                last_refresh_error = $4,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(duration_ms)
        .bind(status)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// System-catalog check: does the target exist as a materialized view
    /// (`pg_class.relkind = 'm'`)?
    pub async fn target_is_matview(
        &self,
        schema_name: &str,
        view_name: &str,
    ) -> QueueResult<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM pg_class c
                JOIN pg_namespace n ON n.oid = c.relnamespace
                WHERE c.relkind = 'm'
                  AND n.nspname = $1
                  AND c.relname = $2
            )
            "#,
        )
        .bind(schema_name)
        .bind(view_name)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    /// CONCURRENTLY needs a unique index that covers every row: no partial
    /// predicate, no expression columns, and it must be valid.
    pub async fn has_full_unique_index(
        &self,
        schema_name: &str,
        view_name: &str,
    ) -> QueueResult<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM pg_index i
                JOIN pg_class c ON c.oid = i.indrelid
                JOIN pg_namespace n ON n.oid = c.relnamespace
                WHERE n.nspname = $1
                  AND c.relname = $2
                  AND i.indisunique
                  AND i.indisvalid
                  AND i.indpred IS NULL
                  AND i.indexprs IS NULL
            )
            "#,
        )
        .bind(schema_name)
        .bind(view_name)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_whitelist() {
        assert!(is_valid_identifier("mv_totals"));
        assert!(is_valid_identifier("_private"));
        assert!(is_valid_identifier("Public2"));

        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("2fast"));
        assert!(!is_valid_identifier("bad-name"));
        assert!(!is_valid_identifier("drop table;"));
        assert!(!is_valid_identifier("name\"injected"));
        assert!(!is_valid_identifier(&"x".repeat(64)));
    }

    #[test]
    fn test_refresh_mode_parse() {
        assert_eq!(RefreshMode::parse("standard").unwrap(), RefreshMode::Standard);
        assert_eq!(RefreshMode::parse("concurrent").unwrap(), RefreshMode::Concurrent);
        assert!(RefreshMode::parse("CONCURRENT").is_err());
        assert!(RefreshMode::parse("full").is_err());
    }
}
