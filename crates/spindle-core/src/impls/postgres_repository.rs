//! PostgreSQL queue repository.
//!
//! Each queue is a table shaped like the one created by
//! [`PostgresQueueRepository::migrate`]. Table names cannot be bound as query
//! parameters, so they are checked against [`is_valid_table_name`] before being
//! interpolated.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::domain::{NewTask, RepositoryError, Task};
use crate::ports::QueueRepository;

/// [`QueueRepository`] backed by PostgreSQL.
#[derive(Clone)]
pub struct PostgresQueueRepository {
    pool: PgPool,
}

impl PostgresQueueRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the queue table if it does not exist.
    #[tracing::instrument(skip(self))]
    pub async fn migrate(&self, table: &str) -> Result<(), RepositoryError> {
        let table = checked(table)?;
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id BIGSERIAL PRIMARY KEY,
                object_id BIGINT NOT NULL UNIQUE,
                retries BIGINT NOT NULL DEFAULT 0,
                payload BYTEA NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Is `name` a plain (optionally schema-qualified) SQL identifier?
pub fn is_valid_table_name(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() <= 2
        && parts.iter().all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
                && part.len() <= 63
        })
}

fn checked(table: &str) -> Result<&str, RepositoryError> {
    if is_valid_table_name(table) {
        Ok(table)
    } else {
        Err(RepositoryError::InvalidTable(table.to_string()))
    }
}

/// Rows are stamped by `now()`, so none can be older than this. Longer windows
/// would only overflow the server's interval arithmetic.
const MAX_STALE_WINDOW: Duration = Duration::from_secs(1000 * 365 * 24 * 60 * 60);

fn to_db(value: u64) -> Result<i64, RepositoryError> {
    i64::try_from(value).map_err(|_| RepositoryError::Storage(format!("{value} overflows BIGINT")))
}

fn from_db(value: i64) -> Result<u64, RepositoryError> {
    u64::try_from(value).map_err(|_| RepositoryError::Storage(format!("negative value {value}")))
}

fn task_from_row(row: &PgRow) -> Result<Task, RepositoryError> {
    Ok(Task {
        id: from_db(row.try_get("id")?)?,
        object_id: from_db(row.try_get("object_id")?)?,
        retries: from_db(row.try_get("retries")?)?,
        payload: row.try_get("payload")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        err: None,
    })
}

#[async_trait]
impl QueueRepository for PostgresQueueRepository {
    async fn fetch_next(
        &self,
        table: &str,
        after_id: u64,
        limit: usize,
    ) -> Result<Vec<Task>, RepositoryError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let table = checked(table)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(&format!(
            r#"
            SELECT id, object_id, retries, payload, created_at
            FROM {table}
            WHERE id > $1
            ORDER BY id ASC
            LIMIT $2
            "#
        ))
        .bind(to_db(after_id)?)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(task_from_row).collect()
    }

    async fn recover_stale(
        &self,
        table: &str,
        before_id: u64,
        older_than: Duration,
    ) -> Result<u64, RepositoryError> {
        let table = checked(table)?;
        if older_than > MAX_STALE_WINDOW {
            return Ok(0);
        }

        // The cutoff is computed by the server, the same clock that stamps `created_at`.
        let mut tx = self.pool.begin().await?;
        let stale = sqlx::query(&format!(
            r#"
            DELETE FROM {table}
            WHERE id < $1 AND created_at < now() - make_interval(secs => $2)
            RETURNING id, object_id, retries, payload, created_at
            "#
        ))
        .bind(to_db(before_id)?)
        .bind(older_than.as_secs_f64())
        .fetch_all(&mut *tx)
        .await?;

        let mut moved = 0;
        for row in &stale {
            let task = task_from_row(row)?;
            let result = sqlx::query(&format!(
                "INSERT INTO {table} (object_id, retries, payload) VALUES ($1, $2, $3) \
                 ON CONFLICT (object_id) DO NOTHING"
            ))
            .bind(to_db(task.object_id)?)
            .bind(to_db(task.retries)?)
            .bind(task.payload.as_deref())
            .execute(&mut *tx)
            .await?;
            moved += result.rows_affected();
        }
        tx.commit().await?;

        Ok(moved)
    }

    async fn delete(&self, table: &str, id: u64) -> Result<(), RepositoryError> {
        let table = checked(table)?;
        sqlx::query(&format!("DELETE FROM {table} WHERE id = $1"))
            .bind(to_db(id)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_bulk(&self, table: &str, ids: &[u64]) -> Result<(), RepositoryError> {
        if ids.is_empty() {
            return Ok(());
        }
        let table = checked(table)?;
        let ids = ids
            .iter()
            .map(|id| to_db(*id))
            .collect::<Result<Vec<i64>, _>>()?;
        sqlx::query(&format!("DELETE FROM {table} WHERE id = ANY($1)"))
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_retry_count(
        &self,
        table: &str,
        id: u64,
        retries: u64,
    ) -> Result<(), RepositoryError> {
        let table = checked(table)?;
        sqlx::query(&format!(
            "UPDATE {table} SET retries = $1, created_at = now() WHERE id = $2"
        ))
        .bind(to_db(retries)?)
        .bind(to_db(id)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert(&self, table: &str, task: &NewTask) -> Result<(), RepositoryError> {
        let table = checked(table)?;
        sqlx::query(&format!(
            "INSERT INTO {table} (object_id, retries, payload) VALUES ($1, $2, $3) \
             ON CONFLICT (object_id) DO NOTHING"
        ))
        .bind(to_db(task.object_id)?)
        .bind(to_db(task.retries)?)
        .bind(task.payload.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
