//! QueueRepository port - durable store behind a task queue.
//!
//! A queue is a table of [`Task`] rows. Any engine offering ordered records, a
//! uniqueness constraint on `object_id` and atomic single-row update/delete can
//! implement this trait.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{NewTask, RepositoryError, Task};

/// Storage contract used by [`crate::app::QueueWorker`].
///
/// # Guarantees expected from implementations
/// - `insert` is idempotent on `object_id`: a duplicate is silently ignored.
/// - `fetch_next` returns rows in ascending id order. Deleted ids are simply absent.
/// - `delete` and `update_retry_count` touch a single row atomically. A missing
///   row is not an error.
#[async_trait]
pub trait QueueRepository: Send + Sync {
    /// Up to `limit` tasks with `id > after_id`, ascending.
    async fn fetch_next(
        &self,
        table: &str,
        after_id: u64,
        limit: usize,
    ) -> Result<Vec<Task>, RepositoryError>;

    /// Move rows with `id < before_id` whose `created_at` is older than
    /// `older_than` to the tail of the queue (delete, then reinsert under the
    /// same `object_id`). Returns how many rows were requeued.
    ///
    /// The queue worker passes `cursor + 1`, so the last row it pushed is covered too.
    async fn recover_stale(
        &self,
        table: &str,
        before_id: u64,
        older_than: Duration,
    ) -> Result<u64, RepositoryError>;

    async fn delete(&self, table: &str, id: u64) -> Result<(), RepositoryError>;

    async fn delete_bulk(&self, table: &str, ids: &[u64]) -> Result<(), RepositoryError>;

    /// Persist a new retry count. Also resets `created_at` so the staleness
    /// window restarts.
    async fn update_retry_count(
        &self,
        table: &str,
        id: u64,
        retries: u64,
    ) -> Result<(), RepositoryError>;

    async fn insert(&self, table: &str, task: &NewTask) -> Result<(), RepositoryError>;
}

#[async_trait]
impl<R: QueueRepository + ?Sized> QueueRepository for Arc<R> {
    async fn fetch_next(
        &self,
        table: &str,
        after_id: u64,
        limit: usize,
    ) -> Result<Vec<Task>, RepositoryError> {
        (**self).fetch_next(table, after_id, limit).await
    }

    async fn recover_stale(
        &self,
        table: &str,
        before_id: u64,
        older_than: Duration,
    ) -> Result<u64, RepositoryError> {
        (**self).recover_stale(table, before_id, older_than).await
    }

    async fn delete(&self, table: &str, id: u64) -> Result<(), RepositoryError> {
        (**self).delete(table, id).await
    }

    async fn delete_bulk(&self, table: &str, ids: &[u64]) -> Result<(), RepositoryError> {
        (**self).delete_bulk(table, ids).await
    }

    async fn update_retry_count(
        &self,
        table: &str,
        id: u64,
        retries: u64,
    ) -> Result<(), RepositoryError> {
        (**self).update_retry_count(table, id, retries).await
    }

    async fn insert(&self, table: &str, task: &NewTask) -> Result<(), RepositoryError> {
        (**self).insert(table, task).await
    }
}
