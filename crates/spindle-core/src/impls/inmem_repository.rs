//! In-memory queue repository.
//!
//! Used by tests and the demo binary. Rows live in a `BTreeMap` keyed by id so
//! ordered scans come for free; a second index enforces `object_id` uniqueness.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{NewTask, RepositoryError, Task};
use crate::ports::{Clock, QueueRepository, SystemClock};

/// One queue table.
#[derive(Debug, Default)]
struct Table {
    rows: BTreeMap<u64, Task>,

    /// object_id -> id
    object_ids: HashMap<u64, u64>,

    /// Last id handed out. Ids are never reused, even after deletes.
    last_id: u64,
}

impl Table {
    fn insert(&mut self, task: &NewTask, created_at: DateTime<Utc>) -> Option<u64> {
        if self.object_ids.contains_key(&task.object_id) {
            return None;
        }
        self.last_id += 1;
        let id = self.last_id;
        self.rows.insert(
            id,
            Task {
                id,
                object_id: task.object_id,
                retries: task.retries,
                payload: task.payload.clone(),
                created_at,
                err: None,
            },
        );
        self.object_ids.insert(task.object_id, id);
        Some(id)
    }

    fn remove(&mut self, id: u64) -> Option<Task> {
        let task = self.rows.remove(&id)?;
        self.object_ids.remove(&task.object_id);
        Some(task)
    }
}

/// In-memory [`QueueRepository`].
pub struct InMemoryQueueRepository {
    tables: Mutex<HashMap<String, Table>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryQueueRepository {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    pub fn with_clock(clock: impl Clock + 'static) -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            clock: Arc::new(clock),
        }
    }

    /// Number of rows currently stored in `table`.
    pub async fn len(&self, table: &str) -> usize {
        let tables = self.tables.lock().await;
        tables.get(table).map_or(0, |t| t.rows.len())
    }

    pub async fn is_empty(&self, table: &str) -> bool {
        self.len(table).await == 0
    }

    pub async fn get_by_object_id(&self, table: &str, object_id: u64) -> Option<Task> {
        let tables = self.tables.lock().await;
        let t = tables.get(table)?;
        let id = t.object_ids.get(&object_id)?;
        t.rows.get(id).cloned()
    }
}

impl Default for InMemoryQueueRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueRepository for InMemoryQueueRepository {
    async fn fetch_next(
        &self,
        table: &str,
        after_id: u64,
        limit: usize,
    ) -> Result<Vec<Task>, RepositoryError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let tables = self.tables.lock().await;
        let Some(t) = tables.get(table) else {
            return Ok(Vec::new());
        };
        let tasks = t
            .rows
            .range(after_id.saturating_add(1)..)
            .take(limit)
            .map(|(_, task)| task.clone())
            .collect();
        Ok(tasks)
    }

    async fn recover_stale(
        &self,
        table: &str,
        before_id: u64,
        older_than: Duration,
    ) -> Result<u64, RepositoryError> {
        let now = self.clock.now();
        // A window reaching past the representable time range means nothing is stale yet.
        let Some(cutoff) = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|window| now.checked_sub_signed(window))
        else {
            return Ok(0);
        };

        let mut tables = self.tables.lock().await;
        let Some(t) = tables.get_mut(table) else {
            return Ok(0);
        };
        let stale: Vec<u64> = t
            .rows
            .range(..before_id)
            .filter(|(_, task)| task.created_at < cutoff)
            .map(|(id, _)| *id)
            .collect();

        let mut moved = 0;
        for id in stale {
            if let Some(task) = t.remove(id)
                && t.insert(&NewTask::from(&task), now).is_some()
            {
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn delete(&self, table: &str, id: u64) -> Result<(), RepositoryError> {
        let mut tables = self.tables.lock().await;
        if let Some(t) = tables.get_mut(table) {
            t.remove(id);
        }
        Ok(())
    }

    async fn delete_bulk(&self, table: &str, ids: &[u64]) -> Result<(), RepositoryError> {
        let mut tables = self.tables.lock().await;
        if let Some(t) = tables.get_mut(table) {
            for id in ids {
                t.remove(*id);
            }
        }
        Ok(())
    }

    async fn update_retry_count(
        &self,
        table: &str,
        id: u64,
        retries: u64,
    ) -> Result<(), RepositoryError> {
        let now = self.clock.now();
        let mut tables = self.tables.lock().await;
        if let Some(task) = tables.get_mut(table).and_then(|t| t.rows.get_mut(&id)) {
            task.retries = retries;
            task.created_at = now;
        }
        Ok(())
    }

    async fn insert(&self, table: &str, task: &NewTask) -> Result<(), RepositoryError> {
        let now = self.clock.now();
        let mut tables = self.tables.lock().await;
        tables.entry(table.to_string()).or_default().insert(task, now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::ManualClock;
    use chrono::TimeZone;
    use rstest::rstest;

    const TABLE: &str = "jobs";
    const TEN_MINUTES: Duration = Duration::from_secs(600);

    fn clock() -> ManualClock {
        ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap())
    }

    #[tokio::test]
    async fn duplicate_object_id_insert_is_a_noop() {
        let repo = InMemoryQueueRepository::new();

        for retries in 0..4 {
            repo.insert(TABLE, &NewTask::new(42).with_retries(retries))
                .await
                .unwrap();
        }

        assert_eq!(repo.len(TABLE).await, 1);
        let task = repo.get_by_object_id(TABLE, 42).await.unwrap();
        assert_eq!(task.retries, 0);
    }

    #[tokio::test]
    async fn fetch_next_is_ordered_and_skips_gaps() {
        let repo = InMemoryQueueRepository::new();
        for object_id in 1..=5 {
            repo.insert(TABLE, &NewTask::new(object_id)).await.unwrap();
        }
        repo.delete_bulk(TABLE, &[2, 4]).await.unwrap();

        let ids: Vec<u64> = repo
            .fetch_next(TABLE, 0, 10)
            .await
            .unwrap()
            .iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![1, 3, 5]);

        let after: Vec<u64> = repo
            .fetch_next(TABLE, 3, 10)
            .await
            .unwrap()
            .iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(after, vec![5]);
    }

    #[tokio::test]
    async fn fetch_next_honours_limit() {
        let repo = InMemoryQueueRepository::new();
        for object_id in 1..=5 {
            repo.insert(TABLE, &NewTask::new(object_id)).await.unwrap();
        }

        assert_eq!(repo.fetch_next(TABLE, 0, 2).await.unwrap().len(), 2);
        assert!(repo.fetch_next(TABLE, 0, 0).await.unwrap().is_empty());
        assert!(repo.fetch_next("unknown", 0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ids_are_not_reused_after_delete() {
        let repo = InMemoryQueueRepository::new();
        repo.insert(TABLE, &NewTask::new(1)).await.unwrap();
        repo.delete(TABLE, 1).await.unwrap();
        repo.insert(TABLE, &NewTask::new(1)).await.unwrap();

        let task = repo.get_by_object_id(TABLE, 1).await.unwrap();
        assert_eq!(task.id, 2);
    }

    #[tokio::test]
    async fn update_retry_count_resets_created_at() {
        let clock = clock();
        let repo = InMemoryQueueRepository::with_clock(clock.clone());
        repo.insert(TABLE, &NewTask::new(9)).await.unwrap();

        clock.advance(chrono::Duration::minutes(3));
        repo.update_retry_count(TABLE, 1, 2).await.unwrap();

        let task = repo.get_by_object_id(TABLE, 9).await.unwrap();
        assert_eq!(task.retries, 2);
        assert_eq!(task.created_at, clock.now());
    }

    #[tokio::test]
    async fn missing_rows_are_not_errors() {
        let repo = InMemoryQueueRepository::new();
        repo.delete(TABLE, 99).await.unwrap();
        repo.delete_bulk(TABLE, &[]).await.unwrap();
        repo.update_retry_count(TABLE, 99, 1).await.unwrap();
    }

    #[tokio::test]
    async fn recover_stale_moves_old_rows_below_cursor_to_tail() {
        let clock = clock();
        let repo = InMemoryQueueRepository::with_clock(clock.clone());
        repo.insert(TABLE, &NewTask::new(10).with_payload(*b"x"))
            .await
            .unwrap();
        repo.insert(TABLE, &NewTask::new(11)).await.unwrap();
        repo.update_retry_count(TABLE, 1, 3).await.unwrap();

        clock.advance(chrono::Duration::minutes(11));
        // Only id 1 is below the cursor.
        let moved = repo.recover_stale(TABLE, 2, TEN_MINUTES).await.unwrap();
        assert_eq!(moved, 1);

        let requeued = repo.get_by_object_id(TABLE, 10).await.unwrap();
        assert_eq!(requeued.id, 3);
        assert_eq!(requeued.retries, 3);
        assert_eq!(requeued.payload.as_deref(), Some(&b"x"[..]));
        assert_eq!(requeued.created_at, clock.now());

        let untouched = repo.get_by_object_id(TABLE, 11).await.unwrap();
        assert_eq!(untouched.id, 2);
        assert_eq!(repo.len(TABLE).await, 2);
    }

    #[tokio::test]
    async fn recover_stale_requeues_at_most_once_per_window() {
        let clock = clock();
        let repo = InMemoryQueueRepository::with_clock(clock.clone());
        repo.insert(TABLE, &NewTask::new(10)).await.unwrap();
        clock.advance(chrono::Duration::minutes(11));

        assert_eq!(repo.recover_stale(TABLE, 10, TEN_MINUTES).await.unwrap(), 1);
        assert_eq!(repo.recover_stale(TABLE, 10, TEN_MINUTES).await.unwrap(), 0);
        assert_eq!(repo.len(TABLE).await, 1);
    }

    #[tokio::test]
    async fn recover_stale_ignores_fresh_rows() {
        let clock = clock();
        let repo = InMemoryQueueRepository::with_clock(clock.clone());
        repo.insert(TABLE, &NewTask::new(10)).await.unwrap();
        clock.advance(chrono::Duration::minutes(5));

        assert_eq!(repo.recover_stale(TABLE, 10, TEN_MINUTES).await.unwrap(), 0);
        assert_eq!(repo.get_by_object_id(TABLE, 10).await.unwrap().id, 1);
    }

    #[rstest]
    #[case::past_time_range(Duration::from_secs(1_000_000_000_000_000))]
    #[case::past_chrono_range(Duration::from_secs(u64::MAX))]
    #[tokio::test]
    async fn recover_stale_with_huge_window_finds_nothing(#[case] window: Duration) {
        let clock = clock();
        let repo = InMemoryQueueRepository::with_clock(clock.clone());
        repo.insert(TABLE, &NewTask::new(10)).await.unwrap();
        clock.advance(chrono::Duration::days(365));

        assert_eq!(repo.recover_stale(TABLE, 2, window).await.unwrap(), 0);
        assert_eq!(repo.get_by_object_id(TABLE, 10).await.unwrap().id, 1);
    }
}
