//! QueueWorker - turns a queue table into a bounded channel of tasks.
//!
//! # Flow (one event per step)
//! - **tick**: requeue stale rows, fetch rows after the cursor (at most the free
//!   capacity of the output channel), push them, advance the cursor.
//! - **completion**: retry (bump `retries`) or delete the reported row.
//! - **cancellation**: return.
//!
//! Repository errors are logged and the current cycle is dropped; the next
//! tick or message tries again.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::config::QueueWorkerConfig;
use super::retry::{Disposition, RetryPolicy};
use super::supervisor::Workable;
use crate::domain::{Task, WorkError};
use crate::ports::QueueRepository;

fn new_ticker(period: Duration) -> Interval {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

enum Event {
    Completed(Option<Task>),
    Tick,
}

/// Task-source that synchronizes a queue table with a pair of channels.
///
/// Tasks go out on `out_tx`; consumers send them back on the completion channel,
/// with `err` set if processing failed (see [`Task::failed`]).
pub struct QueueWorker<R> {
    repo: R,
    config: QueueWorkerConfig,
    ticker: Option<Interval>,
    /// Highest id pushed so far. Only touched from `work`.
    cursor: u64,
    out_tx: mpsc::Sender<Task>,
    in_rx: mpsc::Receiver<Task>,
    in_closed: bool,
}

impl<R: QueueRepository> QueueWorker<R> {
    pub fn new(
        repo: R,
        config: QueueWorkerConfig,
        out_tx: mpsc::Sender<Task>,
        in_rx: mpsc::Receiver<Task>,
    ) -> Self {
        Self {
            repo,
            config,
            ticker: None,
            cursor: 0,
            out_tx,
            in_rx,
            in_closed: false,
        }
    }

    /// Build a worker with fresh channels of `capacity`.
    ///
    /// Returns the worker, the receiver consumers take tasks from, and the
    /// sender they report completions to.
    pub fn with_channels(
        repo: R,
        config: QueueWorkerConfig,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Task>, mpsc::Sender<Task>) {
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let (in_tx, in_rx) = mpsc::channel(capacity);
        (Self::new(repo, config, out_tx, in_rx), out_rx, in_tx)
    }

    pub fn table(&self) -> &str {
        &self.config.table
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.config.retry
    }

    /// Tick handler: staleness recovery, then fetch and push.
    ///
    /// Recovery covers every row up to and including the cursor, i.e. every row
    /// this worker has already pushed.
    pub async fn poll(&mut self) {
        let table = self.config.table.as_str();
        let delivered_below = self.cursor.saturating_add(1);
        match self
            .repo
            .recover_stale(table, delivered_below, self.config.retry.stale_after())
            .await
        {
            Ok(0) => {}
            Ok(moved) => debug!(table, moved, "requeued stale tasks"),
            Err(e) => {
                error!(table, error = %e, "stale task recovery failed");
                return;
            }
        }

        if self.out_tx.is_closed() {
            warn!(table, "output channel closed, skipping fetch");
            return;
        }
        let free = self.out_tx.capacity();
        if free == 0 {
            return;
        }

        let tasks = match self.repo.fetch_next(table, self.cursor, free).await {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(table, cursor = self.cursor, error = %e, "fetching queue failed");
                return;
            }
        };

        for task in tasks {
            let id = task.id;
            match self.out_tx.try_send(task) {
                Ok(()) => self.cursor = self.cursor.max(id),
                Err(TrySendError::Full(_)) => {
                    debug!(table, id, "output channel full, task left for next tick");
                    break;
                }
                Err(TrySendError::Closed(_)) => {
                    warn!(table, id, "output channel closed while pushing");
                    break;
                }
            }
        }
    }

    /// Completion handler: persist a retry or delete the row.
    #[instrument(
        level = "debug",
        skip_all,
        fields(table = %self.config.table, id = task.id, object_id = task.object_id, retries = task.retries)
    )]
    pub async fn complete(&mut self, task: Task) {
        let table = self.config.table.as_str();
        match self.config.retry.decide(&task) {
            Disposition::Retry { retries } => {
                if let Err(e) = self.repo.update_retry_count(table, task.id, retries).await {
                    error!(error = %e, "persisting retry count failed");
                    return;
                }
                debug!(
                    reason = task.err.as_deref().unwrap_or_default(),
                    "task failed, kept for retry"
                );
            }
            Disposition::Remove => {
                if let Err(e) = self.repo.delete(table, task.id).await {
                    error!(error = %e, "deleting task failed");
                    return;
                }
                if let Some(reason) = task.err.as_deref() {
                    warn!(reason, "retries exhausted, task dropped");
                } else {
                    debug!("task done");
                }
            }
        }
    }
}

#[async_trait]
impl<R: QueueRepository> Workable for QueueWorker<R> {
    fn name(&self) -> &str {
        &self.config.table
    }

    async fn start(&mut self) -> Result<(), WorkError> {
        // Restart the timer so the first step polls right away.
        self.ticker = Some(new_ticker(self.config.poll_interval()));
        info!(
            table = %self.config.table,
            poll_interval_ms = self.config.poll_interval_ms,
            cursor = self.cursor,
            "queue worker polling"
        );
        Ok(())
    }

    async fn work(&mut self, cancel: &CancellationToken) {
        let period = self.config.poll_interval();
        let in_closed = self.in_closed;
        let in_rx = &mut self.in_rx;
        let ticker = self.ticker.get_or_insert_with(|| new_ticker(period));

        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            task = in_rx.recv(), if !in_closed => Event::Completed(task),
            _ = ticker.tick() => Event::Tick,
        };

        match event {
            Event::Completed(Some(task)) => self.complete(task).await,
            Event::Completed(None) => {
                debug!(table = %self.config.table, "completion channel closed");
                self.in_closed = true;
            }
            Event::Tick => self.poll().await,
        }
    }
}
