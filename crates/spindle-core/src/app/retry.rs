//! Retry policy: decides what happens to a task once a consumer reports back.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::Task;

/// What to do with a completed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Delete the row (success, or retries exhausted).
    Remove,

    /// Keep the row with a bumped retry count.
    Retry { retries: u64 },
}

/// Retry policy for failed tasks.
///
/// Failed tasks are not rescheduled directly: their row keeps its id (already
/// behind the worker's cursor) and gets a fresh `created_at`. They come back
/// once staleness recovery finds them older than `stale_after`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// A failed task with this many retries is dropped instead of retried.
    pub max_retries: u64,

    /// Age after which a delivered but unreported task is presumed abandoned.
    pub stale_after_secs: u64,
}

impl RetryPolicy {
    pub const DEFAULT_MAX_RETRIES: u64 = 5;
    pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(10 * 60);

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    /// Pure decision for a completion report.
    pub fn decide(&self, task: &Task) -> Disposition {
        if task.is_failed() && task.retries < self.max_retries {
            Disposition::Retry {
                retries: task.retries + 1,
            }
        } else {
            Disposition::Remove
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: Self::DEFAULT_MAX_RETRIES,
            stale_after_secs: Self::DEFAULT_STALE_AFTER.as_secs(),
        }
    }
}
