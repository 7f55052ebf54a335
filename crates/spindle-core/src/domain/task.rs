use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A queued work record.
///
/// - `id` is assigned by storage and strictly increasing; workers use it as a scan cursor.
/// - `object_id` is the caller's correlation key and is unique per table.
/// - `err` only travels back over the completion channel. It is never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: u64,
    pub object_id: u64,
    #[serde(default)]
    pub retries: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub err: Option<String>,
}

impl Task {
    /// Did the consumer report a failure for this task?
    pub fn is_failed(&self) -> bool {
        self.err.is_some()
    }

    /// Completion report for a task that was processed successfully.
    pub fn succeeded(mut self) -> Self {
        self.err = None;
        self
    }

    /// Completion report for a task whose processing failed.
    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.err = Some(error.into());
        self
    }
}

/// Insert shape for a task. `id` and `created_at` come from storage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub object_id: u64,
    #[serde(default)]
    pub retries: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Vec<u8>>,
}

impl NewTask {
    pub fn new(object_id: u64) -> Self {
        Self {
            object_id,
            ..Self::default()
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn with_retries(mut self, retries: u64) -> Self {
        self.retries = retries;
        self
    }
}

impl From<&Task> for NewTask {
    fn from(task: &Task) -> Self {
        Self {
            object_id: task.object_id,
            retries: task.retries,
            payload: task.payload.clone(),
        }
    }
}
