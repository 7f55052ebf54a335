//! Queue worker configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::retry::RetryPolicy;

/// Settings for one [`super::QueueWorker`].
///
/// Every field has a default, so a config file only needs the keys it changes:
///
/// ```json
/// { "table": "thumbnails", "poll_interval_ms": 500, "retry": { "max_retries": 3 } }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueWorkerConfig {
    /// Queue table polled by the worker. Also the worker's name.
    pub table: String,
    pub poll_interval_ms: u64,
    pub retry: RetryPolicy,
}

impl QueueWorkerConfig {
    pub const DEFAULT_TABLE: &'static str = "tasks";

    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl Default for QueueWorkerConfig {
    fn default() -> Self {
        Self {
            table: Self::DEFAULT_TABLE.to_string(),
            poll_interval_ms: 1000,
            retry: RetryPolicy::default(),
        }
    }
}
