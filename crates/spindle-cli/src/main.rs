use std::error::Error;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use spindle_core::impls::InMemoryQueueRepository;
use spindle_core::{
    NewTask, QueueRepository, QueueWorker, QueueWorkerConfig, Supervisor, Task, WorkError,
    Workable,
};

#[derive(Debug, Deserialize)]
struct HelloPayload {
    name: String,
}

/// Consumer side: takes tasks from the queue worker and reports back.
///
/// Fails the first `remaining_failures` tasks to show retries.
struct HelloConsumer {
    tasks: mpsc::Receiver<Task>,
    done: mpsc::Sender<Task>,
    remaining_failures: u32,
}

impl HelloConsumer {
    fn process(&mut self, task: &Task) -> Result<(), String> {
        let payload = task.payload.as_deref().ok_or("missing payload")?;
        let p: HelloPayload =
            serde_json::from_slice(payload).map_err(|e| format!("json decode: {e}"))?;

        if self.remaining_failures > 0 {
            self.remaining_failures -= 1;
            return Err(format!(
                "intentional failure (left={})",
                self.remaining_failures
            ));
        }

        info!(object_id = task.object_id, retries = task.retries, "Hello, {}!", p.name);
        Ok(())
    }
}

#[async_trait]
impl Workable for HelloConsumer {
    fn name(&self) -> &str {
        "hello-consumer"
    }

    async fn work(&mut self, cancel: &CancellationToken) {
        let task = tokio::select! {
            _ = cancel.cancelled() => return,
            task = self.tasks.recv() => task,
        };
        let Some(task) = task else {
            // Queue worker is gone; wait for our own shutdown.
            cancel.cancelled().await;
            return;
        };

        let report = match self.process(&task) {
            Ok(()) => task.succeeded(),
            Err(e) => {
                warn!(object_id = task.object_id, error = %e, "task failed");
                task.failed(e)
            }
        };
        if self.done.send(report).await.is_err() {
            warn!("completion channel closed");
        }
    }

    async fn shutdown(&mut self) -> Result<(), WorkError> {
        self.tasks.close();
        Ok(())
    }
}

/// Config from the JSON file given as first argument, or a fast-retrying demo setup.
fn load_config() -> Result<QueueWorkerConfig, Box<dyn Error>> {
    match std::env::args().nth(1) {
        Some(path) => {
            let json = std::fs::read_to_string(&path)?;
            Ok(QueueWorkerConfig::from_json(&json)?)
        }
        None => {
            let mut config = QueueWorkerConfig::new("hello");
            config.poll_interval_ms = 200;
            config.retry.stale_after_secs = 1;
            Ok(config)
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();
    let config = load_config()?;
    let table = config.table.clone();

    // (A) Queue table with a few tasks. The duplicate object id is absorbed.
    let repo = Arc::new(InMemoryQueueRepository::new());
    for (object_id, name) in [(1, "weft"), (2, "warp"), (3, "bobbin"), (1, "weft again")] {
        let payload = serde_json::to_vec(&serde_json::json!({ "name": name }))?;
        repo.insert(&table, &NewTask::new(object_id).with_payload(payload))
            .await?;
    }
    info!(table = %table, pending = repo.len(&table).await, "tasks enqueued");

    // (B) Queue worker and consumer, each under its own supervisor.
    let (worker, tasks, done) = QueueWorker::with_channels(repo.clone(), config, 16);
    let consumer = HelloConsumer {
        tasks,
        done,
        remaining_failures: 2,
    };
    let root = CancellationToken::new();
    let worker = Arc::new(Supervisor::new(worker));
    let consumer = Arc::new(Supervisor::new(consumer));
    let worker_handle = worker.clone().spawn(root.clone());
    let consumer_handle = consumer.clone().spawn(root.clone());

    // (C) Wait for the queue to drain, or Ctrl-C.
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
        _ = async {
            while !repo.is_empty(&table).await {
                sleep(Duration::from_millis(100)).await;
            }
        } => info!("queue drained"),
    }

    // (D) Graceful shutdown: consumer first, then the queue worker.
    let grace = Duration::from_secs(5);
    consumer.shutdown_timeout(grace).await?;
    worker.shutdown_timeout(grace).await?;
    consumer_handle.await??;
    worker_handle.await??;

    info!(pending = repo.len(&table).await, "bye");
    Ok(())
}
