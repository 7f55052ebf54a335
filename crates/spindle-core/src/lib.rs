//! spindle-core
//!
//! A generic work supervisor and a durable, polling task queue built on it.
//!
//! # Modules
//! - **domain**: `Task` record and error types
//! - **ports**: `QueueRepository` storage contract, `Clock`
//! - **app**: `Supervisor`, `Workable`, `QueueWorker`, `RetryPolicy`, config
//! - **impls**: in-memory and PostgreSQL repositories
//!
//! # Wiring
//! ```ignore
//! let repo = Arc::new(InMemoryQueueRepository::new());
//! let (worker, mut tasks, done) = QueueWorker::with_channels(repo, QueueWorkerConfig::new("mail"), 16);
//! let supervisor = Arc::new(Supervisor::new(worker));
//! let handle = supervisor.clone().spawn(CancellationToken::new());
//!
//! while let Some(task) = tasks.recv().await {
//!     let report = match send_mail(&task).await {
//!         Ok(()) => task.succeeded(),
//!         Err(e) => task.failed(e.to_string()),
//!     };
//!     done.send(report).await?;
//! }
//! supervisor.shutdown_timeout(Duration::from_secs(5)).await?;
//! ```

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;

pub use app::{QueueWorker, QueueWorkerConfig, RetryPolicy, Supervisor, Workable};
pub use domain::{NewTask, RepositoryError, SupervisorError, Task, WorkError};
pub use ports::QueueRepository;
