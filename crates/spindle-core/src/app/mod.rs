//! App - the supervision loop and the queue worker built on top of it.
//!
//! # Main components
//! - **Supervisor**: drives any [`Workable`] in a cancellable loop with a shutdown handshake
//! - **QueueWorker**: polls a [`crate::ports::QueueRepository`] and feeds a bounded channel
//! - **RetryPolicy**: what happens to a task once a consumer reports back
//! - **QueueWorkerConfig**: serde-loadable worker settings

pub mod config;
pub mod queue_worker;
pub mod retry;
pub mod supervisor;

pub use self::config::QueueWorkerConfig;
pub use self::queue_worker::QueueWorker;
pub use self::retry::{Disposition, RetryPolicy};
pub use self::supervisor::{Supervisor, Workable};
