//! Domain model: the queued task record and the error taxonomy.

pub mod errors;
pub mod task;

pub use self::errors::{RepositoryError, SupervisorError, WorkError};
pub use self::task::{NewTask, Task};
