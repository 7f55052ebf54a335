//! Ports - abstractions over the outside world.
//!
//! The queue table lives behind [`QueueRepository`]; time comes from [`Clock`].

pub mod clock;
pub mod queue_repository;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::queue_repository::QueueRepository;
