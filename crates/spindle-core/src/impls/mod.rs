//! Impls - queue repository implementations.
//!
//! - **InMemoryQueueRepository**: tests and the demo binary
//! - **PostgresQueueRepository**: production store (feature `postgres`)

pub mod inmem_repository;
#[cfg(feature = "postgres")]
pub mod postgres_repository;

pub use self::inmem_repository::InMemoryQueueRepository;
#[cfg(feature = "postgres")]
pub use self::postgres_repository::PostgresQueueRepository;
