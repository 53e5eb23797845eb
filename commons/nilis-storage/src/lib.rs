//! Single-node transactional key-value storage for a nilis shard.
//!
//! The engine owns one `redb` file holding a single logical namespace.
//! Writes are serialized write transactions with synchronous commit by
//! default; reads run in MVCC snapshot transactions and never block writers.

mod config;
mod engine;
mod error;


pub use config::StorageConfig;
pub use engine::{ApplyOutcome, CommitSeq, Mutation, StorageEngine};
pub use error::{StorageError, StorageResult};
