//! Persistence for the job queue.
//!
//! - `traits`: `QueueStore`, `StatusStore`, `ResultStore`
//! - `redis_backend`: production backend (deadpool-redis)
//! - `memory`: in-process backend for local runs and tests

pub mod memory;
pub mod redis_backend;
pub mod traits;

pub use memory::MemoryStore;
pub use redis_backend::RedisStore;
pub use traits::{QueueStore, ResultStore, StatusStore};
