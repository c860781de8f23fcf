//! Store interfaces used by the job queue.
//!
//! The queue store holds pending chain requests as lists keyed
//! `{priority}:{identifier}`. The status store holds expiring progress
//! snapshots keyed by chain identifier. The result store holds final chain
//! results.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

/// Remote queue of pending chain requests.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Keys matching a glob `pattern`, scanned with `batch` as the per-call
    /// size hint and returning at most `limit` keys.
    async fn scan_keys(
        &self,
        pattern: &str,
        batch: usize,
        limit: usize,
    ) -> Result<Vec<String>, StoreError>;

    /// Atomically remove and return the head of the list at `key`.
    async fn pop_head(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Put `value` back at the head of the list at `key`.
    async fn push_head(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Append `value` to the tail of the list at `key`.
    async fn push_tail(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

/// Per-chain progress snapshots read by the external status API.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Write `snapshot` under `id` and set its expiration to `ttl`.
    async fn write_snapshot(
        &self,
        id: &str,
        snapshot: &serde_json::Value,
        ttl: Duration,
    ) -> Result<(), StoreError>;
}

/// Final results of finished chains.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn write_result(&self, id: &str, result: &serde_json::Value) -> Result<(), StoreError>;
}
