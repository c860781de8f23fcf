//! In-process store backend.
//!
//! Implements all three store traits over plain collections. Used for local
//! runs without Redis and as the fake store in tests.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::traits::{QueueStore, ResultStore, StatusStore};
use crate::error::StoreError;
use crate::queue::entry::queue_key;

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    ttl: Duration,
    written_at: Instant,
}

impl StoredValue {
    fn is_expired(&self) -> bool {
        self.written_at.elapsed() >= self.ttl
    }
}

#[derive(Debug, Default)]
struct Inner {
    /// Lists in key creation order, so scans are deterministic.
    lists: Vec<(String, VecDeque<String>)>,
    snapshots: HashMap<String, StoredValue>,
    results: HashMap<String, String>,
    /// Keys whose next `write_snapshot` fails, for exercising error paths.
    failing_writes: Vec<String>,
    /// Keys whose next `pop_head` fails.
    failing_pops: Vec<String>,
}

/// Memory-backed queue, status and result store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a serialized request the way a producer would.
    pub async fn enqueue(&self, priority: i64, identifier: &str, payload: &str) {
        let key = queue_key(priority, identifier);
        // Infallible for the memory backend.
        let _ = self.push_tail(&key, payload).await;
    }

    /// Status snapshot for `id`, ignoring expired entries.
    pub async fn snapshot(&self, id: &str) -> Option<String> {
        let inner = self.inner.lock().await;
        inner
            .snapshots
            .get(id)
            .filter(|v| !v.is_expired())
            .map(|v| v.value.clone())
    }

    /// Expiration set by the most recent snapshot write for `id`.
    pub async fn ttl(&self, id: &str) -> Option<Duration> {
        self.inner.lock().await.snapshots.get(id).map(|v| v.ttl)
    }

    /// Final result record for `id`.
    pub async fn result(&self, id: &str) -> Option<String> {
        self.inner.lock().await.results.get(id).cloned()
    }

    pub async fn list_len(&self, key: &str) -> usize {
        let inner = self.inner.lock().await;
        inner
            .lists
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, items)| items.len())
            .unwrap_or(0)
    }

    /// Make the next snapshot write for `key` fail.
    pub async fn fail_next_write(&self, key: &str) {
        self.inner.lock().await.failing_writes.push(key.to_string());
    }

    /// Make the next pop from the list at `key` fail.
    pub async fn fail_next_pop(&self, key: &str) {
        self.inner.lock().await.failing_pops.push(key.to_string());
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn scan_keys(
        &self,
        pattern: &str,
        _batch: usize,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .lists
            .iter()
            .filter(|(key, _)| glob_match(pattern, key))
            .map(|(key, _)| key.clone())
            .take(limit)
            .collect())
    }

    async fn pop_head(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(pos) = inner.failing_pops.iter().position(|k| k == key) {
            inner.failing_pops.remove(pos);
            return Err(StoreError::Pool(format!("injected failure popping {key}")));
        }
        let Some(pos) = inner.lists.iter().position(|(k, _)| k == key) else {
            return Ok(None);
        };
        let value = inner.lists[pos].1.pop_front();
        // Empty lists vanish, as in Redis.
        if inner.lists[pos].1.is_empty() {
            inner.lists.remove(pos);
        }
        Ok(value)
    }

    async fn push_head(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.lists.iter_mut().find(|(k, _)| k == key) {
            Some((_, items)) => items.push_front(value.to_string()),
            None => inner
                .lists
                .push((key.to_string(), VecDeque::from([value.to_string()]))),
        }
        Ok(())
    }

    async fn push_tail(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.lists.iter_mut().find(|(k, _)| k == key) {
            Some((_, items)) => items.push_back(value.to_string()),
            None => inner
                .lists
                .push((key.to_string(), VecDeque::from([value.to_string()]))),
        }
        Ok(())
    }
}

#[async_trait]
impl StatusStore for MemoryStore {
    async fn write_snapshot(
        &self,
        id: &str,
        snapshot: &serde_json::Value,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let value = serde_json::to_string(snapshot)?;
        let mut inner = self.inner.lock().await;
        if let Some(pos) = inner.failing_writes.iter().position(|k| k == id) {
            inner.failing_writes.remove(pos);
            return Err(StoreError::Pool(format!("injected failure writing {id}")));
        }
        inner.snapshots.insert(
            id.to_string(),
            StoredValue {
                value,
                ttl,
                written_at: Instant::now(),
            },
        );
        Ok(())
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn write_result(&self, id: &str, result: &serde_json::Value) -> Result<(), StoreError> {
        let value = serde_json::to_string(result)?;
        self.inner.lock().await.results.insert(id.to_string(), value);
        Ok(())
    }
}

/// Minimal glob matching supporting `*` only, which is all the queue
/// protocol needs.
fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }

    let mut rest = text;
    for (i, part) in parts.iter().enumerate() {
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(idx) => rest = &rest[idx + part.len()..],
                None => return false,
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn glob_patterns() {
        assert!(glob_match("1:*", "1:abc"));
        assert!(!glob_match("1:*", "11:abc"));
        assert!(glob_match("*:abc", "5:abc"));
        assert!(glob_match("a*c*e", "abcde"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exactly"));
    }

    #[tokio::test]
    async fn lists_pop_in_fifo_order_and_vanish_when_empty() {
        let store = MemoryStore::new();
        store.enqueue(1, "a", "first").await;
        store.enqueue(1, "a", "second").await;

        assert_eq!(store.pop_head("1:a").await.unwrap().as_deref(), Some("first"));
        assert_eq!(store.pop_head("1:a").await.unwrap().as_deref(), Some("second"));
        assert_eq!(store.pop_head("1:a").await.unwrap(), None);
        assert!(store.scan_keys("1:*", 10, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn push_head_defers_to_front() {
        let store = MemoryStore::new();
        store.enqueue(1, "a", "second").await;
        store.push_head("1:a", "first").await.unwrap();
        assert_eq!(store.pop_head("1:a").await.unwrap().as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn scan_respects_limit_and_insertion_order() {
        let store = MemoryStore::new();
        store.enqueue(2, "x", "{}").await;
        store.enqueue(2, "y", "{}").await;
        store.enqueue(3, "z", "{}").await;

        let keys = store.scan_keys("2:*", 100, 1).await.unwrap();
        assert_eq!(keys, vec!["2:x".to_string()]);
    }

    #[tokio::test]
    async fn snapshot_records_ttl() {
        let store = MemoryStore::new();
        store
            .write_snapshot("abc", &json!({"status": "running"}), Duration::from_secs(50))
            .await
            .unwrap();
        assert_eq!(store.ttl("abc").await, Some(Duration::from_secs(50)));
        assert!(store.snapshot("abc").await.unwrap().contains("running"));
    }

    #[tokio::test]
    async fn results_do_not_touch_snapshots() {
        let store = MemoryStore::new();
        store
            .write_snapshot("abc", &json!({"status": "complete"}), Duration::from_secs(50))
            .await
            .unwrap();
        store
            .write_result("abc", &json!({"id": "abc", "result": {"ok": true}}))
            .await
            .unwrap();
        store
            .write_snapshot("abc", &json!({"status": "running"}), Duration::from_secs(50))
            .await
            .unwrap();

        assert_eq!(store.ttl("abc").await, Some(Duration::from_secs(50)));
        assert!(store.snapshot("abc").await.unwrap().contains("running"));
        assert!(store.result("abc").await.unwrap().contains("\"ok\":true"));
    }

    #[tokio::test]
    async fn injected_pop_failure_applies_once() {
        let store = MemoryStore::new();
        store.enqueue(1, "a", "first").await;
        store.fail_next_pop("1:a").await;
        assert!(store.pop_head("1:a").await.is_err());
        assert_eq!(store.pop_head("1:a").await.unwrap().as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn injected_failure_applies_once() {
        let store = MemoryStore::new();
        store.fail_next_write("abc").await;
        let snapshot = json!({});
        assert!(store.write_snapshot("abc", &snapshot, Duration::from_secs(1)).await.is_err());
        assert!(store.write_snapshot("abc", &snapshot, Duration::from_secs(1)).await.is_ok());
    }
}
