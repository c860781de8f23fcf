//! Redis store backend over a deadpool connection pool.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::redis;
use deadpool_redis::{Config, Connection, Pool, PoolConfig, Runtime};
use secrecy::{ExposeSecret, SecretString};

use super::traits::{QueueStore, ResultStore, StatusStore};
use crate::error::StoreError;

/// Upper bound on keys requested per `SCAN` call.
const MAX_SCAN_COUNT: usize = 1000;

/// One Redis database. The agent opens one per silo (queue, status,
/// results).
pub struct RedisStore {
    pool: Pool,
}

impl RedisStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Build a pool for `url`. Connections are opened lazily.
    pub fn connect(url: &SecretString, pool_size: usize) -> Result<Self, StoreError> {
        let mut cfg = Config::from_url(url.expose_secret());
        cfg.pool = Some(PoolConfig::new(pool_size));
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::Pool(e.to_string()))?;
        Ok(Self { pool })
    }

    async fn conn(&self) -> Result<Connection, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))
    }

    /// Round-trip a `PING`, used at startup to surface bad URLs early.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl QueueStore for RedisStore {
    async fn scan_keys(
        &self,
        pattern: &str,
        batch: usize,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn().await?;

        let mut keys: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;
        let scan_count = batch.clamp(1, MAX_SCAN_COUNT);

        loop {
            let (new_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(scan_count)
                .query_async(&mut conn)
                .await?;

            for key in batch {
                if keys.len() >= limit {
                    return Ok(keys);
                }
                keys.push(key);
            }

            cursor = new_cursor;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }

    async fn pop_head(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn().await?;
        let value: Option<String> = redis::cmd("LPOP").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn push_head(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: i64 = redis::cmd("LPUSH")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn push_tail(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: i64 = redis::cmd("RPUSH")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl StatusStore for RedisStore {
    async fn write_snapshot(
        &self,
        id: &str,
        snapshot: &serde_json::Value,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let body = serde_json::to_string(snapshot)?;
        let mut conn = self.conn().await?;

        // SET then EXPIRE in one MULTI so a snapshot never lingers without a TTL.
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SET")
            .arg(id)
            .arg(body)
            .ignore()
            .cmd("EXPIRE")
            .arg(id)
            .arg(ttl.as_secs().max(1))
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl ResultStore for RedisStore {
    async fn write_result(&self, id: &str, result: &serde_json::Value) -> Result<(), StoreError> {
        let body = serde_json::to_string(result)?;
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("SET")
            .arg(id)
            .arg(body)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}
