//! A [`skald_core::KvStore`] adapter over a redis connection manager:
//! hash and scan operations map directly onto redis `HSET`/`HGETALL`/
//! `SCAN`.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use skald_core::{ErrorKind, KvStore, SkaldConfig, SkaldError};

/// Cheaply cloneable handle around a redis [`ConnectionManager`], which
/// already transparently reconnects on connection loss; every call is
/// additionally wrapped in [`skald_core::retry`] so a transient failure that
/// outlasts the manager's own reconnect is retried with backoff before
/// being surfaced to the caller.
#[derive(Clone)]
pub struct RedisKv {
    manager: ConnectionManager,
    config: SkaldConfig,
}

impl RedisKv {
    pub async fn connect(url: &str, config: &SkaldConfig) -> Result<Self, SkaldError> {
        let client = redis::Client::open(url)
            .map_err(|err| SkaldError::new(ErrorKind::FatalResourceLoss, err))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|err| SkaldError::new(ErrorKind::FatalResourceLoss, err))?;
        Ok(Self {
            manager,
            config: config.clone(),
        })
    }
}

fn transient(err: redis::RedisError) -> SkaldError {
    SkaldError::new(ErrorKind::TransientIo, err)
}

const SCAN_BATCH: usize = 500;

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>, SkaldError> {
        skald_core::retry(&self.config, || {
            let mut conn = self.manager.clone();
            async move { conn.get(key).await.map_err(transient) }
        })
        .await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), SkaldError> {
        skald_core::retry(&self.config, || {
            let mut conn = self.manager.clone();
            async move { conn.set(key, value).await.map_err(transient) }
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), SkaldError> {
        skald_core::retry(&self.config, || {
            let mut conn = self.manager.clone();
            async move { conn.del(key).await.map_err(transient) }
        })
        .await
    }

    async fn hset(&self, hash: &str, field: &str, value: &str) -> Result<(), SkaldError> {
        skald_core::retry(&self.config, || {
            let mut conn = self.manager.clone();
            async move { conn.hset(hash, field, value).await.map_err(transient) }
        })
        .await
    }

    async fn hgetall(&self, hash: &str) -> Result<Vec<(String, String)>, SkaldError> {
        skald_core::retry(&self.config, || {
            let mut conn = self.manager.clone();
            async move {
                let map: std::collections::HashMap<String, String> =
                    conn.hgetall(hash).await.map_err(transient)?;
                Ok(map.into_iter().collect())
            }
        })
        .await
    }

    async fn hdel(&self, hash: &str, field: &str) -> Result<(), SkaldError> {
        skald_core::retry(&self.config, || {
            let mut conn = self.manager.clone();
            async move { conn.hdel(hash, field).await.map_err(transient) }
        })
        .await
    }

    /// Cursor-driven `SCAN prefix* MATCH` followed by a batched `DEL`,
    /// avoiding the blocking `KEYS` command (`node:{id}:*` purge). The
    /// whole scan-and-delete sweep is retried as one unit on a transient
    /// error; re-running it is safe since deleting an already-deleted key is
    /// a no-op.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, SkaldError> {
        skald_core::retry(&self.config, || {
            let mut conn = self.manager.clone();
            let pattern = format!("{prefix}*");
            async move {
                let mut cursor: u64 = 0;
                let mut removed: u64 = 0;

                loop {
                    let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn)
                        .await
                        .map_err(transient)?;

                    if !keys.is_empty() {
                        removed += keys.len() as u64;
                        let _: () = conn.del(&keys).await.map_err(transient)?;
                    }

                    cursor = next_cursor;
                    if cursor == 0 {
                        break;
                    }
                }

                Ok(removed)
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    //! Requires a local redis instance; skipped unless `SKALD_TEST_REDIS_URL`
    //! is set, matching the pattern the other adapter crates use for
    //! integration tests against a real backend.
    use super::*;

    #[tokio::test]
    #[ignore = "requires a live redis instance"]
    async fn behaves_like_a_kv_store() {
        let url = std::env::var("SKALD_TEST_REDIS_URL").expect("SKALD_TEST_REDIS_URL not set");
        let kv = RedisKv::connect(&url, &SkaldConfig::default()).await.unwrap();
        skald_core::kv::asserts::behaves_like_a_kv_store(&kv).await;
    }
}
