//! The key/value contract: key/hash primitives the survive handler, node
//! monitor and task monitor are built on.

use async_trait::async_trait;

use crate::error::SkaldError;

/// A key/hash/pubsub store.
///
/// Every method is a single round trip and must apply its own bounded
/// timeout; callers retry transient failures with [`crate::Backoff`].
/// Implementations are expected to be cheaply cloneable handles around a
/// connection pool, not the pool itself.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, SkaldError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), SkaldError>;

    async fn delete(&self, key: &str) -> Result<(), SkaldError>;

    /// Write one field of a hash, e.g. `nodes:hash[id] = lastUpdateMs`.
    async fn hset(&self, hash: &str, field: &str, value: &str) -> Result<(), SkaldError>;

    /// Read every field of a hash, e.g. the full `nodes:hash` snapshot.
    async fn hgetall(&self, hash: &str) -> Result<Vec<(String, String)>, SkaldError>;

    async fn hdel(&self, hash: &str, field: &str) -> Result<(), SkaldError>;

    /// Delete every key matching `prefix*`, used to purge `node:{id}:*` when
    /// a node is evicted. Returns the number of keys removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, SkaldError>;
}

/// A conformance suite exercised against every concrete [`KvStore`]
/// implementation: the in-memory one in [`crate::testutil`], and each
/// adapter crate's own (backend-requiring, `#[ignore]`d by default)
/// integration test. Not behind `#[cfg(test)]` so adapter crates outside
/// this one can call it too.
pub mod asserts {
    use super::*;

    /// Exercised against every concrete [`KvStore`] implementation (the
    /// in-memory one here, and each adapter crate's own tests) so the
    /// contract stays consistent across backends.
    pub async fn behaves_like_a_kv_store(kv: &dyn KvStore) {
        assert_eq!(kv.get("missing").await.unwrap(), None);

        kv.set("k", "v1").await.unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v1"));

        kv.hset("h", "a", "1").await.unwrap();
        kv.hset("h", "b", "2").await.unwrap();
        let mut all = kv.hgetall("h").await.unwrap();
        all.sort();
        assert_eq!(
            all,
            vec![("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())]
        );

        kv.hdel("h", "a").await.unwrap();
        assert_eq!(kv.hgetall("h").await.unwrap(), vec![("b".to_string(), "2".to_string())]);

        kv.set("node:n1:heartbeat", "1").await.unwrap();
        kv.set("node:n1:all-task", "[]").await.unwrap();
        kv.set("node:n2:heartbeat", "1").await.unwrap();
        let removed = kv.delete_prefix("node:n1:").await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(kv.get("node:n2:heartbeat").await.unwrap().as_deref(), Some("1"));

        kv.delete("k").await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), None);
    }
}
