//! Periodic node registration: writes `nodes:hash[id] = now_ms` every
//! `activity_period` so the controller's node monitor can see this node
//! is alive. The node-side counterpart to `node:{id}:heartbeat`, which is
//! written instead by a [`skald_core::SurviveHandler`] — this loop has the
//! same shape, just against a hash field rather than a plain key.

use std::sync::Arc;
use std::time::Duration;

use skald_core::{KvStore, NodeMode, ShutdownFlag};
use tokio::task::JoinHandle;

const NODES_HASH: &str = "nodes:hash";
const NODES_MODE_HASH: &str = "nodes:mode:hash";

pub struct NodeRegistration<K> {
    kv: Arc<K>,
    node_id: String,
    mode: NodeMode,
    period: Duration,
    flag: ShutdownFlag,
    handle: Option<JoinHandle<()>>,
}

impl<K: KvStore + 'static> NodeRegistration<K> {
    pub fn new(kv: Arc<K>, node_id: impl Into<String>, mode: NodeMode, period: Duration) -> Self {
        Self {
            kv,
            node_id: node_id.into(),
            mode,
            period,
            flag: ShutdownFlag::new(),
            handle: None,
        }
    }

    /// Start the periodic writer. Panics if already started.
    pub fn start(&mut self) {
        assert!(
            self.handle.is_none(),
            "node registration for {} started twice",
            self.node_id
        );

        let kv = Arc::clone(&self.kv);
        let node_id = self.node_id.clone();
        let mode = self.mode;
        let period = self.period;
        let flag = self.flag.clone();

        self.handle = Some(tokio::spawn(async move {
            let span = tracing::info_span!("node_registration", node = %node_id);
            let _enter = span.enter();

            loop {
                let now_ms = skald_core::now_ms();
                if let Err(err) = kv.hset(NODES_HASH, &node_id, &now_ms.to_string()).await {
                    tracing::warn!(?err, "node registration write failed");
                }
                if let Err(err) = kv.hset(NODES_MODE_HASH, &node_id, &mode.to_string()).await {
                    tracing::warn!(?err, "node mode registration write failed");
                }

                tokio::select! {
                    _ = flag.wait() => break,
                    _ = tokio::time::sleep(period) => {}
                }
            }
        }));
    }

    /// Stop the periodic loop, bounded by `join_timeout`. Idempotent.
    pub async fn stop(&mut self, join_timeout: Duration) {
        self.flag.raise();
        if let Some(handle) = self.handle.take() {
            if tokio::time::timeout(join_timeout, handle).await.is_err() {
                tracing::warn!(node = %self.node_id, "node registration did not join within timeout");
            }
        }
    }
}

impl<K> Drop for NodeRegistration<K> {
    fn drop(&mut self) {
        self.flag.raise();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skald_core::testutil::MemoryKv;

    #[tokio::test]
    async fn writes_nodes_hash_on_a_period() {
        let kv = Arc::new(MemoryKv::new());
        let mut registration =
            NodeRegistration::new(Arc::clone(&kv), "n1", NodeMode::Node, Duration::from_millis(10));
        registration.start();

        tokio::time::sleep(Duration::from_millis(50)).await;
        registration.stop(Duration::from_secs(1)).await;

        let all = kv.hgetall("nodes:hash").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, "n1");
    }

    #[tokio::test]
    async fn writes_nodes_mode_hash_matching_the_configured_mode() {
        let kv = Arc::new(MemoryKv::new());
        let mut registration =
            NodeRegistration::new(Arc::clone(&kv), "n1", NodeMode::Edge, Duration::from_millis(10));
        registration.start();

        tokio::time::sleep(Duration::from_millis(50)).await;
        registration.stop(Duration::from_secs(1)).await;

        let all = kv.hgetall("nodes:mode:hash").await.unwrap();
        assert_eq!(all, vec![("n1".to_string(), "edge".to_string())]);
    }

    #[tokio::test]
    #[should_panic(expected = "started twice")]
    async fn double_start_panics() {
        let kv = Arc::new(MemoryKv::new());
        let mut registration = NodeRegistration::new(kv, "n1", NodeMode::Node, Duration::from_secs(1));
        registration.start();
        registration.start();
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let kv = Arc::new(MemoryKv::new());
        let mut registration = NodeRegistration::new(kv, "n1", NodeMode::Node, Duration::from_millis(10));
        registration.start();
        registration.stop(Duration::from_secs(1)).await;
        registration.stop(Duration::from_secs(1)).await;
    }
}
