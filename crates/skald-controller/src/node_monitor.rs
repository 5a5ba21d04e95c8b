//! The node monitor: periodic reconciliation of the KV node registry
//! into the controller's [`NodeStore`].

use std::sync::Arc;

use skald_core::{KvStore, NodeMode, NodeTaskSummary, ShutdownFlag, SkaldConfig};

use crate::node_store::NodeStore;

const NODES_HASH: &str = "nodes:hash";
const NODES_MODE_HASH: &str = "nodes:mode:hash";

pub struct NodeMonitor<K> {
    kv: Arc<K>,
    store: Arc<NodeStore>,
    config: SkaldConfig,
    shutdown: ShutdownFlag,
}

impl<K: KvStore> NodeMonitor<K> {
    pub fn new(kv: Arc<K>, store: Arc<NodeStore>, config: SkaldConfig) -> Self {
        Self {
            kv,
            store,
            config,
            shutdown: ShutdownFlag::new(),
        }
    }

    pub fn shutdown_flag(&self) -> ShutdownFlag {
        self.shutdown.clone()
    }

    /// Run the periodic reconciliation loop until `stop()` is called.
    ///
    /// Each tick's body is wrapped so a transient KV failure is logged and
    /// retried next tick rather than killing the loop.
    pub async fn run(&self) {
        let span = tracing::info_span!("node_monitor");
        let _enter = span.enter();

        loop {
            if let Err(err) = self.tick().await {
                tracing::warn!(?err, "node monitor tick failed, retrying next tick");
            }

            tokio::select! {
                _ = self.shutdown.wait() => break,
                _ = tokio::time::sleep(self.config.monitor_skald_interval) => {}
            }
        }
    }

    pub async fn stop(&self) {
        self.shutdown.raise();
    }

    /// One reconciliation pass, per the five steps below.
    async fn tick(&self) -> Result<(), skald_core::SkaldError> {
        let now_ms = skald_core::now_ms();
        let snapshot = self.kv.hgetall(NODES_HASH).await?;
        let seen: std::collections::HashSet<&str> =
            snapshot.iter().map(|(id, _)| id.as_str()).collect();

        for (id, ts) in &snapshot {
            let ts: i64 = ts.parse().unwrap_or(0);
            self.store.upsert_last_seen(id, ts);
        }

        // Step 3: ids tracked locally but no longer in the snapshot are gone.
        for id in self.store.ids() {
            if !seen.contains(id.as_str()) {
                self.evict(&id).await?;
            }
        }

        // Step 4: ids still present but stale by the liveness timeout.
        for (id, ts) in &snapshot {
            let ts: i64 = ts.parse().unwrap_or(0);
            if now_ms - ts > self.config.liveness_timeout.as_millis() as i64 {
                tracing::info!(node = %id, "node timed out, evicting");
                self.evict(id).await?;
            }
        }

        // Step 5: refresh heartbeat/tasks/mode for everything still tracked.
        // `nodes:mode:hash` is read once up front, same as `nodes:hash` above,
        // rather than once per surviving node.
        let modes: std::collections::HashMap<String, String> =
            self.kv.hgetall(NODES_MODE_HASH).await?.into_iter().collect();

        for id in self.store.ids() {
            let heartbeat = self
                .kv
                .get(&format!("node:{id}:heartbeat"))
                .await?
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(0);

            let tasks = self
                .kv
                .get(&format!("node:{id}:all-task"))
                .await?
                .and_then(|raw| serde_json::from_str::<AllTaskDoc>(&raw).ok())
                .map(|doc| doc.tasks)
                .unwrap_or_default();

            let mode = modes
                .get(&id)
                .map(|value| if value == "edge" { NodeMode::Edge } else { NodeMode::Node })
                .unwrap_or(NodeMode::Node);

            self.store.refresh(&id, heartbeat, tasks, mode);
        }

        Ok(())
    }

    /// Purge `node:{id}:*` from KV, drop `id` from the controller's node
    /// registry, and remove it from the `nodes:hash`/`nodes:mode:hash`
    /// registries themselves so a dead node doesn't reappear next tick.
    async fn evict(&self, id: &str) -> Result<(), skald_core::SkaldError> {
        self.kv.delete_prefix(&format!("node:{id}:")).await?;
        self.kv.hdel(NODES_HASH, id).await?;
        self.kv.hdel(NODES_MODE_HASH, id).await?;
        self.store.remove(id);
        Ok(())
    }
}

#[derive(serde::Deserialize)]
struct AllTaskDoc {
    tasks: Vec<NodeTaskSummary>,
    #[allow(dead_code)]
    #[serde(rename = "existedTaskIds", default)]
    existed_task_ids: Vec<String>,
    #[allow(dead_code)]
    #[serde(default)]
    timestamp: i64,
}
