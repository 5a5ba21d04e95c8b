//! The node process: the in-node subprocess store, the registration
//! loop and survive handler that make this node visible to the controller,
//! and the task worker manager that consumes assignment traffic and
//! supervises subprocesses.
//!
//! A [`Node`] owns one instance of each and starts them in the startup
//! order (adapters are the caller's concern; this crate starts stores,
//! then the control-topic consumer, then the heartbeat writers).

pub mod node_store;
pub mod registration;
pub mod registry;
pub mod task_worker_manager;

use std::sync::Arc;
use std::time::Duration;

use skald_core::{Bus, KvStore, NodeMode, ShutdownFlag, SkaldConfig, SurviveHandler, TaskRepository};

pub use node_store::{NodeStore, SubprocessHandle};
pub use registration::NodeRegistration;
pub use registry::{WorkerRegistry, WorkerSpec};
pub use task_worker_manager::{LocalTaskSpec, TaskWorkerManager};

/// Wires up the subprocess store and task worker manager, plus the
/// node-liveness half of the survive handler, against a concrete KV/BUS/DB
/// stack and runs them until shut down.
pub struct Node<K, B, R> {
    node_id: String,
    registration: tokio::sync::Mutex<NodeRegistration<K>>,
    survive: tokio::sync::Mutex<SurviveHandler<K>>,
    manager: Arc<TaskWorkerManager<K, B, R>>,
    config: SkaldConfig,
}

impl<K, B, R> Node<K, B, R>
where
    K: KvStore + 'static,
    B: Bus + 'static,
    R: TaskRepository + 'static,
{
    pub fn new(
        kv: Arc<K>,
        bus: Arc<B>,
        repo: Arc<R>,
        node_id: impl Into<String>,
        mode: NodeMode,
        registry: WorkerRegistry,
        config: SkaldConfig,
    ) -> Self {
        let node_id = node_id.into();
        let store = Arc::new(NodeStore::new());
        let manager = Arc::new(TaskWorkerManager::new(
            Arc::clone(&kv),
            bus,
            repo,
            store,
            Arc::new(registry),
            node_id.clone(),
            config.clone(),
        ));

        Self {
            registration: tokio::sync::Mutex::new(NodeRegistration::new(
                Arc::clone(&kv),
                node_id.clone(),
                mode,
                config.activity_period,
            )),
            survive: tokio::sync::Mutex::new(SurviveHandler::new(
                kv,
                format!("node:{node_id}:heartbeat"),
                "node",
                config.survive_period,
            )),
            manager,
            node_id,
            config,
        }
    }

    pub fn node_store(&self) -> Arc<NodeStore> {
        self.manager.node_store()
    }

    /// Adopt this node's locally-declared Active tasks before the
    /// control-topic loop starts.
    pub async fn adopt_active_tasks(&self, specs: &[LocalTaskSpec]) -> Result<(), skald_core::SkaldError> {
        self.manager.adopt_active_tasks(specs).await
    }

    /// Start the node-liveness writers and block on the control-topic/KV
    /// sync loop until [`Node::stop`] is called.
    pub async fn run(&self) {
        let span = tracing::info_span!("node", id = %self.node_id);
        let _enter = span.enter();

        self.registration.lock().await.start();
        self.survive.lock().await.start();

        self.manager.run().await;
    }

    pub fn stop(&self) {
        self.manager.stop();
    }

    /// Stop every owned loop, bounded by `shutdown_join_timeout` per loop
    /// (teardown order: heartbeat writers stop first so peers observe
    /// the departure, then the control-topic consumer).
    pub async fn shutdown(&self) {
        let timeout = self.config.shutdown_join_timeout;
        self.survive.lock().await.stop(timeout).await;
        self.registration.lock().await.stop(timeout).await;
    }
}
