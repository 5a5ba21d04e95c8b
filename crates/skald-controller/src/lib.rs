//! The controller process: the node monitor, task monitor and dispatcher,
//! plus the in-memory node/task stores they converge.
//!
//! A [`Controller`] owns one instance of each and starts the subset implied
//! by its [`RunMode`]. Double-starting any of these singleton loops is a
//! programmer error, not something this crate tries to silently tolerate.

pub mod dispatcher;
pub mod node_monitor;
pub mod node_store;
pub mod run_mode;
pub mod task_monitor;
pub mod task_store;

use std::sync::Arc;

use parking_lot::Mutex;
use skald_core::{Bus, KvStore, ShutdownFlag, SkaldConfig, TaskRepository};
use tokio::task::JoinSet;

pub use dispatcher::Dispatcher;
pub use node_monitor::NodeMonitor;
pub use node_store::NodeStore;
pub use run_mode::RunMode;
pub use task_monitor::TaskMonitor;
pub use task_store::TaskStore;

/// Wires up the node monitor, task monitor and dispatcher against a
/// concrete KV/BUS/DB stack and runs the loops
/// implied by `mode` until shut down.
pub struct Controller<K, B, R> {
    kv: Arc<K>,
    bus: Arc<B>,
    repo: Arc<R>,
    config: SkaldConfig,
    mode: RunMode,
    nodes: Arc<NodeStore>,
    tasks: Arc<TaskStore>,
    shutdown_flags: Mutex<Vec<ShutdownFlag>>,
}

impl<K, B, R> Controller<K, B, R>
where
    K: KvStore + 'static,
    B: Bus + 'static,
    R: TaskRepository + 'static,
{
    pub fn new(kv: Arc<K>, bus: Arc<B>, repo: Arc<R>, config: SkaldConfig, mode: RunMode) -> Self {
        let tasks = Arc::new(TaskStore::new(config.heartbeat_window));
        Self {
            kv,
            bus,
            repo,
            mode,
            nodes: Arc::new(NodeStore::new()),
            tasks,
            config,
            shutdown_flags: Mutex::new(Vec::new()),
        }
    }

    /// Read access to the node store, e.g. for a future HTTP/dashboard API
    /// (out of scope here, named only as a seam).
    pub fn nodes(&self) -> Arc<NodeStore> {
        Arc::clone(&self.nodes)
    }

    /// Raise every running loop's shutdown flag. Each loop's own bounded
    /// join timeout governs how long `run()` then takes to return.
    pub fn stop(&self) {
        for flag in self.shutdown_flags.lock().iter() {
            flag.raise();
        }
    }

    /// Start every loop implied by [`RunMode`] and block until all of them
    /// have returned (they only do so once [`Controller::stop`] is called).
    pub async fn run(&self) {
        let mut set = JoinSet::new();
        let mut flags = Vec::new();

        if self.mode.runs_node_monitor() {
            let monitor = NodeMonitor::new(Arc::clone(&self.kv), Arc::clone(&self.nodes), self.config.clone());
            flags.push(monitor.shutdown_flag());
            set.spawn(async move { monitor.run().await });
        }

        if self.mode.runs_task_monitor() {
            let monitor = TaskMonitor::new(
                Arc::clone(&self.repo),
                Arc::clone(&self.kv),
                Arc::clone(&self.bus),
                Arc::clone(&self.tasks),
                self.config.clone(),
            );
            flags.push(monitor.shutdown_flag());
            set.spawn(async move { monitor.run().await });
        }

        if self.mode.runs_dispatcher() {
            let dispatcher = Dispatcher::new(
                Arc::clone(&self.repo),
                Arc::clone(&self.bus),
                Arc::clone(&self.nodes),
                self.config.clone(),
            );
            flags.push(dispatcher.shutdown_flag());
            set.spawn(async move { dispatcher.run().await });
        }

        *self.shutdown_flags.lock() = flags;

        while set.join_next().await.is_some() {}
    }
}
