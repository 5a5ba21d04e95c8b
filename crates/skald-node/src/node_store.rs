//! The node's in-process subprocess map: the authoritative record of
//! every task subprocess this node currently owns, indexed by task id and by
//! a secondary "resource id" pulled out of the task's attachments.
//!
//! Exclusively owned and mutated by the task worker manager; nothing
//! else in this process touches a child handle directly.

use std::collections::HashMap;

use parking_lot::Mutex;
use skald_core::NodeTaskSummary;
use tokio::process::Child;

/// One subprocess this node spawned, presumed running until [`NodeStore::reap_exited`]
/// or an explicit cancel says otherwise.
pub struct SubprocessHandle {
    pub child: Child,
    pub class_name: String,
    pub resource_id: Option<String>,
    pub launched_at_ms: i64,
}

#[derive(Default)]
pub struct NodeStore {
    processes: Mutex<HashMap<String, SubprocessHandle>>,
}

impl NodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, task_id: impl Into<String>, handle: SubprocessHandle) {
        self.processes.lock().insert(task_id.into(), handle);
    }

    pub fn remove(&self, task_id: &str) -> Option<SubprocessHandle> {
        self.processes.lock().remove(task_id)
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.processes.lock().contains_key(task_id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.processes.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.processes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.lock().is_empty()
    }

    /// Resolve the task id owning a given secondary resource id, if any.
    pub fn find_by_resource_id(&self, resource_id: &str) -> Option<String> {
        self.processes
            .lock()
            .iter()
            .find(|(_, handle)| handle.resource_id.as_deref() == Some(resource_id))
            .map(|(id, _)| id.clone())
    }

    /// Snapshot of `{id, className}` pairs for every task still tracked,
    /// consumed by the task worker manager's KV sync loop.
    pub fn summaries(&self) -> Vec<NodeTaskSummary> {
        self.processes
            .lock()
            .iter()
            .map(|(id, handle)| NodeTaskSummary {
                id: id.clone(),
                class_name: handle.class_name.clone(),
            })
            .collect()
    }

    /// Drop any subprocess that has already exited on its own (crashed, or
    /// finished without the cancel path clearing it first). Returns the ids
    /// that were reaped.
    pub fn reap_exited(&self) -> Vec<String> {
        let mut processes = self.processes.lock();
        let mut exited = Vec::new();
        processes.retain(|id, handle| match handle.child.try_wait() {
            Ok(Some(_status)) => {
                exited.push(id.clone());
                false
            }
            _ => true,
        });
        exited
    }
}
