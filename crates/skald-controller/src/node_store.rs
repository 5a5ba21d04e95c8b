//! The controller's in-memory node store: one [`NodeRecord`] per node
//! known to be registered, keyed by node id.
//!
//! Exclusively owned by the controller and mutated only by the node monitor;
//! the dispatcher only reads a snapshot of it.

use std::collections::HashMap;

use parking_lot::RwLock;
use skald_core::{NodeMode, NodeRecord, NodeTaskSummary};

/// Guarded by a single read-write lock, readers dominate: the
/// dispatcher's per-tick snapshot and any future read-side observer both
/// read far more often than the node monitor writes.
#[derive(Default)]
pub struct NodeStore {
    nodes: RwLock<HashMap<String, NodeRecord>>,
}

impl NodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_last_seen(&self, id: &str, last_update_ms: i64) {
        let mut nodes = self.nodes.write();
        match nodes.get_mut(id) {
            Some(record) => record.last_update_ms = last_update_ms,
            None => {
                nodes.insert(
                    id.to_string(),
                    NodeRecord {
                        id: id.to_string(),
                        mode: NodeMode::Node,
                        last_update_ms,
                        heartbeat: last_update_ms,
                        tasks: Vec::new(),
                    },
                );
            }
        }
    }

    pub fn refresh(&self, id: &str, heartbeat: i64, tasks: Vec<NodeTaskSummary>, mode: NodeMode) {
        let mut nodes = self.nodes.write();
        if let Some(record) = nodes.get_mut(id) {
            record.heartbeat = heartbeat;
            record.tasks = tasks;
            record.mode = mode;
        }
    }

    pub fn remove(&self, id: &str) -> Option<NodeRecord> {
        self.nodes.write().remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// All ids currently tracked, for the node monitor's snapshot-diff step.
    pub fn ids(&self) -> Vec<String> {
        self.nodes.read().keys().cloned().collect()
    }

    /// A point-in-time clone of every record, used by the dispatcher to
    /// build its per-tick load map without holding the lock across awaits.
    pub fn snapshot(&self) -> Vec<NodeRecord> {
        self.nodes.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_creates_then_updates() {
        let store = NodeStore::new();
        store.upsert_last_seen("n1", 100);
        assert_eq!(store.len(), 1);

        store.upsert_last_seen("n1", 200);
        assert_eq!(store.len(), 1);
        assert_eq!(store.snapshot()[0].last_update_ms, 200);
    }

    #[test]
    fn remove_drops_the_record() {
        let store = NodeStore::new();
        store.upsert_last_seen("n1", 100);
        assert!(store.remove("n1").is_some());
        assert!(store.is_empty());
    }

    #[test]
    fn refresh_only_touches_existing_records() {
        let store = NodeStore::new();
        store.refresh("ghost", 1, Vec::new(), NodeMode::Node);
        assert!(store.is_empty());
    }
}
