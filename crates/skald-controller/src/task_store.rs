//! The controller's in-memory task heartbeat store: one
//! [`TaskHeartbeatRecord`] per task currently in `{Assigning, Running}`,
//! keyed by task id.
//!
//! Exclusively owned by the controller and mutated only by the task monitor.

use std::collections::HashMap;

use parking_lot::RwLock;
use skald_core::TaskHeartbeatRecord;

#[derive(Default)]
pub struct TaskStore {
    tasks: RwLock<HashMap<String, TaskHeartbeatRecord>>,
    window_capacity: usize,
}

impl TaskStore {
    pub fn new(window_capacity: usize) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            window_capacity,
        }
    }

    pub fn ensure(&self, id: &str) {
        self.tasks
            .write()
            .entry(id.to_string())
            .or_insert_with(|| TaskHeartbeatRecord::new(id, self.window_capacity));
    }

    pub fn remove(&self, id: &str) {
        self.tasks.write().remove(id);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tasks.read().contains_key(id)
    }

    /// Ids currently tracked, used to detect tasks that vanished from the
    /// last DB scan (the "orphan" case in classification table).
    pub fn ids(&self) -> Vec<String> {
        self.tasks.read().keys().cloned().collect()
    }

    pub fn push_heartbeat(&self, id: &str, sample: i64) {
        if let Some(record) = self.tasks.write().get_mut(id) {
            record.push(sample);
        }
    }

    pub fn set_messages(&self, id: &str, error_message: Option<String>, exception_message: Option<String>) {
        if let Some(record) = self.tasks.write().get_mut(id) {
            record.error_message = error_message;
            record.exception_message = exception_message;
        }
    }

    /// Evaluate a task's classification against the predicate table below;
    /// returns `None` if the task isn't tracked.
    pub fn classify(&self, id: &str) -> Option<Classification> {
        let tasks = self.tasks.read();
        let record = tasks.get(id)?;

        Some(if record.contains_sentinel(skald_core::HeartbeatSentinel::Success) {
            Classification::Succeeded
        } else if record.contains_sentinel(skald_core::HeartbeatSentinel::Cancelled) {
            Classification::Cancelled
        } else if record.contains_sentinel(skald_core::HeartbeatSentinel::Failed)
            || (!record.is_assigning() && !record.is_alive())
        {
            Classification::Failed
        } else if record.is_assigning() {
            Classification::Assigning
        } else {
            Classification::Running
        })
    }
}

/// The outcome of evaluating a tracked task's heartbeat window against the
/// predicate table below.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Classification {
    Succeeded,
    Cancelled,
    Failed,
    Assigning,
    Running,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untracked_task_classifies_to_none() {
        let store = TaskStore::new(5);
        assert_eq!(store.classify("t1"), None);
    }

    #[test]
    fn fresh_task_is_assigning() {
        let store = TaskStore::new(5);
        store.ensure("t1");
        store.push_heartbeat("t1", 1);
        assert_eq!(store.classify("t1"), Some(Classification::Assigning));
    }

    #[test]
    fn changing_samples_classify_as_running() {
        let store = TaskStore::new(5);
        store.ensure("t1");
        for sample in [1, 2, 3, 4, 5] {
            store.push_heartbeat("t1", sample);
        }
        assert_eq!(store.classify("t1"), Some(Classification::Running));
    }

    #[test]
    fn full_window_of_constant_samples_is_failed() {
        let store = TaskStore::new(5);
        store.ensure("t1");
        for _ in 0..5 {
            store.push_heartbeat("t1", 42);
        }
        assert_eq!(store.classify("t1"), Some(Classification::Failed));
    }

    #[test]
    fn success_sentinel_wins_even_mid_window() {
        let store = TaskStore::new(5);
        store.ensure("t1");
        store.push_heartbeat("t1", 1);
        store.push_heartbeat("t1", skald_core::HeartbeatSentinel::Success.as_value());
        assert_eq!(store.classify("t1"), Some(Classification::Succeeded));
    }
}
