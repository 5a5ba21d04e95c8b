//! The `Task` data model, its lifecycle state machine, and the controller's
//! in-memory views of nodes and task heartbeats.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::sentinel::HeartbeatSentinel;

/// Discriminates who is allowed to move a task out of `Created`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskMode {
    /// Self-instantiated by a node from its local configuration.
    Active,
    /// Assigned to a node by the controller's dispatcher.
    Passive,
}

/// The seven-state lifecycle a [`Task`] moves through.
///
/// Transitions are monotonic except that `Assigning` and `Running` may
/// oscillate under flapping heartbeats; the task monitor always prefers the
/// most recently observed classification.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum LifecycleStatus {
    Created,
    Assigning,
    Running,
    Paused,
    Finished,
    Failed,
    Cancelled,
}

impl LifecycleStatus {
    /// Tasks in these states must have `executor = None`.
    pub fn is_unassignable(self) -> bool {
        matches!(
            self,
            LifecycleStatus::Created
                | LifecycleStatus::Finished
                | LifecycleStatus::Failed
                | LifecycleStatus::Cancelled
        )
    }

    /// Tasks in these states must have a non-null `executor`.
    pub fn requires_executor(self) -> bool {
        matches!(self, LifecycleStatus::Assigning | LifecycleStatus::Running)
    }
}

/// A unit of work, as persisted in the document database.
///
/// `attachments` is treated as an opaque blob by every component in this
/// crate: it is round-tripped through the database and the bus byte for byte
/// (or at least semantically, if the backing database enforces a canonical
/// JSON form) and only class-specific consumers on the worker side decode it.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub class_name: String,
    pub source: String,
    pub name: Option<String>,
    pub description: Option<String>,

    pub executor: Option<String>,
    pub mode: TaskMode,

    pub create_date_time: DateTime<Utc>,
    pub update_date_time: DateTime<Utc>,
    pub deadline_date_time: Option<DateTime<Utc>>,

    pub lifecycle_status: LifecycleStatus,
    pub priority: u8,

    pub attachments: Box<RawValue>,
}

impl Task {
    /// Read a scalar out of the opaque attachment blob by key, e.g. the
    /// configurable "resource id" secondary index a node's subprocess map
    /// indexes tasks by.
    ///
    /// Returns `None` if the attachments aren't a JSON object, the key is
    /// absent, or the value isn't a string.
    pub fn attachment_str(&self, key: &str) -> Option<String> {
        let value: serde_json::Value = serde_json::from_str(self.attachments.get()).ok()?;
        value.get(key)?.as_str().map(str::to_owned)
    }

    /// True if this task's invariants hold.
    pub fn invariants_hold(&self) -> bool {
        match self.executor {
            None => self.lifecycle_status.is_unassignable(),
            Some(_) => true,
        }
    }
}

/// Whether a node accepts controller-dispatched (`Passive`) tasks.
///
/// Only [`NodeMode::Node`] is eligible as a dispatcher assignment target; an
/// [`NodeMode::Edge`] node only ever runs locally-declared `Active` tasks.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeMode {
    Node,
    Edge,
}

impl std::fmt::Display for NodeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NodeMode::Node => "node",
            NodeMode::Edge => "edge",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for NodeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "node" => Ok(NodeMode::Node),
            "edge" => Ok(NodeMode::Edge),
            other => Err(format!("unknown node mode: {other}")),
        }
    }
}

/// A lightweight `{id, className}` pair reported by a node's task-list
/// projection (`node:{id}:all-task` in KV).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct NodeTaskSummary {
    pub id: String,
    #[serde(rename = "className")]
    pub class_name: String,
}

/// The controller's view of a single node.
#[derive(Clone, Debug)]
pub struct NodeRecord {
    pub id: String,
    pub mode: NodeMode,
    pub last_update_ms: i64,
    pub heartbeat: i64,
    pub tasks: Vec<NodeTaskSummary>,
}

impl NodeRecord {
    /// A node is online iff its last-seen timestamp is within the liveness
    /// timeout of `now_ms`.
    pub fn is_online(&self, now_ms: i64, liveness_timeout_ms: i64) -> bool {
        now_ms - self.last_update_ms <= liveness_timeout_ms
    }

    pub fn is_assignment_target(&self, now_ms: i64, liveness_timeout_ms: i64) -> bool {
        self.mode == NodeMode::Node && self.is_online(now_ms, liveness_timeout_ms)
    }
}

/// The bounded sliding window of heartbeat samples the task monitor keeps per
/// monitored task, plus the last observed error/exception strings.
#[derive(Clone, Debug)]
pub struct TaskHeartbeatRecord {
    pub task_id: String,
    window: VecDeque<i64>,
    capacity: usize,
    pub error_message: Option<String>,
    pub exception_message: Option<String>,
}

impl TaskHeartbeatRecord {
    pub fn new(task_id: impl Into<String>, capacity: usize) -> Self {
        Self {
            task_id: task_id.into(),
            window: VecDeque::with_capacity(capacity),
            capacity,
            error_message: None,
            exception_message: None,
        }
    }

    /// Append a sample, evicting the oldest one if the window is already at
    /// capacity.
    pub fn push(&mut self, sample: i64) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(sample);
    }

    pub fn samples(&self) -> impl Iterator<Item = i64> + '_ {
        self.window.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// The window hasn't filled up yet: the task has not been observed long
    /// enough to classify it as alive or dead.
    pub fn is_assigning(&self) -> bool {
        self.window.len() < self.capacity
    }

    /// More than two distinct values have been observed in the window, i.e.
    /// the worker is publishing a changing (monotonic) timestamp rather than
    /// a constant value.
    pub fn is_alive(&self) -> bool {
        let distinct: std::collections::HashSet<i64> = self.window.iter().copied().collect();
        distinct.len() > 2
    }

    pub fn contains_sentinel(&self, sentinel: HeartbeatSentinel) -> bool {
        self.window.iter().any(|&s| s == sentinel as i64)
    }
}

/// Payload republished on the intra-task `taskworker.update` topic when an
/// attachment update arrives for a running task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpdateTaskWorkerEvent {
    pub task_id: String,
    pub attachments: Box<RawValue>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task(status: LifecycleStatus, executor: Option<&str>) -> Task {
        Task {
            id: "t1".into(),
            class_name: "W".into(),
            source: "test".into(),
            name: None,
            description: None,
            executor: executor.map(str::to_owned),
            mode: TaskMode::Passive,
            create_date_time: Utc::now(),
            update_date_time: Utc::now(),
            deadline_date_time: None,
            lifecycle_status: status,
            priority: 0,
            attachments: RawValue::from_string("{}".into()).unwrap(),
        }
    }

    #[test]
    fn invariant_holds_when_unassigned_and_terminal() {
        assert!(sample_task(LifecycleStatus::Created, None).invariants_hold());
        assert!(sample_task(LifecycleStatus::Finished, None).invariants_hold());
        assert!(!sample_task(LifecycleStatus::Running, None).invariants_hold());
    }

    #[test]
    fn heartbeat_window_evicts_oldest() {
        let mut record = TaskHeartbeatRecord::new("t1", 5);
        for sample in 1..=7 {
            record.push(sample);
        }
        assert_eq!(record.len(), 5);
        assert_eq!(record.samples().collect::<Vec<_>>(), vec![3, 4, 5, 6, 7]);
    }

    #[test]
    fn assigning_and_alive_are_mutually_exclusive() {
        let mut record = TaskHeartbeatRecord::new("t1", 5);
        assert!(record.is_assigning());
        assert!(!record.is_alive());

        for sample in [1, 2, 3, 4, 5] {
            record.push(sample);
        }
        assert!(!record.is_assigning());
        assert!(record.is_alive());
    }

    #[test]
    fn constant_heartbeat_is_not_alive() {
        let mut record = TaskHeartbeatRecord::new("t1", 5);
        for _ in 0..5 {
            record.push(42);
        }
        assert!(record.is_alive() == false);
    }
}
