//! The database contract: task document CRUD against the `tasks` collection.
//! The database is the durable source of truth for [`crate::Task`]; the
//! key/value store is only a lossy liveness/membership projection.

use async_trait::async_trait;

use crate::error::SkaldError;
use crate::model::{LifecycleStatus, Task};

/// Sort order for [`TaskRepository::find_unassigned_passive`]: priority
/// descending, then creation time ascending, matching the dispatcher's
/// assignment order.
#[derive(Copy, Clone, Debug, Default)]
pub struct AssignmentOrder;

/// The `tasks` collection contract.
///
/// Implementations must maintain a unique index on `id` and a compound index
/// on `(executor, lifecycleStatus)` to keep the monitor/dispatcher queries
/// cheap.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<Task>, SkaldError>;

    async fn insert(&self, task: Task) -> Result<(), SkaldError>;

    async fn delete(&self, id: &str) -> Result<(), SkaldError>;

    /// Tasks currently in one of `statuses`, in no particular order.
    async fn find_by_status(&self, statuses: &[LifecycleStatus]) -> Result<Vec<Task>, SkaldError>;

    /// Tasks eligible for dispatch: `executor is null`, `lifecycleStatus =
    /// Created`, `mode = Passive`, ordered by `(priority DESC,
    /// createDateTime ASC)`.
    async fn find_unassigned_passive(
        &self,
        _order: AssignmentOrder,
    ) -> Result<Vec<Task>, SkaldError>;

    /// Atomically set `lifecycleStatus = new` iff the persisted status is
    /// currently `expected`; returns whether the write happened. This is the
    /// conditional-write primitive that lets two writers race without either
    /// clobbering a status the other already advanced.
    async fn update_status_if(
        &self,
        id: &str,
        expected: LifecycleStatus,
        new: LifecycleStatus,
    ) -> Result<bool, SkaldError>;

    /// Set `executor` and `lifecycleStatus` together, conditional on the
    /// current status equalling `expected`. Used by the dispatcher when it
    /// assigns a task to a node.
    async fn set_executor(
        &self,
        id: &str,
        executor: &str,
        expected: LifecycleStatus,
        new: LifecycleStatus,
    ) -> Result<bool, SkaldError>;
}

/// A conformance suite exercised against every concrete [`TaskRepository`]
/// implementation, not gated behind `#[cfg(test)]` so adapter crates outside
/// this one can call it from their own (backend-requiring) integration
/// tests.
pub mod asserts {
    use serde_json::value::RawValue;

    use super::*;
    use crate::model::TaskMode;

    fn sample(id: &str, priority: u8) -> Task {
        Task {
            id: id.to_string(),
            class_name: "W".into(),
            source: "test".into(),
            name: None,
            description: None,
            executor: None,
            mode: TaskMode::Passive,
            create_date_time: chrono::Utc::now(),
            update_date_time: chrono::Utc::now(),
            deadline_date_time: None,
            lifecycle_status: LifecycleStatus::Created,
            priority,
            attachments: RawValue::from_string("{}".into()).unwrap(),
        }
    }

    /// Exercised against every concrete [`TaskRepository`] implementation.
    pub async fn behaves_like_a_task_repository(repo: &dyn TaskRepository) {
        repo.insert(sample("t1", 0)).await.unwrap();
        assert!(repo.find_by_id("t1").await.unwrap().is_some());
        assert!(repo.find_by_id("missing").await.unwrap().is_none());

        let ok = repo
            .update_status_if("t1", LifecycleStatus::Created, LifecycleStatus::Assigning)
            .await
            .unwrap();
        assert!(ok);
        let stale = repo
            .update_status_if("t1", LifecycleStatus::Created, LifecycleStatus::Running)
            .await
            .unwrap();
        assert!(!stale, "conditional write must not clobber a changed status");

        let set = repo
            .set_executor("t1", "n1", LifecycleStatus::Assigning, LifecycleStatus::Running)
            .await
            .unwrap();
        assert!(set);
        let task = repo.find_by_id("t1").await.unwrap().unwrap();
        assert_eq!(task.executor.as_deref(), Some("n1"));
        assert!(matches!(task.lifecycle_status, LifecycleStatus::Running));

        repo.delete("t1").await.unwrap();
        assert!(repo.find_by_id("t1").await.unwrap().is_none());
    }
}
