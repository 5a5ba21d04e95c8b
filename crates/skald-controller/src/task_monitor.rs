//! The task monitor: periodic reconciliation of DB tasks in
//! `{Assigning, Running}` into the controller's [`TaskStore`], driving
//! lifecycle transitions.

use std::sync::Arc;

use skald_core::{Bus, LifecycleStatus, ShutdownFlag, SkaldConfig, TaskRepository, Topic};

use crate::task_store::{Classification, TaskStore};

const MONITORED_STATUSES: &[LifecycleStatus] = &[LifecycleStatus::Assigning, LifecycleStatus::Running];

pub struct TaskMonitor<R, K, B> {
    repo: Arc<R>,
    kv: Arc<K>,
    bus: Arc<B>,
    store: Arc<TaskStore>,
    config: SkaldConfig,
    shutdown: ShutdownFlag,
}

impl<R: TaskRepository, K: skald_core::KvStore, B: Bus> TaskMonitor<R, K, B> {
    pub fn new(repo: Arc<R>, kv: Arc<K>, bus: Arc<B>, store: Arc<TaskStore>, config: SkaldConfig) -> Self {
        Self {
            repo,
            kv,
            bus,
            store,
            config,
            shutdown: ShutdownFlag::new(),
        }
    }

    pub fn shutdown_flag(&self) -> ShutdownFlag {
        self.shutdown.clone()
    }

    pub async fn stop(&self) {
        self.shutdown.raise();
    }

    pub async fn run(&self) {
        let span = tracing::info_span!("task_monitor");
        let _enter = span.enter();

        loop {
            if let Err(err) = self.tick().await {
                tracing::warn!(?err, "task monitor tick failed, retrying next tick");
            }

            tokio::select! {
                _ = self.shutdown.wait() => break,
                _ = tokio::time::sleep(self.config.monitor_task_interval) => {}
            }
        }
    }

    /// One reconciliation pass, per the four steps below.
    async fn tick(&self) -> Result<(), skald_core::SkaldError> {
        let monitored = self.repo.find_by_status(MONITORED_STATUSES).await?;
        let monitored_ids: std::collections::HashSet<String> =
            monitored.iter().map(|t| t.id.clone()).collect();

        for id in &monitored_ids {
            self.store.ensure(id);
        }

        // Orphans: tracked last tick, no longer reported by DB this tick.
        for id in self.store.ids() {
            if !monitored_ids.contains(&id) {
                self.cancel_and_drop(&id).await?;
            }
        }

        for task in &monitored {
            let sample = self
                .kv
                .get(&format!("task:{}:heartbeat", task.id))
                .await?
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(0);
            self.store.push_heartbeat(&task.id, sample);

            let error_message = non_empty(self.kv.get(&format!("task:{}:has-error", task.id)).await?);
            let exception_message = non_empty(self.kv.get(&format!("task:{}:exception", task.id)).await?);
            self.store.set_messages(&task.id, error_message, exception_message);

            let Some(classification) = self.store.classify(&task.id) else {
                continue;
            };

            match classification {
                Classification::Succeeded => self.finalize(task, LifecycleStatus::Finished).await?,
                Classification::Cancelled => self.finalize(task, LifecycleStatus::Cancelled).await?,
                Classification::Failed => {
                    self.finalize(task, LifecycleStatus::Failed).await?;
                    self.publish_cancel(&task.id).await?;
                }
                Classification::Assigning => self.progress(task, LifecycleStatus::Assigning).await?,
                Classification::Running => self.progress(task, LifecycleStatus::Running).await?,
            }
        }

        Ok(())
    }

    async fn finalize(&self, task: &skald_core::Task, target: LifecycleStatus) -> Result<(), skald_core::SkaldError> {
        self.progress(task, target).await?;
        self.store.remove(&task.id);
        Ok(())
    }

    /// Conditional write: skip if the persisted status already matches, to
    /// minimise writes and avoid clobbering a status another agent already
    /// advanced.
    async fn progress(&self, task: &skald_core::Task, target: LifecycleStatus) -> Result<(), skald_core::SkaldError> {
        if task.lifecycle_status == target {
            return Ok(());
        }
        self.repo.update_status_if(&task.id, task.lifecycle_status, target).await?;
        Ok(())
    }

    async fn cancel_and_drop(&self, id: &str) -> Result<(), skald_core::SkaldError> {
        self.publish_cancel(id).await?;
        self.store.remove(id);
        Ok(())
    }

    async fn publish_cancel(&self, task_id: &str) -> Result<(), skald_core::SkaldError> {
        let payload = CancelPayload {
            task_id,
            action: "cancel",
            ts: skald_core::now_ms(),
        };
        let body = serde_json::to_string(&payload).map_err(skald_core::SkaldError::malformed)?;
        self.bus.produce(Topic::TaskCancel, task_id, &body).await
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

#[derive(serde::Serialize)]
struct CancelPayload<'a> {
    #[serde(rename = "taskId")]
    task_id: &'a str,
    action: &'a str,
    ts: i64,
}

#[cfg(test)]
mod tests {
    use serde_json::value::RawValue;
    use skald_core::testutil::{MemoryBus, MemoryKv, MemoryTaskRepository};
    use skald_core::{BusConsumer, HeartbeatSentinel, TaskMode};

    use super::*;

    fn running_task(id: &str) -> skald_core::Task {
        skald_core::Task {
            id: id.to_string(),
            class_name: "W".into(),
            source: "test".into(),
            name: None,
            description: None,
            executor: Some("n1".into()),
            mode: TaskMode::Passive,
            create_date_time: chrono::Utc::now(),
            update_date_time: chrono::Utc::now(),
            deadline_date_time: None,
            lifecycle_status: LifecycleStatus::Assigning,
            priority: 0,
            attachments: RawValue::from_string("{}".into()).unwrap(),
        }
    }

    fn monitor(
        repo: Arc<MemoryTaskRepository>,
        kv: Arc<MemoryKv>,
        bus: Arc<MemoryBus>,
    ) -> TaskMonitor<MemoryTaskRepository, MemoryKv, MemoryBus> {
        TaskMonitor::new(repo, kv, bus, Arc::new(TaskStore::new(5)), SkaldConfig::default())
    }

    #[tokio::test]
    async fn window_fills_then_task_goes_running() {
        let repo = Arc::new(MemoryTaskRepository::new());
        repo.insert(running_task("t1")).await.unwrap();
        let kv = Arc::new(MemoryKv::new());
        let bus = Arc::new(MemoryBus::new());
        let monitor = monitor(repo.clone(), kv.clone(), bus);

        for ts in 1..=5 {
            kv.set("task:t1:heartbeat", &ts.to_string()).await.unwrap();
            monitor.tick().await.unwrap();
        }

        let task = repo.find_by_id("t1").await.unwrap().unwrap();
        assert!(matches!(task.lifecycle_status, LifecycleStatus::Running));
    }

    #[tokio::test]
    async fn success_sentinel_finishes_the_task() {
        let repo = Arc::new(MemoryTaskRepository::new());
        repo.insert(running_task("t1")).await.unwrap();
        let kv = Arc::new(MemoryKv::new());
        kv.set("task:t1:heartbeat", &HeartbeatSentinel::Success.as_value().to_string())
            .await
            .unwrap();
        let bus = Arc::new(MemoryBus::new());
        let monitor = monitor(repo.clone(), kv, bus);

        monitor.tick().await.unwrap();

        let task = repo.find_by_id("t1").await.unwrap().unwrap();
        assert!(matches!(task.lifecycle_status, LifecycleStatus::Finished));
        assert!(!monitor.store.contains("t1"));
    }

    #[tokio::test]
    async fn failed_sentinel_publishes_cancel_and_fails_the_task() {
        let repo = Arc::new(MemoryTaskRepository::new());
        repo.insert(running_task("t1")).await.unwrap();
        let kv = Arc::new(MemoryKv::new());
        kv.set("task:t1:heartbeat", &HeartbeatSentinel::Failed.as_value().to_string())
            .await
            .unwrap();
        let bus = Arc::new(MemoryBus::new());
        let mut consumer = bus.subscribe(&[Topic::TaskCancel]).await.unwrap();
        let monitor = monitor(repo.clone(), kv, bus);

        monitor.tick().await.unwrap();

        let task = repo.find_by_id("t1").await.unwrap().unwrap();
        assert!(matches!(task.lifecycle_status, LifecycleStatus::Failed));
        let msg = consumer.next().await.unwrap().expect("cancel published");
        assert_eq!(msg.key, "t1");
    }

    #[tokio::test]
    async fn orphaned_task_is_cancelled() {
        let repo = Arc::new(MemoryTaskRepository::new());
        repo.insert(running_task("t1")).await.unwrap();
        let kv = Arc::new(MemoryKv::new());
        let bus = Arc::new(MemoryBus::new());
        let mut consumer = bus.subscribe(&[Topic::TaskCancel]).await.unwrap();
        let monitor = monitor(repo.clone(), kv, bus);

        monitor.tick().await.unwrap();
        assert!(monitor.store.contains("t1"));

        repo.delete("t1").await.unwrap();
        monitor.tick().await.unwrap();

        assert!(!monitor.store.contains("t1"));
        let msg = consumer.next().await.unwrap().expect("cancel published");
        assert_eq!(msg.key, "t1");
    }

    #[tokio::test]
    async fn conditional_write_skips_when_status_already_matches() {
        let repo = Arc::new(MemoryTaskRepository::new());
        let mut task = running_task("t1");
        task.lifecycle_status = LifecycleStatus::Running;
        repo.insert(task).await.unwrap();
        let kv = Arc::new(MemoryKv::new());
        let bus = Arc::new(MemoryBus::new());
        let monitor = monitor(repo.clone(), kv.clone(), bus);

        for sample in [1, 2, 3, 4, 5] {
            kv.set("task:t1:heartbeat", &sample.to_string()).await.unwrap();
        }
        monitor.tick().await.unwrap();

        let task = repo.find_by_id("t1").await.unwrap().unwrap();
        assert!(matches!(task.lifecycle_status, LifecycleStatus::Running));
    }
}
