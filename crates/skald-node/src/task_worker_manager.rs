//! The task worker manager: consumes the BUS control topics, spawns,
//! cancels and updates task subprocesses, and syncs the node's live task
//! list back to KV.
//!
//! Messages on `task.assign` are keyed by the target node id; every other
//! control topic is keyed by task id. A node must subscribe with a consumer
//! group unique to itself (not shared with other nodes) so it observes every
//! message and filters by key itself, since the bus has no concept of a
//! "this node's mailbox" topic of its own.

use std::sync::Arc;
use std::time::Duration;

use serde_json::value::RawValue;
use skald_core::{
    Bus, BusConsumer, ErrorKind, KvStore, LifecycleStatus, NodeTaskSummary, ShutdownFlag, SkaldConfig,
    SkaldError, Task, TaskMode, TaskRepository, Topic, UpdateTaskWorkerEvent,
};

use crate::node_store::{NodeStore, SubprocessHandle};
use crate::registry::WorkerRegistry;

/// A task this node self-instantiates from local configuration at startup,
/// rather than receiving from the dispatcher.
#[derive(Clone, Debug)]
pub struct LocalTaskSpec {
    pub id: String,
    pub class_name: String,
    pub priority: u8,
    pub attachments: Box<RawValue>,
}

pub struct TaskWorkerManager<K, B, R> {
    kv: Arc<K>,
    bus: Arc<B>,
    repo: Arc<R>,
    store: Arc<NodeStore>,
    registry: Arc<WorkerRegistry>,
    node_id: String,
    config: SkaldConfig,
    shutdown: ShutdownFlag,
}

impl<K, B, R> TaskWorkerManager<K, B, R>
where
    K: KvStore,
    B: Bus,
    R: TaskRepository,
{
    pub fn new(
        kv: Arc<K>,
        bus: Arc<B>,
        repo: Arc<R>,
        store: Arc<NodeStore>,
        registry: Arc<WorkerRegistry>,
        node_id: impl Into<String>,
        config: SkaldConfig,
    ) -> Self {
        Self {
            kv,
            bus,
            repo,
            store,
            registry,
            node_id: node_id.into(),
            config,
            shutdown: ShutdownFlag::new(),
        }
    }

    pub fn shutdown_flag(&self) -> ShutdownFlag {
        self.shutdown.clone()
    }

    pub fn node_store(&self) -> Arc<NodeStore> {
        Arc::clone(&self.store)
    }

    pub fn stop(&self) {
        self.shutdown.raise();
    }

    /// Adopt this node's locally-declared Active tasks: reuse an
    /// existing DB record's attachments if one exists, else insert a fresh
    /// one owned by this node, then spawn its subprocess. A single bad spec
    /// is logged and skipped rather than aborting the rest.
    pub async fn adopt_active_tasks(&self, specs: &[LocalTaskSpec]) -> Result<(), SkaldError> {
        for spec in specs {
            let attachments = match self.repo.find_by_id(&spec.id).await? {
                Some(existing) => existing.attachments,
                None => {
                    let now = chrono::Utc::now();
                    let task = Task {
                        id: spec.id.clone(),
                        class_name: spec.class_name.clone(),
                        source: "local".to_string(),
                        name: None,
                        description: None,
                        executor: Some(self.node_id.clone()),
                        mode: TaskMode::Active,
                        create_date_time: now,
                        update_date_time: now,
                        deadline_date_time: None,
                        lifecycle_status: LifecycleStatus::Running,
                        priority: spec.priority,
                        attachments: spec.attachments.clone(),
                    };
                    let attachments = task.attachments.clone();
                    self.repo.insert(task).await?;
                    attachments
                }
            };

            if let Err(err) = self.spawn_worker(&spec.id, &spec.class_name, &attachments) {
                tracing::warn!(?err, task = %spec.id, "failed to adopt active task");
            }
        }
        Ok(())
    }

    /// Run the control-topic consume loop and the KV sync loop until
    /// `stop()` is called.
    pub async fn run(&self) {
        let span = tracing::info_span!("task_worker_manager", node = %self.node_id);
        let _enter = span.enter();

        let mut consumer = match self
            .bus
            .subscribe(&[Topic::TaskAssign, Topic::TaskCancel, Topic::TaskUpdateAttachment])
            .await
        {
            Ok(consumer) => consumer,
            Err(err) => {
                tracing::error!(?err, "failed to subscribe to control topics, task worker manager exiting");
                return;
            }
        };

        let mut sync_interval = tokio::time::interval(self.config.kv_sync_period);
        sync_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.wait() => break,
                _ = sync_interval.tick() => {
                    if let Err(err) = self.sync_to_kv().await {
                        tracing::warn!(?err, "kv sync tick failed, retrying next tick");
                    }
                }
                message = consumer.next() => {
                    match message {
                        Ok(Some(msg)) => {
                            if let Err(err) = self.dispatch(msg).await {
                                tracing::warn!(?err, "control message handling failed");
                            }
                        }
                        Ok(None) => break,
                        Err(err) => tracing::warn!(?err, "bus consumer error, continuing"),
                    }
                }
            }
        }

        let _ = consumer.close().await;
    }

    async fn dispatch(&self, msg: skald_core::BusMessage) -> Result<(), SkaldError> {
        match msg.topic {
            Topic::TaskAssign => self.handle_assign(&msg.value).await,
            Topic::TaskCancel => self.handle_cancel(&msg.key).await,
            Topic::TaskUpdateAttachment => self.handle_update_attachment(&msg).await,
            Topic::TaskWorkerUpdate | Topic::Testing => Ok(()),
        }
    }

    /// `assign` handling: reject unknown classes, wrong executors and
    /// re-assignments of a task already running here (resetting its KV state
    /// instead); otherwise spawn and register it in the node's subprocess map.
    async fn handle_assign(&self, value: &str) -> Result<(), SkaldError> {
        let payload: Task = serde_json::from_str(value).map_err(SkaldError::malformed)?;

        if payload.executor.as_deref() != Some(self.node_id.as_str()) {
            return Ok(());
        }

        if self.store.contains(&payload.id) {
            tracing::info!(task = %payload.id, "duplicate assignment, resetting heartbeat state");
            self.kv
                .set(&format!("task:{}:heartbeat", payload.id), &skald_core::now_ms().to_string())
                .await?;
            self.kv.delete(&format!("task:{}:exception", payload.id)).await?;
            return Ok(());
        }

        if let Err(err) = self.spawn_worker(&payload.id, &payload.class_name, &payload.attachments) {
            tracing::warn!(?err, task = %payload.id, class_name = %payload.class_name, "rejecting assignment");
            return Ok(());
        }

        tracing::info!(task = %payload.id, class_name = %payload.class_name, "spawned task subprocess");
        Ok(())
    }

    /// `cancel` handling: graceful-stop (SIGTERM, then a bounded wait,
    /// then SIGKILL) and drop it from the node's subprocess map.
    async fn handle_cancel(&self, task_id: &str) -> Result<(), SkaldError> {
        let Some(mut handle) = self.store.remove(task_id) else {
            return Ok(());
        };
        graceful_stop(&mut handle.child, self.config.graceful_kill_ms).await;
        Ok(())
    }

    /// `update.attachment` handling: republish on the intra-task
    /// `taskworker.update` topic, carrying the new attachment blob.
    async fn handle_update_attachment(&self, msg: &skald_core::BusMessage) -> Result<(), SkaldError> {
        if !self.store.contains(&msg.key) {
            return Ok(());
        }

        let attachments = RawValue::from_string(msg.value.clone()).map_err(SkaldError::malformed)?;
        let event = UpdateTaskWorkerEvent {
            task_id: msg.key.clone(),
            attachments,
        };
        let body = serde_json::to_string(&event).map_err(SkaldError::malformed)?;
        self.bus.produce(Topic::TaskWorkerUpdate, &msg.key, &body).await
    }

    fn spawn_worker(&self, task_id: &str, class_name: &str, attachments: &RawValue) -> Result<(), SkaldError> {
        let Some(spec) = self.registry.get(class_name) else {
            return Err(SkaldError::policy(format!("no worker registered for className {class_name}")));
        };

        let resource_id = attachment_str(attachments, &self.config.resource_id_key);
        let child = spec.spawn(task_id, attachments)?;
        self.store.insert(
            task_id,
            SubprocessHandle {
                child,
                class_name: class_name.to_string(),
                resource_id,
                launched_at_ms: skald_core::now_ms(),
            },
        );
        Ok(())
    }

    /// Reap anything that exited on its own, then republish the live task
    /// list to `node:{id}:all-task`.
    async fn sync_to_kv(&self) -> Result<(), SkaldError> {
        self.store.reap_exited();
        let tasks = self.store.summaries();
        let doc = AllTaskDoc {
            existed_task_ids: tasks.iter().map(|t| t.id.clone()).collect(),
            tasks,
            timestamp: skald_core::now_ms(),
        };
        let body = serde_json::to_string(&doc).map_err(SkaldError::malformed)?;
        self.kv.set(&format!("node:{}:all-task", self.node_id), &body).await
    }
}

fn attachment_str(attachments: &RawValue, key: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(attachments.get()).ok()?;
    value.get(key)?.as_str().map(str::to_owned)
}

#[cfg(unix)]
async fn graceful_stop(child: &mut tokio::process::Child, timeout: Duration) {
    if let Some(pid) = child.id() {
        unsafe { libc::kill(pid as i32, libc::SIGTERM) };
    }

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        if let Ok(Some(_status)) = child.try_wait() {
            return;
        }

        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }
    }

    tracing::warn!("task subprocess did not exit gracefully, force-killing");
    let _ = child.start_kill();
}

#[cfg(not(unix))]
async fn graceful_stop(child: &mut tokio::process::Child, _timeout: Duration) {
    let _ = child.start_kill();
}

/// The `node:{id}:all-task` KV document, matching the shape the controller's
/// node monitor decodes.
#[derive(serde::Serialize)]
struct AllTaskDoc {
    tasks: Vec<NodeTaskSummary>,
    #[serde(rename = "existedTaskIds")]
    existed_task_ids: Vec<String>,
    timestamp: i64,
}

#[cfg(test)]
mod tests {
    use skald_core::testutil::{MemoryBus, MemoryKv, MemoryTaskRepository};

    use super::*;
    use crate::registry::WorkerSpec;

    fn manager(
        registry: WorkerRegistry,
    ) -> (
        TaskWorkerManager<MemoryKv, MemoryBus, MemoryTaskRepository>,
        Arc<MemoryKv>,
        Arc<MemoryBus>,
        Arc<MemoryTaskRepository>,
        Arc<NodeStore>,
    ) {
        let kv = Arc::new(MemoryKv::new());
        let bus = Arc::new(MemoryBus::new());
        let repo = Arc::new(MemoryTaskRepository::new());
        let store = Arc::new(NodeStore::new());
        let manager = TaskWorkerManager::new(
            Arc::clone(&kv),
            Arc::clone(&bus),
            Arc::clone(&repo),
            Arc::clone(&store),
            Arc::new(registry),
            "n1",
            SkaldConfig::default(),
        );
        (manager, kv, bus, repo, store)
    }

    fn assign_payload(task_id: &str, class_name: &str, executor: &str) -> String {
        serde_json::json!({
            "id": task_id,
            "className": class_name,
            "source": "test",
            "executor": executor,
            "mode": "passive",
            "createDateTime": chrono::Utc::now(),
            "updateDateTime": chrono::Utc::now(),
            "lifecycleStatus": "Assigning",
            "priority": 0,
            "attachments": {},
        })
        .to_string()
    }

    #[tokio::test]
    async fn assign_for_this_node_spawns_and_registers() {
        let (manager, ..) = manager(WorkerRegistry::new().register("Camera", WorkerSpec::new("true")));
        manager
            .handle_assign(&assign_payload("t1", "Camera", "n1"))
            .await
            .unwrap();
        assert!(manager.store.contains("t1"));
    }

    #[tokio::test]
    async fn assign_for_another_node_is_ignored() {
        let (manager, ..) = manager(WorkerRegistry::new().register("Camera", WorkerSpec::new("true")));
        manager
            .handle_assign(&assign_payload("t1", "Camera", "n2"))
            .await
            .unwrap();
        assert!(!manager.store.contains("t1"));
    }

    #[tokio::test]
    async fn assign_of_unregistered_class_is_rejected() {
        let (manager, ..) = manager(WorkerRegistry::new());
        manager
            .handle_assign(&assign_payload("t1", "Unknown", "n1"))
            .await
            .unwrap();
        assert!(!manager.store.contains("t1"));
    }

    #[tokio::test]
    async fn duplicate_assign_resets_heartbeat_instead_of_respawning() {
        let (manager, kv, ..) = manager(WorkerRegistry::new().register("Camera", WorkerSpec::new("true")));
        manager
            .handle_assign(&assign_payload("t1", "Camera", "n1"))
            .await
            .unwrap();

        kv.set("task:t1:heartbeat", "123").await.unwrap();
        kv.set("task:t1:exception", "boom").await.unwrap();

        manager
            .handle_assign(&assign_payload("t1", "Camera", "n1"))
            .await
            .unwrap();

        let heartbeat: i64 = kv.get("task:t1:heartbeat").await.unwrap().unwrap().parse().unwrap();
        assert!(heartbeat != 123);
        assert!(kv.get("task:t1:exception").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_removes_from_store() {
        let (manager, ..) = manager(WorkerRegistry::new().register("Camera", WorkerSpec::new("sleep").with_arg("5")));
        manager
            .handle_assign(&assign_payload("t1", "Camera", "n1"))
            .await
            .unwrap();
        assert!(manager.store.contains("t1"));

        manager.handle_cancel("t1").await.unwrap();
        assert!(!manager.store.contains("t1"));
    }

    #[tokio::test]
    async fn cancel_of_unknown_task_is_a_no_op() {
        let (manager, ..) = manager(WorkerRegistry::new());
        manager.handle_cancel("missing").await.unwrap();
    }

    #[tokio::test]
    async fn update_attachment_republishes_for_tracked_task() {
        let (manager, _kv, bus, ..) = manager(WorkerRegistry::new().register("Camera", WorkerSpec::new("true")));
        manager
            .handle_assign(&assign_payload("t1", "Camera", "n1"))
            .await
            .unwrap();

        let mut consumer = bus.subscribe(&[Topic::TaskWorkerUpdate]).await.unwrap();
        manager
            .handle_update_attachment(&skald_core::BusMessage {
                topic: Topic::TaskUpdateAttachment,
                key: "t1".to_string(),
                value: r#"{"resourceId":"cam-2"}"#.to_string(),
            })
            .await
            .unwrap();

        let msg = consumer.next().await.unwrap().expect("republished update");
        assert_eq!(msg.key, "t1");
        assert!(msg.value.contains("cam-2"));
    }

    #[tokio::test]
    async fn update_attachment_for_untracked_task_is_ignored() {
        let (manager, _kv, bus, ..) = manager(WorkerRegistry::new());
        let mut consumer = bus.subscribe(&[Topic::TaskWorkerUpdate]).await.unwrap();
        manager
            .handle_update_attachment(&skald_core::BusMessage {
                topic: Topic::TaskUpdateAttachment,
                key: "missing".to_string(),
                value: "{}".to_string(),
            })
            .await
            .unwrap();

        bus.produce(Topic::TaskWorkerUpdate, "probe", "x").await.unwrap();
        let msg = consumer.next().await.unwrap().unwrap();
        assert_eq!(msg.key, "probe", "no republish should have been queued ahead of the probe");
    }

    #[tokio::test]
    async fn adopt_active_tasks_inserts_and_spawns() {
        let (manager, _kv, _bus, repo, _store) =
            manager(WorkerRegistry::new().register("Camera", WorkerSpec::new("true")));

        let specs = vec![LocalTaskSpec {
            id: "local-1".to_string(),
            class_name: "Camera".to_string(),
            priority: 5,
            attachments: RawValue::from_string(r#"{"resourceId":"cam-9"}"#.to_string()).unwrap(),
        }];

        manager.adopt_active_tasks(&specs).await.unwrap();

        let task = repo.find_by_id("local-1").await.unwrap().expect("task inserted");
        assert!(matches!(task.mode, TaskMode::Active));
        assert!(matches!(task.lifecycle_status, LifecycleStatus::Running));
        assert_eq!(task.executor.as_deref(), Some("n1"));
        assert!(manager.store.contains("local-1"));
        assert_eq!(manager.store.find_by_resource_id("cam-9").as_deref(), Some("local-1"));
    }

    #[tokio::test]
    async fn adopt_active_tasks_reuses_existing_db_record() {
        let (manager, _kv, _bus, repo, _store) =
            manager(WorkerRegistry::new().register("Camera", WorkerSpec::new("true")));

        let mut existing = skald_core::Task {
            id: "local-1".to_string(),
            class_name: "Camera".to_string(),
            source: "local".to_string(),
            name: None,
            description: None,
            executor: Some("n1".to_string()),
            mode: TaskMode::Active,
            create_date_time: chrono::Utc::now(),
            update_date_time: chrono::Utc::now(),
            deadline_date_time: None,
            lifecycle_status: LifecycleStatus::Running,
            priority: 3,
            attachments: RawValue::from_string(r#"{"resourceId":"cam-old"}"#.to_string()).unwrap(),
        };
        repo.insert(existing.clone()).await.unwrap();
        existing.attachments = RawValue::from_string(r#"{"resourceId":"cam-old"}"#.to_string()).unwrap();

        let specs = vec![LocalTaskSpec {
            id: "local-1".to_string(),
            class_name: "Camera".to_string(),
            priority: 5,
            attachments: RawValue::from_string(r#"{"resourceId":"cam-new"}"#.to_string()).unwrap(),
        }];

        manager.adopt_active_tasks(&specs).await.unwrap();

        assert_eq!(
            manager.store.find_by_resource_id("cam-old").as_deref(),
            Some("local-1"),
            "spawned subprocess should use the existing DB record's attachments, not the local spec's"
        );
    }

    #[test]
    fn only_transient_errors_are_not_surfaced_here() {
        // sanity: SkaldError::policy used for unregistered classes is never retryable.
        let err = SkaldError::policy("no worker registered for className X");
        assert_eq!(err.kind(), ErrorKind::PolicyRejection);
    }
}
