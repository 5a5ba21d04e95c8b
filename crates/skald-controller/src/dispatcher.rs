//! The dispatcher: assigns unassigned `Passive` tasks to the
//! least-loaded online node.
//!
//! The dispatcher never mutates a node's subprocess map or the controller's
//! node/task stores directly; it only reads a snapshot of the node store and
//! writes through the database and the bus. The node and task monitors
//! converge the resulting views on their own schedule.

use std::collections::HashMap;
use std::sync::Arc;

use skald_core::{
    AssignmentOrder, Bus, LifecycleStatus, ShutdownFlag, SkaldConfig, TaskRepository, Topic,
};

use crate::node_store::NodeStore;

pub struct Dispatcher<R, B> {
    repo: Arc<R>,
    bus: Arc<B>,
    nodes: Arc<NodeStore>,
    config: SkaldConfig,
    shutdown: ShutdownFlag,
}

impl<R: TaskRepository, B: Bus> Dispatcher<R, B> {
    pub fn new(repo: Arc<R>, bus: Arc<B>, nodes: Arc<NodeStore>, config: SkaldConfig) -> Self {
        Self {
            repo,
            bus,
            nodes,
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
        let span = tracing::info_span!("dispatcher");
        let _enter = span.enter();

        loop {
            if let Err(err) = self.tick().await {
                tracing::warn!(?err, "dispatcher tick failed, retrying next tick");
            }

            tokio::select! {
                _ = self.shutdown.wait() => break,
                _ = tokio::time::sleep(self.config.dispatcher_interval) => {}
            }
        }
    }

    /// One assignment pass, per the four steps below.
    async fn tick(&self) -> Result<(), skald_core::SkaldError> {
        let candidates = self.repo.find_unassigned_passive(AssignmentOrder).await?;
        if candidates.is_empty() {
            return Ok(());
        }

        let now_ms = skald_core::now_ms();
        let mut load: HashMap<String, usize> = self
            .nodes
            .snapshot()
            .into_iter()
            .filter(|node| node.is_assignment_target(now_ms, self.config.liveness_timeout.as_millis() as i64))
            .map(|node| (node.id, node.tasks.len()))
            .collect();

        if load.is_empty() {
            tracing::info!("no nodes available");
            return Ok(());
        }

        for mut task in candidates {
            let Some(target) = least_loaded(&load) else {
                break;
            };

            let updated = self
                .repo
                .set_executor(
                    &task.id,
                    &target,
                    LifecycleStatus::Created,
                    LifecycleStatus::Assigning,
                )
                .await?;

            if !updated {
                // Another agent already moved this task out of Created; skip it.
                continue;
            }

            task.executor = Some(target.clone());
            task.lifecycle_status = LifecycleStatus::Assigning;

            let body = serde_json::to_string(&task).map_err(skald_core::SkaldError::malformed)?;
            self.bus.produce(Topic::TaskAssign, &target, &body).await?;

            *load.get_mut(&target).expect("target came from load map") += 1;
        }

        Ok(())
    }
}

/// Chooses the minimum-load node, breaking ties by lexicographically
/// smallest id.
fn least_loaded(load: &HashMap<String, usize>) -> Option<String> {
    load.iter()
        .min_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)))
        .map(|(id, _)| id.clone())
}

#[cfg(test)]
mod tests {
    use serde_json::value::RawValue;
    use skald_core::testutil::{MemoryBus, MemoryTaskRepository};
    use skald_core::{BusConsumer, NodeMode, TaskMode};

    use super::*;

    fn task(id: &str, priority: u8) -> skald_core::Task {
        skald_core::Task {
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

    fn online_node(store: &NodeStore, id: &str) {
        store.upsert_last_seen(id, skald_core::now_ms());
        store.refresh(id, skald_core::now_ms(), Vec::new(), NodeMode::Node);
    }

    #[tokio::test]
    async fn balances_three_tasks_across_two_nodes() {
        let repo = Arc::new(MemoryTaskRepository::new());
        for id in ["t1", "t2", "t3"] {
            repo.insert(task(id, 0)).await.unwrap();
        }

        let bus = Arc::new(MemoryBus::new());
        let mut consumer = bus.subscribe(&[Topic::TaskAssign]).await.unwrap();

        let nodes = Arc::new(NodeStore::new());
        online_node(&nodes, "n1");
        online_node(&nodes, "n2");

        let dispatcher = Dispatcher::new(repo.clone(), bus, nodes, SkaldConfig::default());
        dispatcher.tick().await.unwrap();

        let t1 = repo.find_by_id("t1").await.unwrap().unwrap();
        let t2 = repo.find_by_id("t2").await.unwrap().unwrap();
        let t3 = repo.find_by_id("t3").await.unwrap().unwrap();
        assert_eq!(t1.executor.as_deref(), Some("n1"));
        assert_eq!(t2.executor.as_deref(), Some("n2"));
        assert_eq!(t3.executor.as_deref(), Some("n1"));
        assert!(matches!(t1.lifecycle_status, LifecycleStatus::Assigning));

        for _ in 0..3 {
            let msg = consumer.next().await.unwrap().expect("assignment message");
            let assigned: skald_core::Task = serde_json::from_str(&msg.value).unwrap();
            assert_eq!(assigned.source, "test");
            assert!(matches!(assigned.mode, TaskMode::Passive));
            assert!(matches!(assigned.lifecycle_status, LifecycleStatus::Assigning));
        }
    }

    #[tokio::test]
    async fn does_nothing_when_no_nodes_are_online() {
        let repo = Arc::new(MemoryTaskRepository::new());
        repo.insert(task("t1", 0)).await.unwrap();

        let bus = Arc::new(MemoryBus::new());
        let nodes = Arc::new(NodeStore::new());

        let dispatcher = Dispatcher::new(repo.clone(), bus, nodes, SkaldConfig::default());
        dispatcher.tick().await.unwrap();

        let t1 = repo.find_by_id("t1").await.unwrap().unwrap();
        assert!(t1.executor.is_none());
    }

    #[tokio::test]
    async fn higher_priority_tasks_are_assigned_first() {
        let repo = Arc::new(MemoryTaskRepository::new());
        repo.insert(task("low", 0)).await.unwrap();
        repo.insert(task("high", 10)).await.unwrap();

        let bus = Arc::new(MemoryBus::new());
        let nodes = Arc::new(NodeStore::new());
        online_node(&nodes, "n1");

        let dispatcher = Dispatcher::new(repo.clone(), bus, nodes, SkaldConfig::default());
        dispatcher.tick().await.unwrap();

        let high = repo.find_by_id("high").await.unwrap().unwrap();
        let low = repo.find_by_id("low").await.unwrap().unwrap();
        assert_eq!(high.executor.as_deref(), Some("n1"));
        assert_eq!(low.executor.as_deref(), Some("n1"));
    }
}
