//! In-memory [`KvStore`], [`Bus`] and [`TaskRepository`] implementations used
//! by the controller/node unit tests in place of real redis/kafka/mongo
//! backends.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::bus::{Bus, BusConsumer, BusMessage, Topic};
use crate::db::{AssignmentOrder, TaskRepository};
use crate::error::SkaldError;
use crate::kv::KvStore;
use crate::model::{LifecycleStatus, Task, TaskMode};

/// A single process's worth of KV state, shared across clones.
#[derive(Clone, Default)]
pub struct MemoryKv {
    inner: Arc<Mutex<std::collections::HashMap<String, String>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, SkaldError> {
        Ok(self.inner.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), SkaldError> {
        self.inner.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), SkaldError> {
        self.inner.lock().remove(key);
        Ok(())
    }

    async fn hset(&self, hash: &str, field: &str, value: &str) -> Result<(), SkaldError> {
        self.inner
            .lock()
            .insert(format!("{hash}\0{field}"), value.to_string());
        Ok(())
    }

    async fn hgetall(&self, hash: &str) -> Result<Vec<(String, String)>, SkaldError> {
        let prefix = format!("{hash}\0");
        Ok(self
            .inner
            .lock()
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(&prefix)
                    .map(|field| (field.to_string(), v.clone()))
            })
            .collect())
    }

    async fn hdel(&self, hash: &str, field: &str) -> Result<(), SkaldError> {
        self.inner.lock().remove(&format!("{hash}\0{field}"));
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, SkaldError> {
        let mut inner = self.inner.lock();
        let to_remove: Vec<String> = inner
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        for key in &to_remove {
            inner.remove(key);
        }
        Ok(to_remove.len() as u64)
    }
}

/// An in-memory, in-process [`Bus`] backed by a `tokio::sync::broadcast`
/// channel per topic set. Every [`MemoryBus::subscribe`] call gets its own
/// receiver, so multiple consumers each see every message (fan-out), as a
/// real consumer-group bus would for distinct groups.
#[derive(Clone)]
pub struct MemoryBus {
    sender: broadcast::Sender<BusMessage>,
}

impl MemoryBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn produce(&self, topic: Topic, key: &str, value: &str) -> Result<(), SkaldError> {
        let _ = self.sender.send(BusMessage {
            topic,
            key: key.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    async fn subscribe(&self, topics: &[Topic]) -> Result<Box<dyn BusConsumer>, SkaldError> {
        Ok(Box::new(MemoryConsumer {
            topics: topics.to_vec(),
            receiver: self.sender.subscribe(),
            closed: false,
        }))
    }
}

struct MemoryConsumer {
    topics: Vec<Topic>,
    receiver: broadcast::Receiver<BusMessage>,
    closed: bool,
}

#[async_trait]
impl BusConsumer for MemoryConsumer {
    async fn next(&mut self) -> Result<Option<BusMessage>, SkaldError> {
        if self.closed {
            return Ok(None);
        }
        loop {
            match self.receiver.recv().await {
                Ok(msg) if self.topics.contains(&msg.topic) => return Ok(Some(msg)),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }

    async fn close(&mut self) -> Result<(), SkaldError> {
        self.closed = true;
        Ok(())
    }
}

/// An in-memory `tasks` collection.
#[derive(Clone, Default)]
pub struct MemoryTaskRepository {
    inner: Arc<Mutex<std::collections::HashMap<String, Task>>>,
}

impl MemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskRepository for MemoryTaskRepository {
    async fn find_by_id(&self, id: &str) -> Result<Option<Task>, SkaldError> {
        Ok(self.inner.lock().get(id).cloned())
    }

    async fn insert(&self, task: Task) -> Result<(), SkaldError> {
        self.inner.lock().insert(task.id.clone(), task);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), SkaldError> {
        self.inner.lock().remove(id);
        Ok(())
    }

    async fn find_by_status(&self, statuses: &[LifecycleStatus]) -> Result<Vec<Task>, SkaldError> {
        Ok(self
            .inner
            .lock()
            .values()
            .filter(|t| statuses.contains(&t.lifecycle_status))
            .cloned()
            .collect())
    }

    async fn find_unassigned_passive(
        &self,
        _order: AssignmentOrder,
    ) -> Result<Vec<Task>, SkaldError> {
        let mut tasks: Vec<Task> = self
            .inner
            .lock()
            .values()
            .filter(|t| {
                t.executor.is_none()
                    && t.lifecycle_status == LifecycleStatus::Created
                    && t.mode == TaskMode::Passive
            })
            .cloned()
            .collect();
        tasks.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.create_date_time.cmp(&b.create_date_time))
        });
        Ok(tasks)
    }

    async fn update_status_if(
        &self,
        id: &str,
        expected: LifecycleStatus,
        new: LifecycleStatus,
    ) -> Result<bool, SkaldError> {
        let mut inner = self.inner.lock();
        match inner.get_mut(id) {
            Some(task) if task.lifecycle_status == expected => {
                task.lifecycle_status = new;
                task.update_date_time = chrono::Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_executor(
        &self,
        id: &str,
        executor: &str,
        expected: LifecycleStatus,
        new: LifecycleStatus,
    ) -> Result<bool, SkaldError> {
        let mut inner = self.inner.lock();
        match inner.get_mut(id) {
            Some(task) if task.lifecycle_status == expected => {
                task.executor = Some(executor.to_string());
                task.lifecycle_status = new;
                task.update_date_time = chrono::Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_kv_behaves_like_a_kv_store() {
        crate::kv::asserts::behaves_like_a_kv_store(&MemoryKv::new()).await;
    }

    #[tokio::test]
    async fn memory_bus_behaves_like_a_bus() {
        crate::bus::asserts::behaves_like_a_bus(&MemoryBus::new()).await;
    }

    #[tokio::test]
    async fn memory_repository_behaves_like_a_task_repository() {
        crate::db::asserts::behaves_like_a_task_repository(&MemoryTaskRepository::new()).await;
    }

    #[tokio::test]
    async fn bus_fans_out_to_every_subscriber() {
        let bus = MemoryBus::new();
        let mut a = bus.subscribe(&[Topic::TaskCancel]).await.unwrap();
        let mut b = bus.subscribe(&[Topic::TaskCancel]).await.unwrap();

        bus.produce(Topic::TaskCancel, "t1", "{}").await.unwrap();

        assert_eq!(a.next().await.unwrap().unwrap().key, "t1");
        assert_eq!(b.next().await.unwrap().unwrap().key, "t1");
    }
}
