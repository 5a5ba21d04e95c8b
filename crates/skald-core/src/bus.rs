//! The bus contract: partitioned topic produce/consume.
//!
//! Every control-plane handoff — assignment, cancellation, attachment
//! updates, the intra-task update fan-out — goes over a [`Bus`] rather than a
//! direct call, so the controller and node processes never talk to each
//! other.

use async_trait::async_trait;

use crate::error::SkaldError;

/// One of the well-known control topics named below.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Topic {
    /// Controller → node: assign a task. Key: target node id.
    TaskAssign,
    /// Controller or API → node: cancel a task. Key: task id.
    TaskCancel,
    /// Controller or API → node: replace a task's attachment blob. Key: task id.
    TaskUpdateAttachment,
    /// Node → its own subprocess: forward an attachment update. Key: task id.
    TaskWorkerUpdate,
    /// Loopback probe, ignored by logic.
    Testing,
}

impl Topic {
    /// The wire name used when creating/addressing the topic.
    pub fn as_str(self) -> &'static str {
        match self {
            Topic::TaskAssign => "task.assign",
            Topic::TaskCancel => "task.cancel",
            Topic::TaskUpdateAttachment => "task.update.attachment",
            Topic::TaskWorkerUpdate => "taskworker.update",
            Topic::Testing => "testing",
        }
    }

    /// Every well-known topic, for adapters that need to pre-create them.
    pub const ALL: [Topic; 5] = [
        Topic::TaskAssign,
        Topic::TaskCancel,
        Topic::TaskUpdateAttachment,
        Topic::TaskWorkerUpdate,
        Topic::Testing,
    ];

    /// Parse a wire name back into a [`Topic`], the inverse of [`Topic::as_str`].
    pub fn from_wire_name(name: &str) -> Option<Topic> {
        Topic::ALL.into_iter().find(|t| t.as_str() == name)
    }
}

/// A message read back off a [`BusConsumer`].
#[derive(Clone, Debug)]
pub struct BusMessage {
    pub topic: Topic,
    pub key: String,
    pub value: String,
}

/// A partitioned, key-ordered message bus.
///
/// Implementations partition by key hash (default 6 partitions, replication
/// factor 3), compress payloads, and use leader acks with a single in-flight
/// request per connection so that messages sharing a key are never observed
/// out of order.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn produce(&self, topic: Topic, key: &str, value: &str) -> Result<(), SkaldError>;

    /// Subscribe to one or more topics, returning a consumer handle. Multiple
    /// calls may return independent consumer groups; implementations
    /// document their own grouping semantics.
    async fn subscribe(&self, topics: &[Topic]) -> Result<Box<dyn BusConsumer>, SkaldError>;
}

/// A handle to an open subscription.
///
/// `next` is the only suspension point: it blocks until a message for one of
/// the subscribed topics is available, or returns `Ok(None)` once the
/// consumer has been closed by [`BusConsumer::close`].
#[async_trait]
pub trait BusConsumer: Send + Sync {
    async fn next(&mut self) -> Result<Option<BusMessage>, SkaldError>;

    async fn close(&mut self) -> Result<(), SkaldError>;
}

/// A conformance suite exercised against every concrete [`Bus`]
/// implementation, not gated behind `#[cfg(test)]` so adapter crates outside
/// this one can call it from their own (backend-requiring) integration
/// tests.
pub mod asserts {
    use super::*;

    /// Exercised against every concrete [`Bus`] implementation.
    pub async fn behaves_like_a_bus(bus: &dyn Bus) {
        let mut consumer = bus.subscribe(&[Topic::Testing]).await.unwrap();

        bus.produce(Topic::Testing, "k1", "v1").await.unwrap();
        let msg = consumer.next().await.unwrap().expect("message available");
        assert_eq!(msg.topic, Topic::Testing);
        assert_eq!(msg.key, "k1");
        assert_eq!(msg.value, "v1");

        consumer.close().await.unwrap();
        assert!(consumer.next().await.unwrap().is_none());
    }
}
