//! A [`skald_core::Bus`] adapter over a partitioned log client:
//! producer with gzip compression and `acks=1` (leader), one in-flight
//! request per connection to preserve per-key ordering; consumer groups for
//! the control topics.

use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{ClientConfig, Message};
use skald_core::{Bus, BusConsumer, BusMessage, ErrorKind, SkaldConfig, SkaldError, Topic};

pub struct KafkaBus {
    brokers: String,
    group_id: String,
    producer: FutureProducer,
    config: SkaldConfig,
}

impl KafkaBus {
    pub fn connect(brokers: &str, group_id: &str, config: &SkaldConfig) -> Result<Self, SkaldError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("compression.type", "gzip")
            .set("acks", "1")
            .set("max.in.flight.requests.per.connection", "1")
            .create()
            .map_err(|err| SkaldError::new(ErrorKind::FatalResourceLoss, err))?;

        Ok(Self {
            brokers: brokers.to_string(),
            group_id: group_id.to_string(),
            producer,
            config: config.clone(),
        })
    }

    /// Idempotently create every well-known control topic with the
    /// partition count and replication factor named below. Safe to call on
    /// every startup; a "topic already exists" error from the broker is not
    /// fatal.
    pub async fn ensure_control_topics(&self) -> Result<(), SkaldError> {
        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .create()
            .map_err(|err| SkaldError::new(ErrorKind::FatalResourceLoss, err))?;

        let replication = self.config.bus_replication_factor;
        let new_topics: Vec<NewTopic> = Topic::ALL
            .iter()
            .map(|t| NewTopic::new(t.as_str(), self.config.bus_partitions, TopicReplication::Fixed(replication)))
            .collect();

        match admin.create_topics(&new_topics, &AdminOptions::new()).await {
            Ok(_) => Ok(()),
            Err(err) => {
                tracing::warn!(?err, "create_topics failed (topics may already exist)");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Bus for KafkaBus {
    async fn produce(&self, topic: Topic, key: &str, value: &str) -> Result<(), SkaldError> {
        skald_core::retry(&self.config, || async {
            let record = FutureRecord::to(topic.as_str()).key(key).payload(value);

            self.producer
                .send(record, Timeout::After(self.config.io_timeout))
                .await
                .map_err(|(err, _)| SkaldError::new(ErrorKind::TransientIo, err))?;

            Ok(())
        })
        .await
    }

    async fn subscribe(&self, topics: &[Topic]) -> Result<Box<dyn BusConsumer>, SkaldError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.group_id)
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|err| SkaldError::new(ErrorKind::FatalResourceLoss, err))?;

        let names: Vec<&str> = topics.iter().map(|t| t.as_str()).collect();
        consumer
            .subscribe(&names)
            .map_err(|err| SkaldError::new(ErrorKind::FatalResourceLoss, err))?;

        Ok(Box::new(KafkaConsumer {
            consumer,
            closed: false,
        }))
    }
}

struct KafkaConsumer {
    consumer: StreamConsumer,
    closed: bool,
}

#[async_trait]
impl BusConsumer for KafkaConsumer {
    async fn next(&mut self) -> Result<Option<BusMessage>, SkaldError> {
        loop {
            if self.closed {
                return Ok(None);
            }

            let message = self
                .consumer
                .recv()
                .await
                .map_err(|err| SkaldError::new(ErrorKind::TransientIo, err))?;

            let topic_name = message.topic();
            let Some(topic) = Topic::from_wire_name(topic_name) else {
                tracing::error!(topic = %topic_name, "dropping message on unrecognised topic");
                continue;
            };

            let key = message
                .key()
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                .unwrap_or_default();
            let value = match message.payload() {
                Some(bytes) => match std::str::from_utf8(bytes) {
                    Ok(s) => s.to_string(),
                    Err(_) => {
                        tracing::error!(topic = %topic_name, "dropping non-utf8 message payload");
                        continue;
                    }
                },
                None => String::new(),
            };

            return Ok(Some(BusMessage { topic, key, value }));
        }
    }

    async fn close(&mut self) -> Result<(), SkaldError> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    //! Requires a local kafka broker; skipped unless `SKALD_TEST_KAFKA_BROKERS`
    //! is set.
    use super::*;

    #[tokio::test]
    #[ignore = "requires a live kafka broker"]
    async fn behaves_like_a_bus() {
        let brokers = std::env::var("SKALD_TEST_KAFKA_BROKERS").expect("SKALD_TEST_KAFKA_BROKERS not set");
        let bus = KafkaBus::connect(&brokers, "skald-kafka-tests", &SkaldConfig::default()).unwrap();
        bus.ensure_control_topics().await.unwrap();
        skald_core::bus::asserts::behaves_like_a_bus(&bus).await;
    }
}
