use std::fmt;
use std::sync::{Arc, Weak};

use health::HealthHandle;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::{ClientConfig, ClientContext, Message};
use tracing::{debug, info};

use crate::config::{ConsumerConfig, KafkaConfig};

pub struct ConsumerLiveness {
    liveness: HealthHandle,
}

impl ClientContext for ConsumerLiveness {
    fn stats(&self, _: rdkafka::Statistics) {
        // The stats callback only fires while the rdkafka main loop is running
        self.liveness.report_healthy();
    }
}

impl ConsumerContext for ConsumerLiveness {}

/// A consumer bound to exactly one topic, handing out raw payloads together
/// with an [`Offset`] the caller stores once it is done with the message.
#[derive(Clone)]
pub struct SingleTopicConsumer {
    inner: Arc<Inner>,
}

struct Inner {
    consumer: StreamConsumer<ConsumerLiveness>,
    topic: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RecvErr {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
}

#[derive(Debug, thiserror::Error)]
pub enum OffsetErr {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("Consumer gone")]
    Gone,
}

impl SingleTopicConsumer {
    pub fn new(
        common_config: &KafkaConfig,
        consumer_config: &ConsumerConfig,
        liveness: HealthHandle,
    ) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &common_config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("group.id", &consumer_config.kafka_consumer_group)
            .set(
                "auto.offset.reset",
                &consumer_config.kafka_consumer_offset_reset,
            )
            .set(
                "fetch.message.max.bytes",
                common_config.kafka_max_bytes.to_string(),
            )
            // Offsets are only stored once a message has been acknowledged
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "true")
            .set(
                "auto.commit.interval.ms",
                consumer_config
                    .kafka_consumer_auto_commit_interval_ms
                    .to_string(),
            );

        common_config.apply_security(&mut client_config);

        debug!("rdkafka consumer configuration: {:?}", client_config);
        let consumer: StreamConsumer<ConsumerLiveness> =
            client_config.create_with_context(ConsumerLiveness { liveness })?;
        consumer.subscribe(&[consumer_config.kafka_consumer_topic.as_str()])?;
        info!(
            topic = %consumer_config.kafka_consumer_topic,
            group = %consumer_config.kafka_consumer_group,
            "subscribed kafka consumer"
        );

        let inner = Inner {
            consumer,
            topic: consumer_config.kafka_consumer_topic.clone(),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Wait for the next message. An empty payload comes back as an empty vec,
    /// the caller decides what to make of it.
    pub async fn recv(&self) -> Result<(Vec<u8>, Offset), RecvErr> {
        let message = self.inner.consumer.recv().await?;

        let offset = Offset {
            handle: Arc::downgrade(&self.inner),
            partition: message.partition(),
            offset: message.offset(),
            topic: self.inner.topic.clone(),
        };
        let payload = message.payload().map(<[u8]>::to_vec).unwrap_or_default();

        Ok((payload, offset))
    }

    /// Stop fetching from the topic. Messages already handed out can still be
    /// acknowledged.
    pub fn unsubscribe(&self) {
        self.inner.consumer.unsubscribe();
    }

    /// Synchronously commit every stored offset, used on shutdown.
    pub fn commit(&self) -> Result<(), KafkaError> {
        match self.inner.consumer.commit_consumer_state(CommitMode::Sync) {
            // Nothing was stored since the last commit
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => Ok(()),
            other => other,
        }
    }
}

pub struct Offset {
    handle: Weak<Inner>,
    topic: String,
    partition: i32,
    offset: i64,
}

impl Offset {
    /// Mark the message as consumed. The stored position is the next offset to
    /// read, it is picked up by the following auto-commit.
    pub fn store(self) -> Result<(), OffsetErr> {
        let inner = self.handle.upgrade().ok_or(OffsetErr::Gone)?;
        inner
            .consumer
            .store_offset(&self.topic, self.partition, self.offset + 1)?;
        Ok(())
    }
}

impl fmt::Debug for Offset {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ topic: {}, partition: {}, offset: {} }}",
            self.topic, self.partition, self.offset
        )
    }
}
