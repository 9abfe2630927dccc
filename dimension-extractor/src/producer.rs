use std::time;

use async_trait::async_trait;
use common_kafka::avro::{AvroCodec, CodecError};
use common_kafka::kafka_producer::{
    flush_producer, send_payload_to_kafka, KafkaContext, KafkaProduceError,
};
use rdkafka::error::KafkaError;
use rdkafka::producer::FutureProducer;
use thiserror::Error;
use tracing::info;

use crate::event::{extraction_complete_codec, ExtractionCompleteEvent};

#[derive(Error, Debug)]
pub enum ProduceError {
    #[error(transparent)]
    Encode(#[from] CodecError),
    #[error(transparent)]
    Kafka(#[from] KafkaProduceError),
}

/// Announces files whose dimensions were fully delivered.
#[async_trait]
pub trait EventProducer: Send + Sync {
    async fn extraction_complete(&self, event: &ExtractionCompleteEvent)
        -> Result<(), ProduceError>;
}

pub struct KafkaEventProducer {
    producer: FutureProducer<KafkaContext>,
    topic: String,
    codec: AvroCodec<ExtractionCompleteEvent>,
}

impl KafkaEventProducer {
    pub fn new(producer: FutureProducer<KafkaContext>, topic: &str) -> Result<Self, CodecError> {
        Ok(Self {
            producer,
            topic: topic.to_owned(),
            codec: extraction_complete_codec()?,
        })
    }

    pub fn flush(&self, timeout: time::Duration) -> Result<(), KafkaError> {
        flush_producer(&self.producer, timeout)
    }
}

#[async_trait]
impl EventProducer for KafkaEventProducer {
    async fn extraction_complete(
        &self,
        event: &ExtractionCompleteEvent,
    ) -> Result<(), ProduceError> {
        let payload = self.codec.encode(event)?;
        send_payload_to_kafka(
            &self.producer,
            &self.topic,
            Some(event.instance_id.as_str()),
            &payload,
        )
        .await?;

        info!(
            instance_id = %event.instance_id,
            file_url = %event.file_url,
            topic = %self.topic,
            "produced dimensions extracted event"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_kafka::test::create_mock_kafka;

    #[tokio::test]
    async fn produces_completion_event() {
        let (cluster, producer) = create_mock_kafka().await;
        cluster
            .create_topic("dimensions-extracted", 1, 1)
            .expect("failed to create topic");

        let producer = KafkaEventProducer::new(producer, "dimensions-extracted").unwrap();
        producer
            .extraction_complete(&ExtractionCompleteEvent {
                file_url: "s3://bucket/file.csv".to_owned(),
                instance_id: "inst-1".to_owned(),
            })
            .await
            .unwrap();
        producer.flush(time::Duration::from_secs(5)).unwrap();
    }
}
