use std::time;

use async_trait::async_trait;
use common_kafka::avro::{AvroCodec, CodecError};
use common_kafka::kafka_producer::{
    flush_producer, send_payload_to_kafka, KafkaContext, KafkaProduceError,
};
use rdkafka::error::KafkaError;
use rdkafka::producer::FutureProducer;
use thiserror::Error;

use crate::event::{report_event_codec, ReportEvent};

#[derive(Error, Debug)]
pub enum ReportError {
    #[error(transparent)]
    Encode(#[from] CodecError),
    #[error(transparent)]
    Kafka(#[from] KafkaProduceError),
}

/// Makes an instance's failure visible outside this service.
#[async_trait]
pub trait ErrorReporter: Send + Sync {
    async fn report(&self, instance_id: &str, message: &str) -> Result<(), ReportError>;
}

/// Publishes failures as report events for the import reporter to pick up.
pub struct KafkaErrorReporter {
    producer: FutureProducer<KafkaContext>,
    topic: String,
    codec: AvroCodec<ReportEvent>,
}

impl KafkaErrorReporter {
    pub fn new(producer: FutureProducer<KafkaContext>, topic: &str) -> Result<Self, CodecError> {
        Ok(Self {
            producer,
            topic: topic.to_owned(),
            codec: report_event_codec()?,
        })
    }

    pub fn flush(&self, timeout: time::Duration) -> Result<(), KafkaError> {
        flush_producer(&self.producer, timeout)
    }
}

#[async_trait]
impl ErrorReporter for KafkaErrorReporter {
    async fn report(&self, instance_id: &str, message: &str) -> Result<(), ReportError> {
        let payload = self.codec.encode(&ReportEvent::error(instance_id, message))?;
        send_payload_to_kafka(&self.producer, &self.topic, Some(instance_id), &payload).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_kafka::test::create_mock_kafka;
    use rdkafka::types::{RDKafkaApiKey, RDKafkaRespErr};

    #[tokio::test]
    async fn publishes_report_event() {
        let (cluster, producer) = create_mock_kafka().await;
        cluster
            .create_topic("report-events", 1, 1)
            .expect("failed to create topic");

        let reporter = KafkaErrorReporter::new(producer, "report-events").unwrap();
        reporter.report("inst-1", "file not found").await.unwrap();
    }

    #[tokio::test]
    async fn surfaces_broker_errors() {
        let (cluster, producer) = create_mock_kafka().await;
        cluster
            .create_topic("report-events", 1, 1)
            .expect("failed to create topic");
        let err = [RDKafkaRespErr::RD_KAFKA_RESP_ERR_MSG_SIZE_TOO_LARGE; 1];
        cluster.request_errors(RDKafkaApiKey::Produce, &err);

        let reporter = KafkaErrorReporter::new(producer, "report-events").unwrap();
        assert!(matches!(
            reporter.report("inst-1", "boom").await,
            Err(ReportError::Kafka(_))
        ));
    }
}
