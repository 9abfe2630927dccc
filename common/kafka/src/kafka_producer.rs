use std::time::Duration;

use health::HealthHandle;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::KafkaConfig;

pub struct KafkaContext {
    liveness: HealthHandle,
}

impl From<HealthHandle> for KafkaContext {
    fn from(value: HealthHandle) -> Self {
        KafkaContext { liveness: value }
    }
}

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, _: rdkafka::Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us
        self.liveness.report_healthy();
    }
}

pub async fn create_kafka_producer(
    config: &KafkaConfig,
    liveness: HealthHandle,
) -> Result<FutureProducer<KafkaContext>, KafkaError> {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("statistics.interval.ms", "10000")
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set("message.max.bytes", config.kafka_max_bytes.to_string());

    config.apply_security(&mut client_config);

    debug!("rdkafka configuration: {:?}", client_config);
    let api: FutureProducer<KafkaContext> = client_config.create_with_context(liveness.into())?;

    // "Ping" the Kafka brokers by requesting metadata
    match api
        .client()
        .fetch_metadata(None, Duration::from_secs(15))
    {
        Ok(metadata) => {
            info!(
                "Successfully connected to Kafka brokers. Found {} topics.",
                metadata.topics().len()
            );
        }
        Err(error) => {
            error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
            return Err(error);
        }
    }

    Ok(api)
}

#[derive(Error, Debug)]
pub enum KafkaProduceError {
    #[error("failed to produce to kafka: {error}")]
    KafkaProduceError { error: KafkaError },
    #[error("failed to produce to kafka (timeout)")]
    KafkaProduceCanceled,
}

/// Send one already-encoded payload and wait for the broker acknowledgement.
pub async fn send_payload_to_kafka<C: rdkafka::ClientContext + 'static>(
    kafka_producer: &FutureProducer<C>,
    topic: &str,
    key: Option<&str>,
    payload: &[u8],
) -> Result<(), KafkaProduceError> {
    let mut record = FutureRecord::<str, [u8]>::to(topic).payload(payload);
    if let Some(key) = key {
        record = record.key(key);
    }

    match kafka_producer.send(record, Timeout::Never).await {
        Ok(_) => Ok(()),
        Err((KafkaError::Canceled, _)) => Err(KafkaProduceError::KafkaProduceCanceled),
        Err((error, _)) => Err(KafkaProduceError::KafkaProduceError { error }),
    }
}

/// Flush anything still queued in the producer, bounded by `timeout`.
pub fn flush_producer<C: rdkafka::ClientContext + 'static>(
    kafka_producer: &FutureProducer<C>,
    timeout: Duration,
) -> Result<(), KafkaError> {
    kafka_producer.flush(Timeout::After(timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::create_mock_kafka;
    use rdkafka::types::{RDKafkaApiKey, RDKafkaRespErr};

    #[tokio::test]
    async fn sends_to_mock_cluster() {
        let (cluster, producer) = create_mock_kafka().await;
        cluster
            .create_topic("dimensions-extracted", 1, 1)
            .expect("failed to create topic");

        send_payload_to_kafka(&producer, "dimensions-extracted", Some("i1"), b"payload")
            .await
            .expect("failed to send");
        flush_producer(&producer, Duration::from_secs(5)).expect("failed to flush");
    }

    #[tokio::test]
    async fn reports_delivery_failures() {
        let (cluster, producer) = create_mock_kafka().await;
        cluster
            .create_topic("dimensions-extracted", 1, 1)
            .expect("failed to create topic");
        cluster.clear_request_errors(RDKafkaApiKey::Produce);
        let err = [RDKafkaRespErr::RD_KAFKA_RESP_ERR_MSG_SIZE_TOO_LARGE; 1];
        cluster.request_errors(RDKafkaApiKey::Produce, &err);

        let result =
            send_payload_to_kafka(&producer, "dimensions-extracted", None, b"payload").await;
        assert!(matches!(
            result,
            Err(KafkaProduceError::KafkaProduceError { .. })
        ));
    }
}
