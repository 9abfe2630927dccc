use std::fmt;
use std::str::FromStr;
use std::time;

use common_kafka::config::{ConsumerConfig, KafkaConfig};
use envconfig::Envconfig;
use thiserror::Error;

use crate::retry::RetryPolicy;

const REDACTED: &str = "<redacted>";

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "21400")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub consumer: ConsumerConfig,

    #[envconfig(default = "dimensions-extracted")]
    pub dimensions_extracted_topic: String,

    #[envconfig(default = "report-events")]
    pub event_reporter_topic: String,

    #[envconfig(default = "http://localhost:22000")]
    pub dataset_api_url: String,

    #[envconfig(default = "")]
    pub service_auth_token: String,

    #[envconfig(default = "http://localhost:8082")]
    pub zebedee_url: String,

    #[envconfig(default = "eu-west-1")]
    pub aws_region: String,

    #[envconfig(default = "")]
    pub bucket_names: CommaSeparated, // buckets files are expected to come from

    #[envconfig(default = "false")]
    pub encryption_disabled: bool,

    #[envconfig(default = "http://localhost:8200")]
    pub vault_addr: String,

    #[envconfig(default = "")]
    pub vault_token: String,

    #[envconfig(default = "secret/shared/psk")]
    pub vault_path: String,

    #[envconfig(default = "3")]
    pub request_max_retries: u32, // total attempts per dataset API call

    #[envconfig(from = "RETRY_BACKOFF_MS", default = "10000")]
    pub retry_backoff: EnvMsDuration,

    #[envconfig(from = "REQUEST_TIMEOUT_MS", default = "30000")]
    pub request_timeout: EnvMsDuration,

    #[envconfig(default = "100")]
    pub dimension_batch_size: usize,

    pub time_column_index: Option<usize>,

    #[envconfig(from = "GRACEFUL_SHUTDOWN_TIMEOUT_MS", default = "5000")]
    pub graceful_shutdown_timeout: EnvMsDuration,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.request_max_retries, self.retry_backoff.0)
    }

    /// Collects every problem with the configuration instead of stopping at
    /// the first one.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = self.kafka.validate();

        if self.consumer.kafka_consumer_topic.is_empty() {
            errors.push("no KAFKA_CONSUMER_TOPIC given".to_owned());
        }
        if self.dimensions_extracted_topic.is_empty() {
            errors.push("no DIMENSIONS_EXTRACTED_TOPIC given".to_owned());
        }
        if self.event_reporter_topic.is_empty() {
            errors.push("no EVENT_REPORTER_TOPIC given".to_owned());
        }
        if self.dataset_api_url.is_empty() {
            errors.push("no DATASET_API_URL given".to_owned());
        }
        if self.request_max_retries == 0 {
            errors.push("REQUEST_MAX_RETRIES must be at least 1".to_owned());
        }
        if self.dimension_batch_size == 0 {
            errors.push("DIMENSION_BATCH_SIZE must be at least 1".to_owned());
        }
        if !self.encryption_disabled {
            if self.vault_addr.is_empty() {
                errors.push("no VAULT_ADDR given while encryption is enabled".to_owned());
            }
            if self.vault_token.is_empty() {
                errors.push("no VAULT_TOKEN given while encryption is enabled".to_owned());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError { errors })
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bind", &self.bind())
            .field("kafka", &self.kafka)
            .field("consumer", &self.consumer)
            .field("dimensions_extracted_topic", &self.dimensions_extracted_topic)
            .field("event_reporter_topic", &self.event_reporter_topic)
            .field("dataset_api_url", &self.dataset_api_url)
            .field("service_auth_token", &REDACTED)
            .field("zebedee_url", &self.zebedee_url)
            .field("aws_region", &self.aws_region)
            .field("bucket_names", &self.bucket_names.0)
            .field("encryption_disabled", &self.encryption_disabled)
            .field("vault_addr", &self.vault_addr)
            .field("vault_token", &REDACTED)
            .field("vault_path", &self.vault_path)
            .field("request_max_retries", &self.request_max_retries)
            .field("retry_backoff", &self.retry_backoff.0)
            .field("request_timeout", &self.request_timeout.0)
            .field("dimension_batch_size", &self.dimension_batch_size)
            .field("time_column_index", &self.time_column_index)
            .field("graceful_shutdown_timeout", &self.graceful_shutdown_timeout.0)
            .finish()
    }
}

#[derive(Error, Debug)]
#[error("invalid configuration: {}", .errors.join(", "))]
pub struct ConfigError {
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

/// A comma separated list, blank entries dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommaSeparated(pub Vec<String>);

impl FromStr for CommaSeparated {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(CommaSeparated(
            s.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_owned)
                .collect(),
        ))
    }
}
