use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String, // comma separated broker list

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    pub kafka_tls_client_cert: Option<String>, // PEM file path, requires the key as well

    pub kafka_tls_client_key: Option<String>,

    #[envconfig(default = "2000000")]
    pub kafka_max_bytes: u32, // Keep at or below the broker's message.max.bytes

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32,
}

impl KafkaConfig {
    /// Returns every configuration problem rather than stopping at the first.
    pub fn validate(&self) -> Vec<String> {
        let mut errs = Vec::new();

        if self.kafka_hosts.trim().is_empty() {
            errs.push("no KAFKA_HOSTS given".to_owned());
        }
        if self.kafka_max_bytes == 0 {
            errs.push("KAFKA_MAX_BYTES must be greater than zero".to_owned());
        }

        let cert_set = self.kafka_tls_client_cert.as_deref().is_some_and(|c| !c.is_empty());
        let key_set = self.kafka_tls_client_key.as_deref().is_some_and(|k| !k.is_empty());
        if cert_set != key_set {
            errs.push(
                "only one of KAFKA_TLS_CLIENT_CERT or KAFKA_TLS_CLIENT_KEY has been set - requires both"
                    .to_owned(),
            );
        }
        if cert_set && !self.kafka_tls {
            errs.push("KAFKA_TLS_CLIENT_CERT given but KAFKA_TLS is disabled".to_owned());
        }

        errs
    }

    pub(crate) fn apply_security(&self, client_config: &mut rdkafka::ClientConfig) {
        if !self.kafka_tls {
            return;
        }
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
        if let (Some(cert), Some(key)) = (&self.kafka_tls_client_cert, &self.kafka_tls_client_key)
        {
            client_config
                .set("ssl.certificate.location", cert)
                .set("ssl.key.location", key);
        }
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct ConsumerConfig {
    #[envconfig(default = "dimension-extractor")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "input-file-available")]
    pub kafka_consumer_topic: String,

    // New consumer groups start from the newest message, files announced before
    // the service first came up are not replayed.
    #[envconfig(default = "latest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    // Offsets are stored explicitly once a message is acknowledged, the
    // auto-commit only flushes what was stored.
    #[envconfig(default = "5000")]
    pub kafka_consumer_auto_commit_interval_ms: u32,
}
