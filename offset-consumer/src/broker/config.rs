use rdkafka::ClientConfig;

use crate::types::{Brokers, Group};

/// rdkafka client configuration with defaults for the offset consumer.
///
/// Three entry points, one per client the broker needs:
/// - `for_partition_consumer`: assign-only consumer reading one partition.
///   Offsets are tracked by the offset manager, never auto committed.
/// - `for_group_committer`: consumer that never reads, only commits offsets
///   on behalf of a consumer group.
/// - `for_producer`: sync producer with acks=all and retries.
pub struct KafkaClientConfigBuilder {
    config: ClientConfig,
}

impl KafkaClientConfigBuilder {
    /// `group.id` is required by rdkafka but the consumer never joins the group.
    /// `auto.offset.reset=error` turns a fetch outside the retained range into
    /// a consumer error instead of a silent jump to the log tail.
    pub fn for_partition_consumer(brokers: &Brokers, client_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", brokers.to_string())
            .set("group.id", client_id)
            .set("client.id", client_id)
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", "error")
            .set("socket.timeout.ms", "10000");

        Self { config }
    }

    pub fn for_group_committer(brokers: &Brokers, group: &Group) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", brokers.to_string())
            .set("group.id", group.as_str())
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false")
            .set("socket.timeout.ms", "10000");

        Self { config }
    }

    pub fn for_producer(brokers: &Brokers) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", brokers.to_string())
            .set("acks", "all")
            .set("retries", "10")
            .set("enable.idempotence", "true")
            .set("message.timeout.ms", "30000");

        Self { config }
    }

    /// Enable TLS/SSL for Kafka connection
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    /// Add any custom configuration
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    pub fn with_fetch_max_bytes(mut self, bytes: u32) -> Self {
        self.config.set("fetch.max.bytes", bytes.to_string());
        self
    }

    pub fn with_queued_min_messages(mut self, messages: u32) -> Self {
        self.config.set("queued.min.messages", messages.to_string());
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}
