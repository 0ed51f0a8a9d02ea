use std::path::PathBuf;
use std::time::Duration;

use envconfig::Envconfig;

use crate::error::{ConsumerError, DecodeError};
use crate::types::{BatchSize, Brokers, Group, Offset, Topic};

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka configuration
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "offset-consumer")]
    pub kafka_client_id: String,

    #[envconfig(default = "updates")]
    pub kafka_topic: String,

    /// Scopes the offset bucket, so several groups can share one store.
    pub kafka_consumer_group: Option<String>,

    /// Commit offsets to the consumer group on the broker instead of the
    /// local store. Requires `KAFKA_CONSUMER_GROUP`.
    #[envconfig(default = "false")]
    pub kafka_group_commit: bool,

    /// `oldest`, `newest` or a concrete offset.
    #[envconfig(default = "oldest")]
    pub kafka_initial_offset: String,

    #[envconfig(default = "10000")]
    pub kafka_timeout_ms: u64,

    // Consumer processing configuration
    #[envconfig(default = "100")]
    pub batch_size: usize,

    /// Stop once everything present at startup has been consumed.
    #[envconfig(default = "false")]
    pub drain: bool,

    #[envconfig(default = "10")]
    pub log_sample_interval_secs: u64,

    // RocksDB storage configuration
    #[envconfig(default = "/tmp/offset-consumer")]
    pub offset_store_path: String,

    // HTTP server configuration
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn brokers(&self) -> Brokers {
        Brokers::parse(&self.kafka_hosts)
    }

    pub fn topic(&self) -> Topic {
        Topic::from(self.kafka_topic.as_str())
    }

    pub fn group(&self) -> Option<Group> {
        self.kafka_consumer_group
            .as_deref()
            .filter(|group| !group.is_empty())
            .map(Group::from)
    }

    pub fn initial_offset(&self) -> Result<Offset, DecodeError> {
        self.kafka_initial_offset.parse()
    }

    pub fn batch_size(&self) -> Result<BatchSize, ConsumerError> {
        BatchSize::new(self.batch_size)
    }

    pub fn kafka_timeout(&self) -> Duration {
        Duration::from_millis(self.kafka_timeout_ms)
    }

    pub fn log_sample_interval(&self) -> Duration {
        Duration::from_secs(self.log_sample_interval_secs)
    }

    pub fn offset_store_path_buf(&self) -> PathBuf {
        PathBuf::from(&self.offset_store_path)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
