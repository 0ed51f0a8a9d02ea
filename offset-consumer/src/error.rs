use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use thiserror::Error;

use crate::store::BucketName;
use crate::types::{Offset, Partition, Topic};

/// Errors raised while decoding identifiers, offsets and message payloads.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("parse value '{0}' as offset failed")]
    InvalidOffset(String),
    #[error("parse value '{0}' as partition failed")]
    InvalidPartition(String),
    #[error("topic of {0} bytes does not fit a binary key")]
    TopicTooLong(usize),
    #[error("expected {expected} bytes but got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("value is not valid utf-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("decode json failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors surfaced by the broker collaborator.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// The requested start offset is no longer (or not yet) retained by the broker.
    #[error("The requested offset {offset} is outside the range of offsets maintained by the server for topic {topic} partition {partition}")]
    OffsetOutOfRange {
        topic: Topic,
        partition: Partition,
        offset: Offset,
    },
    #[error("topic {0} not found")]
    UnknownTopic(Topic),
    #[error("partition {partition} of topic {topic} not found")]
    UnknownPartition { topic: Topic, partition: Partition },
    #[error("partition cursor closed")]
    CursorClosed,
    #[error("partition stream failed: {0}")]
    Stream(String),
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("broker task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl BrokerError {
    pub fn is_offset_out_of_range(&self) -> bool {
        match self {
            BrokerError::OffsetOutOfRange { .. } => true,
            BrokerError::Kafka(KafkaError::MessageConsumption(code))
            | BrokerError::Kafka(KafkaError::MessageConsumptionFatal(code)) => {
                matches!(
                    code,
                    RDKafkaErrorCode::OffsetOutOfRange | RDKafkaErrorCode::AutoOffsetReset
                )
            }
            _ => false,
        }
    }
}

/// Errors of the transactional key-value store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("bucket {0} not found")]
    BucketNotFound(BucketName),
    #[error("key not found")]
    KeyNotFound,
    #[error("write attempted in read-only transaction")]
    ReadOnly,
    #[error("store lock poisoned")]
    Poisoned,
    #[error("decode stored value failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("rocksdb error: {0}")]
    RocksDb(#[from] rocksdb::Error),
}

impl StoreError {
    /// Both a missing bucket and a missing key mean "nothing was ever written".
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::BucketNotFound(_) | StoreError::KeyNotFound)
    }
}

#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("failed to serialize: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid value for key '{key}': {reason}")]
    Validation { key: String, reason: String },
    #[error("failed to produce to kafka: {0}")]
    Kafka(#[from] KafkaError),
    #[error("producer closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("consumption cancelled")]
    Cancelled,
    #[error("invalid batch size {0}, must be at least 1")]
    InvalidBatchSize(usize),
    #[error("partition task panicked: {0}")]
    TaskPanicked(String),
    #[error("offset {0} is a sentinel and cannot be marked")]
    SentinelOffset(Offset),
}

/// Returns true if anywhere in the chain the error is a cancellation.
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<ConsumerError>(),
            Some(ConsumerError::Cancelled)
        )
    })
}

/// Returns true if anywhere in the chain the error is a store "not found".
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<StoreError>()
            .is_some_and(StoreError::is_not_found)
    })
}
