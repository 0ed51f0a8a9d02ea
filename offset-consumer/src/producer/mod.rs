//! Synchronous publishing: every send returns once the broker acknowledged
//! the message, or with the error that prevented it.

mod decorator;
mod json;
mod kafka;

use async_trait::async_trait;

use crate::error::ProducerError;
use crate::types::{Header, Partition, Topic};

pub use self::decorator::{
    NopSyncProducer, SyncProducerHeader, SyncProducerMetrics, SyncProducerModify,
};
pub use self::json::{JsonSender, NoValidation, Validate};
pub use self::kafka::KafkaSyncProducer;

/// A message to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerMessage {
    pub topic: Topic,
    /// Explicit partition, otherwise the producer partitions by key.
    pub partition: Option<Partition>,
    pub key: Vec<u8>,
    /// Empty value is a delete marker.
    pub value: Vec<u8>,
    pub headers: Header,
}

impl ProducerMessage {
    pub fn new(topic: Topic, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            topic,
            partition: None,
            key: key.into(),
            value: value.into(),
            headers: Header::new(),
        }
    }

    pub fn with_partition(mut self, partition: Partition) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn with_headers(mut self, headers: Header) -> Self {
        self.headers = headers;
        self
    }
}

#[async_trait]
pub trait SyncProducer: Send + Sync {
    async fn send_message(&self, msg: ProducerMessage) -> Result<(), ProducerError>;

    /// Sends all messages, failing with the first error.
    async fn send_messages(&self, msgs: Vec<ProducerMessage>) -> Result<(), ProducerError> {
        for msg in msgs {
            self.send_message(msg).await?;
        }
        Ok(())
    }

    /// Flushes pending messages. Sends after close fail.
    async fn close(&self) -> Result<(), ProducerError>;
}
