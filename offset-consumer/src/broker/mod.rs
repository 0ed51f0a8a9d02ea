//! Broker collaborator.
//!
//! The consumer only needs partition discovery, per-partition cursors,
//! sentinel resolution and group offset commits. [`KafkaBroker`] provides
//! them on top of rdkafka, [`MemoryBroker`] keeps everything in process.

pub mod config;
mod cursor;
mod kafka;
mod memory;

use std::sync::Arc;

use async_trait::async_trait;

pub use self::config::KafkaClientConfigBuilder;
pub use self::cursor::ChannelCursor;
pub use self::kafka::KafkaBroker;
pub use self::memory::MemoryBroker;

use crate::error::BrokerError;
use crate::types::{Group, Message, Offset, Partition, Partitions, Topic};

#[async_trait]
pub trait Broker: Send + Sync {
    async fn partitions(&self, topic: &Topic) -> Result<Partitions, BrokerError>;

    /// Resolves [`Offset::NEWEST`] to the high-water mark and
    /// [`Offset::OLDEST`] to the oldest retained offset. Concrete offsets
    /// are returned unchanged.
    async fn get_offset(
        &self,
        topic: &Topic,
        partition: Partition,
        offset: Offset,
    ) -> Result<Offset, BrokerError>;

    /// Opens a cursor delivering messages from `offset` on. Fails with
    /// [`BrokerError::OffsetOutOfRange`] if the offset is not retained.
    async fn open_cursor(
        &self,
        topic: &Topic,
        partition: Partition,
        offset: Offset,
    ) -> Result<Box<dyn PartitionCursor>, BrokerError>;

    async fn group_coordinator(
        &self,
        group: &Group,
    ) -> Result<Arc<dyn GroupOffsetCoordinator>, BrokerError>;
}

/// A stream of messages and errors for one partition.
#[async_trait]
pub trait PartitionCursor: Send {
    /// Waits for the next message. A stream error is returned as `Err`.
    async fn recv(&mut self) -> Result<Message, BrokerError>;

    /// Returns an already available message without waiting.
    fn try_recv(&mut self) -> Result<Option<Message>, BrokerError>;

    /// One past the offset of the last message the broker reported.
    fn high_water_mark(&self) -> Offset;

    async fn close(&mut self) -> Result<(), BrokerError>;
}

/// Broker-side offset commits for one consumer group.
#[async_trait]
pub trait GroupOffsetCoordinator: Send + Sync {
    async fn manage_partition(
        &self,
        topic: &Topic,
        partition: Partition,
    ) -> Result<Arc<dyn PartitionOffsetCommitter>, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait PartitionOffsetCommitter: Send + Sync {
    /// Committed next offset and its metadata. Without a commit the offset
    /// is [`Offset::OLDEST`] and the metadata empty.
    async fn next_offset(&self) -> Result<(Offset, String), BrokerError>;

    /// Commits synchronously; returns once the broker acknowledged.
    async fn mark_offset(&self, offset: Offset, metadata: &str) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}
