use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message as _};
use rdkafka::{Offset as KafkaOffset, TopicPartitionList};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::KafkaClientConfigBuilder;
use super::cursor::CursorItem;
use super::{
    Broker, ChannelCursor, GroupOffsetCoordinator, PartitionCursor, PartitionOffsetCommitter,
};
use crate::error::BrokerError;
use crate::types::{Brokers, Group, Header, Message, Offset, Partition, Partitions, Topic};

const CURSOR_CAPACITY: usize = 1024;
const HIGH_WATER_MARK_REFRESH: Duration = Duration::from_secs(10);

/// [`Broker`] backed by rdkafka.
///
/// Metadata and watermark queries go through one shared `BaseConsumer`.
/// Every cursor owns an assign-only `StreamConsumer` for its partition.
#[derive(Clone)]
pub struct KafkaBroker {
    brokers: Brokers,
    tls: bool,
    client_id: String,
    timeout: Duration,
    metadata: Arc<BaseConsumer>,
}

impl KafkaBroker {
    pub fn new(
        brokers: Brokers,
        tls: bool,
        client_id: &str,
        timeout: Duration,
    ) -> Result<Self, BrokerError> {
        let metadata: BaseConsumer =
            KafkaClientConfigBuilder::for_partition_consumer(&brokers, client_id)
                .with_tls(tls)
                .build()
                .create()?;
        info!(%brokers, client_id, "kafka broker client created");
        Ok(Self {
            brokers,
            tls,
            client_id: client_id.to_string(),
            timeout,
            metadata: Arc::new(metadata),
        })
    }

    fn partition_consumer_config(&self) -> ClientConfig {
        KafkaClientConfigBuilder::for_partition_consumer(&self.brokers, &self.client_id)
            .with_tls(self.tls)
            .build()
    }

    async fn watermarks(&self, topic: &Topic, partition: Partition) -> Result<(i64, i64), BrokerError> {
        let consumer = self.metadata.clone();
        let topic = topic.clone();
        let timeout = self.timeout;
        let watermarks = tokio::task::spawn_blocking(move || {
            consumer.fetch_watermarks(topic.as_str(), partition.as_i32(), timeout)
        })
        .await??;
        Ok(watermarks)
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    async fn partitions(&self, topic: &Topic) -> Result<Partitions, BrokerError> {
        let consumer = self.metadata.clone();
        let name = topic.clone();
        let timeout = self.timeout;
        let partitions = tokio::task::spawn_blocking(move || {
            let metadata = consumer.fetch_metadata(Some(name.as_str()), timeout)?;
            Ok::<_, BrokerError>(
                metadata
                    .topics()
                    .iter()
                    .find(|t| t.name() == name.as_str() && t.error().is_none())
                    .map(|t| {
                        t.partitions()
                            .iter()
                            .map(|p| Partition::new(p.id()))
                            .collect::<Partitions>()
                    }),
            )
        })
        .await??;

        match partitions {
            Some(mut partitions) if !partitions.is_empty() => {
                partitions.sort();
                Ok(partitions)
            }
            _ => Err(BrokerError::UnknownTopic(topic.clone())),
        }
    }

    async fn get_offset(
        &self,
        topic: &Topic,
        partition: Partition,
        offset: Offset,
    ) -> Result<Offset, BrokerError> {
        if !offset.is_sentinel() {
            return Ok(offset);
        }
        let (low, high) = self.watermarks(topic, partition).await?;
        Ok(if offset == Offset::OLDEST {
            Offset::new(low)
        } else {
            Offset::new(high)
        })
    }

    async fn open_cursor(
        &self,
        topic: &Topic,
        partition: Partition,
        offset: Offset,
    ) -> Result<Box<dyn PartitionCursor>, BrokerError> {
        let (low, high) = self.watermarks(topic, partition).await?;
        let start = match offset {
            Offset::NEWEST => KafkaOffset::End,
            Offset::OLDEST => KafkaOffset::Beginning,
            concrete if concrete.as_i64() < low || concrete.as_i64() > high => {
                return Err(BrokerError::OffsetOutOfRange {
                    topic: topic.clone(),
                    partition,
                    offset,
                });
            }
            concrete => KafkaOffset::Offset(concrete.as_i64()),
        };

        let consumer: StreamConsumer = self.partition_consumer_config().create()?;
        let mut assignment = TopicPartitionList::new();
        assignment.add_partition_offset(topic.as_str(), partition.as_i32(), start)?;
        consumer.assign(&assignment)?;
        debug!(%topic, %partition, %offset, low, high, "kafka cursor assigned");

        let consumer = Arc::new(consumer);
        let topic = topic.clone();
        let timeout = self.timeout;
        let cursor = ChannelCursor::spawn(
            CURSOR_CAPACITY,
            Offset::new(high),
            move |tx, hwm, cancel| async move {
                feed(consumer, topic, partition, timeout, tx, hwm, cancel).await
            },
        );
        Ok(Box::new(cursor))
    }

    async fn group_coordinator(
        &self,
        group: &Group,
    ) -> Result<Arc<dyn GroupOffsetCoordinator>, BrokerError> {
        let consumer: BaseConsumer =
            KafkaClientConfigBuilder::for_group_committer(&self.brokers, group)
                .with_tls(self.tls)
                .build()
                .create()?;
        Ok(Arc::new(KafkaGroupCoordinator {
            consumer: Arc::new(consumer),
            timeout: self.timeout,
        }))
    }
}

fn to_message(msg: &BorrowedMessage<'_>) -> Message {
    let mut message = Message::new(
        Topic::from(msg.topic()),
        Partition::new(msg.partition()),
        Offset::new(msg.offset()),
        msg.key().unwrap_or_default(),
        msg.payload().unwrap_or_default(),
    );
    if let Some(headers) = msg.headers() {
        message = message.with_headers(Header::from_kafka_headers(headers));
    }
    if let Some(timestamp) = msg
        .timestamp()
        .to_millis()
        .and_then(DateTime::from_timestamp_millis)
    {
        message = message.with_timestamp(timestamp);
    }
    message
}

async fn feed(
    consumer: Arc<StreamConsumer>,
    topic: Topic,
    partition: Partition,
    timeout: Duration,
    tx: mpsc::Sender<CursorItem>,
    hwm: Arc<AtomicI64>,
    cancel: CancellationToken,
) {
    let mut refresh = tokio::time::interval(HIGH_WATER_MARK_REFRESH);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = refresh.tick() => {
                let refresh_consumer = consumer.clone();
                let refresh_topic = topic.clone();
                let watermarks = tokio::task::spawn_blocking(move || {
                    refresh_consumer.fetch_watermarks(refresh_topic.as_str(), partition.as_i32(), timeout)
                })
                .await;
                match watermarks {
                    Ok(Ok((_, high))) => {
                        hwm.fetch_max(high, Ordering::AcqRel);
                    }
                    Ok(Err(e)) => warn!(%topic, %partition, error = ?e, "refresh high-water mark failed"),
                    Err(e) => warn!(%topic, %partition, error = ?e, "refresh high-water mark task failed"),
                }
            }
            received = consumer.recv() => {
                let item = received.map(|msg| to_message(&msg)).map_err(BrokerError::Kafka);
                let stop = item.is_err();
                if let Ok(message) = &item {
                    hwm.fetch_max(message.offset.as_i64() + 1, Ordering::AcqRel);
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = tx.send(item) => if sent.is_err() { return },
                }
                if stop {
                    return;
                }
            }
        }
    }
}

struct KafkaGroupCoordinator {
    consumer: Arc<BaseConsumer>,
    timeout: Duration,
}

#[async_trait]
impl GroupOffsetCoordinator for KafkaGroupCoordinator {
    async fn manage_partition(
        &self,
        topic: &Topic,
        partition: Partition,
    ) -> Result<Arc<dyn PartitionOffsetCommitter>, BrokerError> {
        Ok(Arc::new(KafkaPartitionCommitter {
            consumer: self.consumer.clone(),
            topic: topic.clone(),
            partition,
            timeout: self.timeout,
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

struct KafkaPartitionCommitter {
    consumer: Arc<BaseConsumer>,
    topic: Topic,
    partition: Partition,
    timeout: Duration,
}

#[async_trait]
impl PartitionOffsetCommitter for KafkaPartitionCommitter {
    async fn next_offset(&self) -> Result<(Offset, String), BrokerError> {
        let consumer = self.consumer.clone();
        let topic = self.topic.clone();
        let partition = self.partition;
        let timeout = self.timeout;
        let committed = tokio::task::spawn_blocking(move || {
            let mut request = TopicPartitionList::new();
            request.add_partition(topic.as_str(), partition.as_i32());
            let committed = consumer.committed_offsets(request, timeout)?;
            Ok::<_, BrokerError>(
                committed
                    .find_partition(topic.as_str(), partition.as_i32())
                    .and_then(|elem| match elem.offset() {
                        KafkaOffset::Offset(offset) => {
                            Some((Offset::new(offset), elem.metadata().to_string()))
                        }
                        _ => None,
                    }),
            )
        })
        .await??;
        Ok(committed.unwrap_or((Offset::OLDEST, String::new())))
    }

    async fn mark_offset(&self, offset: Offset, metadata: &str) -> Result<(), BrokerError> {
        let consumer = self.consumer.clone();
        let topic = self.topic.clone();
        let partition = self.partition;
        let metadata = metadata.to_string();
        tokio::task::spawn_blocking(move || {
            let mut commit = TopicPartitionList::new();
            let mut elem = commit.add_partition(topic.as_str(), partition.as_i32());
            elem.set_offset(KafkaOffset::Offset(offset.as_i64()))?;
            elem.set_metadata(metadata);
            consumer.commit(&commit, CommitMode::Sync)?;
            Ok::<_, BrokerError>(())
        })
        .await??;
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}
