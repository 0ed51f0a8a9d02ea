//! High-water marks, consumer group offsets and drain targets.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::broker::Broker;
use crate::error::ConsumerError;
use crate::offset_manager::OffsetManager;
use crate::types::{Offset, Partition, PartitionOffsets, Topic};

/// High-water mark of one partition: one past its last message.
pub async fn high_water_mark(broker: &dyn Broker, topic: &Topic, partition: Partition) -> Result<Offset> {
    let offset = broker
        .get_offset(topic, partition, Offset::NEWEST)
        .await
        .with_context(|| format!("get high-water mark of topic {topic} partition {partition} failed"))?;
    trace!(%topic, %partition, high_water_mark = %offset, "found high-water mark");
    Ok(offset)
}

/// High-water marks of every partition of `topic`.
pub async fn high_water_marks(broker: &dyn Broker, topic: &Topic) -> Result<PartitionOffsets> {
    let partitions = broker
        .partitions(topic)
        .await
        .with_context(|| format!("get partitions of topic {topic} failed"))?;

    let mut result = PartitionOffsets::new();
    for partition in partitions {
        result.insert(partition, high_water_mark(broker, topic, partition).await?);
    }
    debug!(%topic, high_water_marks = %result, "found high-water marks");
    Ok(result)
}

#[async_trait]
pub trait HighWaterMarkProvider: Send + Sync {
    async fn high_water_mark(&self, topic: &Topic, partition: Partition) -> Result<Offset>;
}

/// [`HighWaterMarkProvider`] asking the broker on every call.
pub struct BrokerHighWaterMarkProvider {
    broker: Arc<dyn Broker>,
}

impl BrokerHighWaterMarkProvider {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl HighWaterMarkProvider for BrokerHighWaterMarkProvider {
    async fn high_water_mark(&self, topic: &Topic, partition: Partition) -> Result<Offset> {
        high_water_mark(self.broker.as_ref(), topic, partition).await
    }
}

/// Next offset of every partition according to the offset manager.
pub async fn consumer_group_offsets(
    cancel: &CancellationToken,
    broker: &dyn Broker,
    offset_manager: &dyn OffsetManager,
    topic: &Topic,
) -> Result<PartitionOffsets> {
    let partitions = broker
        .partitions(topic)
        .await
        .with_context(|| format!("get partitions of topic {topic} failed"))?;

    let mut result = PartitionOffsets::new();
    for partition in partitions {
        if cancel.is_cancelled() {
            return Err(ConsumerError::Cancelled.into());
        }
        let offset = offset_manager
            .next_offset(topic, partition)
            .await
            .with_context(|| format!("get next offset of topic {topic} partition {partition} failed"))?;
        result.insert(partition, offset);
    }
    Ok(result)
}

/// Replaces sentinel offsets by the concrete offsets the broker resolves them to.
pub async fn resolve_offsets(
    broker: &dyn Broker,
    topic: &Topic,
    offsets: &PartitionOffsets,
) -> Result<PartitionOffsets> {
    let mut result = PartitionOffsets::new();
    for (partition, offset) in offsets.iter() {
        let resolved = if offset.is_sentinel() {
            broker
                .get_offset(topic, partition, offset)
                .await
                .with_context(|| {
                    format!("resolve offset {offset} of topic {topic} partition {partition} failed")
                })?
        } else {
            offset
        };
        result.insert(partition, resolved);
    }
    Ok(result)
}

/// Drain targets: the offset of the last message present at startup, for
/// every partition that still has something to consume.
///
/// A partition is left out when it is empty, when the group starts from the
/// newest offset, or when the group already reached the high-water mark.
pub fn combine(group_offsets: &PartitionOffsets, high_water_marks: &PartitionOffsets) -> PartitionOffsets {
    let mut targets = PartitionOffsets::new();
    for (partition, high_water_mark) in high_water_marks.iter() {
        if high_water_mark.as_i64() == 0 {
            trace!(%partition, "high-water mark is 0, skip");
            continue;
        }
        let group_offset = group_offsets.get(&partition).unwrap_or_default();
        if group_offset == Offset::NEWEST {
            trace!(%partition, "group offset is newest, skip");
            continue;
        }
        if group_offset == high_water_mark {
            trace!(%partition, %group_offset, %high_water_mark, "already caught up, skip");
            continue;
        }
        targets.insert(partition, high_water_mark.prev());
    }
    targets
}

/// Computes drain targets for `topic` as seen by `offset_manager`.
pub async fn trigger_offsets(
    cancel: &CancellationToken,
    broker: &dyn Broker,
    offset_manager: &dyn OffsetManager,
    topic: &Topic,
) -> Result<PartitionOffsets> {
    let high_water_marks = high_water_marks(broker, topic)
        .await
        .context("get high-water marks failed")?;
    let group_offsets = consumer_group_offsets(cancel, broker, offset_manager, topic)
        .await
        .context("get consumer group offsets failed")?;
    debug!(%topic, group_offsets = %group_offsets, "consumer group offsets");

    // keep the newest sentinel, it means there is nothing to drain
    let mut resolvable = PartitionOffsets::new();
    let mut newest = PartitionOffsets::new();
    for (partition, offset) in group_offsets.iter() {
        if offset == Offset::NEWEST {
            newest.insert(partition, offset);
        } else {
            resolvable.insert(partition, offset);
        }
    }
    let mut resolved = resolve_offsets(broker, topic, &resolvable)
        .await
        .context("resolve consumer group offsets failed")?;
    for (partition, offset) in newest.iter() {
        resolved.insert(partition, offset);
    }
    debug!(%topic, resolved_offsets = %resolved, "resolved consumer group offsets");

    Ok(combine(&resolved, &high_water_marks))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::offset_manager::StoreOffsetManager;
    use crate::offset_store::KvOffsetStore;
    use crate::store::MemoryDb;

    fn offsets(entries: &[(i32, i64)]) -> PartitionOffsets {
        entries
            .iter()
            .map(|(p, o)| (Partition::new(*p), Offset::new(*o)))
            .collect()
    }

    #[test]
    fn test_combine_orders_scenario() {
        let high_water_marks = offsets(&[(0, 100), (1, 0)]);
        let group_offsets = offsets(&[(0, 50)]);
        assert_eq!(combine(&group_offsets, &high_water_marks), offsets(&[(0, 99)]));
    }

    #[test]
    fn test_combine_skips_newest_and_caught_up() {
        let high_water_marks = offsets(&[(0, 10), (1, 20), (2, 30)]);
        let mut group_offsets = offsets(&[(1, 20), (2, 5)]);
        group_offsets.insert(Partition::new(0), Offset::NEWEST);

        assert_eq!(combine(&group_offsets, &high_water_marks), offsets(&[(2, 29)]));
    }

    #[tokio::test]
    async fn test_trigger_offsets_from_broker() {
        let broker = MemoryBroker::new();
        let topic = Topic::from("orders");
        broker.create_topic(&topic, 3).unwrap();
        for _ in 0..100 {
            broker.produce(&topic, Partition::new(0), "k", "v").unwrap();
        }
        for _ in 0..4 {
            broker.produce(&topic, Partition::new(2), "k", "v").unwrap();
        }

        let store = KvOffsetStore::new(Arc::new(MemoryDb::new()));
        store_offset(&store, &topic, 0, 50);
        store_offset(&store, &topic, 2, 4);
        let manager = StoreOffsetManager::new(Arc::new(store), Offset::OLDEST);

        let targets = trigger_offsets(&CancellationToken::new(), &broker, &manager, &topic)
            .await
            .unwrap();
        assert_eq!(targets, offsets(&[(0, 99)]));
    }

    #[tokio::test]
    async fn test_trigger_offsets_with_newest_initial_offset() {
        let broker = MemoryBroker::new();
        let topic = Topic::from("orders");
        broker.create_topic(&topic, 1).unwrap();
        broker.produce(&topic, Partition::new(0), "k", "v").unwrap();

        let store = KvOffsetStore::new(Arc::new(MemoryDb::new()));
        let manager = StoreOffsetManager::new(Arc::new(store), Offset::NEWEST);

        let targets = trigger_offsets(&CancellationToken::new(), &broker, &manager, &topic)
            .await
            .unwrap();
        assert!(targets.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_offsets_and_provider() {
        let broker = Arc::new(MemoryBroker::new());
        let topic = Topic::from("orders");
        broker.create_topic(&topic, 1).unwrap();
        for _ in 0..3 {
            broker.produce(&topic, Partition::new(0), "k", "v").unwrap();
        }

        let mut input = PartitionOffsets::new();
        input.insert(Partition::new(0), Offset::OLDEST);
        let resolved = resolve_offsets(broker.as_ref(), &topic, &input).await.unwrap();
        assert_eq!(resolved, offsets(&[(0, 0)]));

        let provider = BrokerHighWaterMarkProvider::new(broker.clone());
        assert_eq!(
            provider.high_water_mark(&topic, Partition::new(0)).await.unwrap(),
            Offset::new(3)
        );
        assert_eq!(
            high_water_marks(broker.as_ref(), &topic).await.unwrap(),
            offsets(&[(0, 3)])
        );
    }

    #[tokio::test]
    async fn test_consumer_group_offsets_respects_cancellation() {
        let broker = MemoryBroker::new();
        let topic = Topic::from("orders");
        broker.create_topic(&topic, 1).unwrap();
        let store = KvOffsetStore::new(Arc::new(MemoryDb::new()));
        let manager = StoreOffsetManager::new(Arc::new(store), Offset::OLDEST);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = consumer_group_offsets(&cancel, &broker, &manager, &topic)
            .await
            .unwrap_err();
        assert!(crate::error::is_cancelled(&err));
    }

    fn store_offset(store: &KvOffsetStore, topic: &Topic, partition: i32, offset: i64) {
        use crate::offset_store::OffsetStore;
        store
            .set(topic, Partition::new(partition), Offset::new(offset))
            .unwrap();
    }
}
