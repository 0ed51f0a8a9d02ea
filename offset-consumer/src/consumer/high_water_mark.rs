use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{Consumer, OffsetConsumer};
use crate::broker::Broker;
use crate::handler::{MessageHandlerBatch, MessageHandlerBatchList, OffsetTriggerMessageHandler};
use crate::log_sampler::{SamplerFactory, TimeSamplerFactory};
use crate::metrics::{KafkaMetrics, MetricsConsumer};
use crate::offset_manager::OffsetManager;
use crate::offsets::trigger_offsets;
use crate::run::Fire;
use crate::types::{BatchSize, PartitionOffsets, Topic};

/// [`OffsetConsumer`] that fires `trigger` once it consumed everything the
/// topic held when [`Consumer::consume`] was called.
///
/// The trigger only signals. Passing the consumer's own cancellation token as
/// the trigger stops consuming once drained; the batch that crossed the last
/// target still completes and is marked before the partitions stop.
pub struct HighWaterMarkConsumer {
    broker: Arc<dyn Broker>,
    topic: Topic,
    offset_manager: Arc<dyn OffsetManager>,
    handler: Arc<dyn MessageHandlerBatch>,
    batch_size: BatchSize,
    trigger: Arc<dyn Fire>,
    metrics: Arc<dyn MetricsConsumer>,
    sampler_factory: Arc<dyn SamplerFactory>,
}

impl HighWaterMarkConsumer {
    pub fn new(
        broker: Arc<dyn Broker>,
        topic: Topic,
        offset_manager: Arc<dyn OffsetManager>,
        handler: Arc<dyn MessageHandlerBatch>,
        batch_size: BatchSize,
        trigger: Arc<dyn Fire>,
    ) -> Self {
        Self {
            broker,
            topic,
            offset_manager,
            handler,
            batch_size,
            trigger,
            metrics: Arc::new(KafkaMetrics::new()),
            sampler_factory: Arc::new(TimeSamplerFactory::default()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsConsumer>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_sampler_factory(mut self, sampler_factory: Arc<dyn SamplerFactory>) -> Self {
        self.sampler_factory = sampler_factory;
        self
    }

    /// Runs the handler first, then the trigger, so a batch is applied
    /// before it can fire.
    fn with_trigger(&self, targets: &PartitionOffsets) -> Arc<dyn MessageHandlerBatch> {
        let trigger: Arc<dyn MessageHandlerBatch> = Arc::new(OffsetTriggerMessageHandler::new(
            targets,
            self.topic.clone(),
            self.trigger.clone(),
        ));
        Arc::new(MessageHandlerBatchList::new(vec![self.handler.clone(), trigger]))
    }
}

#[async_trait]
impl Consumer for HighWaterMarkConsumer {
    async fn consume(&self, cancel: &CancellationToken) -> Result<()> {
        let targets = trigger_offsets(
            cancel,
            self.broker.as_ref(),
            self.offset_manager.as_ref(),
            &self.topic,
        )
        .await
        .with_context(|| format!("compute trigger offsets of topic {} failed", self.topic))?;
        info!(topic = %self.topic, trigger_offsets = %targets, "trigger offsets computed");

        OffsetConsumer::new_batch(
            self.broker.clone(),
            self.topic.clone(),
            self.offset_manager.clone(),
            self.with_trigger(&targets),
            self.batch_size,
        )
        .with_metrics(self.metrics.clone())
        .with_sampler_factory(self.sampler_factory.clone())
        .consume(cancel)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::handler::MessageHandlerBatchFn;
    use crate::offset_manager::StoreOffsetManager;
    use crate::offset_store::KvOffsetStore;
    use crate::store::MemoryDb;
    use crate::types::{Message, Offset, Partition};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_stops_once_drained() {
        let broker = Arc::new(MemoryBroker::new());
        let topic = Topic::from("orders");
        broker.create_topic(&topic, 2).unwrap();
        for i in 0..10 {
            broker
                .produce(&topic, Partition::new(i % 2), format!("k{i}"), "v")
                .unwrap();
        }
        let store = KvOffsetStore::new(Arc::new(MemoryDb::new()));
        let manager: Arc<dyn OffsetManager> =
            Arc::new(StoreOffsetManager::new(Arc::new(store), Offset::OLDEST));

        let handled = Arc::new(AtomicUsize::new(0));
        let counter = handled.clone();
        let cancel = CancellationToken::new();
        let consumer = HighWaterMarkConsumer::new(
            broker.clone(),
            topic.clone(),
            manager.clone(),
            Arc::new(MessageHandlerBatchFn::new(move |msgs: &[Message]| {
                counter.fetch_add(msgs.len(), Ordering::SeqCst);
                Ok(())
            })),
            BatchSize::new(3).unwrap(),
            Arc::new(cancel.clone()),
        );

        tokio::time::timeout(Duration::from_secs(5), consumer.consume(&cancel))
            .await
            .unwrap()
            .unwrap();

        assert!(cancel.is_cancelled());
        assert_eq!(handled.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_batch_crossing_last_target_is_applied_and_succeeds() {
        let broker = Arc::new(MemoryBroker::new());
        let topic = Topic::from("orders");
        let store = KvOffsetStore::new(Arc::new(MemoryDb::new()));
        let manager: Arc<dyn OffsetManager> =
            Arc::new(StoreOffsetManager::new(Arc::new(store), Offset::OLDEST));
        let handled = Arc::new(AtomicUsize::new(0));
        let counter = handled.clone();
        let cancel = CancellationToken::new();
        let consumer = HighWaterMarkConsumer::new(
            broker,
            topic.clone(),
            manager,
            Arc::new(MessageHandlerBatchFn::new(move |msgs: &[Message]| {
                counter.fetch_add(msgs.len(), Ordering::SeqCst);
                Ok(())
            })),
            BatchSize::default(),
            Arc::new(cancel.clone()),
        );

        // messages produced after the targets were taken arrive in the same batch
        let targets: PartitionOffsets = [(Partition::new(0), Offset::new(1))].into_iter().collect();
        let batch: Vec<Message> = (0..3)
            .map(|offset| Message::new(topic.clone(), Partition::new(0), Offset::new(offset), "k", "v"))
            .collect();
        consumer
            .with_trigger(&targets)
            .consume_messages(&cancel, &batch)
            .await
            .unwrap();

        assert!(cancel.is_cancelled());
        assert_eq!(handled.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_empty_topic_fires_immediately() {
        let broker = Arc::new(MemoryBroker::new());
        let topic = Topic::from("orders");
        broker.create_topic(&topic, 3).unwrap();
        let store = KvOffsetStore::new(Arc::new(MemoryDb::new()));
        let manager: Arc<dyn OffsetManager> =
            Arc::new(StoreOffsetManager::new(Arc::new(store), Offset::OLDEST));
        let cancel = CancellationToken::new();
        let consumer = HighWaterMarkConsumer::new(
            broker,
            topic,
            manager,
            Arc::new(MessageHandlerBatchFn::new(|_: &[Message]| Ok(()))),
            BatchSize::default(),
            Arc::new(cancel.clone()),
        );

        tokio::time::timeout(Duration::from_secs(5), consumer.consume(&cancel))
            .await
            .unwrap()
            .unwrap();
        assert!(cancel.is_cancelled());
    }
}
