use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::partition::PartitionLoop;
use super::Consumer;
use crate::broker::Broker;
use crate::error::is_cancelled;
use crate::handler::{BatchFromSingle, MessageHandler, MessageHandlerBatch};
use crate::log_sampler::{SamplerFactory, TimeSamplerFactory};
use crate::metrics::{KafkaMetrics, MetricsConsumer};
use crate::offset_manager::OffsetManager;
use crate::run::cancel_on_first_error;
use crate::types::{BatchSize, Topic};

/// Consumes every partition of a topic, resuming where the offset manager
/// says and marking progress after each handled batch.
pub struct OffsetConsumer {
    broker: Arc<dyn Broker>,
    topic: Topic,
    offset_manager: Arc<dyn OffsetManager>,
    handler: Arc<dyn MessageHandlerBatch>,
    batch_size: BatchSize,
    metrics: Arc<dyn MetricsConsumer>,
    sampler_factory: Arc<dyn SamplerFactory>,
}

impl OffsetConsumer {
    /// Handles one message at a time.
    pub fn new(
        broker: Arc<dyn Broker>,
        topic: Topic,
        offset_manager: Arc<dyn OffsetManager>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self::new_batch(
            broker,
            topic,
            offset_manager,
            Arc::new(BatchFromSingle::new(handler)),
            BatchSize::default(),
        )
    }

    pub fn new_batch(
        broker: Arc<dyn Broker>,
        topic: Topic,
        offset_manager: Arc<dyn OffsetManager>,
        handler: Arc<dyn MessageHandlerBatch>,
        batch_size: BatchSize,
    ) -> Self {
        Self {
            broker,
            topic,
            offset_manager,
            handler,
            batch_size,
            metrics: Arc::new(KafkaMetrics::new()),
            sampler_factory: Arc::new(TimeSamplerFactory::default()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsConsumer>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Sampling of the per-batch progress log. Each partition gets its own sampler.
    pub fn with_sampler_factory(mut self, sampler_factory: Arc<dyn SamplerFactory>) -> Self {
        self.sampler_factory = sampler_factory;
        self
    }
}

#[async_trait]
impl Consumer for OffsetConsumer {
    async fn consume(&self, cancel: &CancellationToken) -> Result<()> {
        self.batch_size.validate()?;
        let partitions = self
            .broker
            .partitions(&self.topic)
            .await
            .with_context(|| format!("get partitions of topic {} failed", self.topic))?;
        info!(
            topic = %self.topic,
            partitions = partitions.len(),
            batch_size = %self.batch_size,
            "consume started"
        );

        let loops = partitions.into_iter().map(|partition| {
            let worker = PartitionLoop {
                broker: self.broker.clone(),
                topic: self.topic.clone(),
                partition,
                offset_manager: self.offset_manager.clone(),
                handler: self.handler.clone(),
                batch_size: self.batch_size,
                metrics: self.metrics.clone(),
                sampler: self.sampler_factory.sampler(),
            };
            move |token: CancellationToken| worker.run(token)
        });

        match cancel_on_first_error(cancel, loops).await {
            Err(e) if !is_cancelled(&e) => Err(e),
            _ => {
                info!(topic = %self.topic, "consume completed");
                Ok(())
            }
        }
    }
}
