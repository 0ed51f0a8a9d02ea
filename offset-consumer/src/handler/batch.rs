use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{ensure_not_cancelled, MessageHandler, MessageHandlerBatch};
use crate::log_sampler::LogSampler;
use crate::metrics::MetricsMessageHandler;
use crate::types::Message;

/// Batch handler feeding each message to a single-message handler in order.
pub struct BatchFromSingle {
    handler: Arc<dyn MessageHandler>,
}

impl BatchFromSingle {
    pub fn new(handler: Arc<dyn MessageHandler>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl MessageHandlerBatch for BatchFromSingle {
    async fn consume_messages(&self, cancel: &CancellationToken, msgs: &[Message]) -> Result<()> {
        for msg in msgs {
            ensure_not_cancelled(cancel)?;
            self.handler.consume_message(cancel, msg).await?;
        }
        Ok(())
    }
}

pub struct MessageHandlerBatchFn<F> {
    func: F,
}

impl<F> MessageHandlerBatchFn<F>
where
    F: Fn(&[Message]) -> Result<()> + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F> MessageHandlerBatch for MessageHandlerBatchFn<F>
where
    F: Fn(&[Message]) -> Result<()> + Send + Sync,
{
    async fn consume_messages(&self, _cancel: &CancellationToken, msgs: &[Message]) -> Result<()> {
        (self.func)(msgs)
    }
}

pub struct MessageHandlerBatchList {
    handlers: Vec<Arc<dyn MessageHandlerBatch>>,
}

impl MessageHandlerBatchList {
    pub fn new(handlers: Vec<Arc<dyn MessageHandlerBatch>>) -> Self {
        Self { handlers }
    }
}

#[async_trait]
impl MessageHandlerBatch for MessageHandlerBatchList {
    async fn consume_messages(&self, cancel: &CancellationToken, msgs: &[Message]) -> Result<()> {
        for handler in &self.handlers {
            ensure_not_cancelled(cancel)?;
            handler.consume_messages(cancel, msgs).await?;
        }
        Ok(())
    }
}

/// Reports one total/success/failure count and one duration per batch,
/// labelled with the batch's topic and partition.
pub struct MessageHandlerBatchMetrics {
    handler: Arc<dyn MessageHandlerBatch>,
    metrics: Arc<dyn MetricsMessageHandler>,
}

impl MessageHandlerBatchMetrics {
    pub fn new(
        handler: Arc<dyn MessageHandlerBatch>,
        metrics: Arc<dyn MetricsMessageHandler>,
    ) -> Self {
        Self { handler, metrics }
    }
}

#[async_trait]
impl MessageHandlerBatch for MessageHandlerBatchMetrics {
    async fn consume_messages(&self, cancel: &CancellationToken, msgs: &[Message]) -> Result<()> {
        let Some(first) = msgs.first() else {
            return self.handler.consume_messages(cancel, msgs).await;
        };
        self.metrics.total_counter_inc(&first.topic, first.partition);
        let start = Instant::now();
        let result = self.handler.consume_messages(cancel, msgs).await;
        self.metrics
            .duration_measure(&first.topic, first.partition, start.elapsed());
        match &result {
            Ok(()) => self.metrics.success_counter_inc(&first.topic, first.partition),
            Err(_) => self.metrics.failure_counter_inc(&first.topic, first.partition),
        }
        result
    }
}

pub struct MessageHandlerBatchSkipErrors {
    handler: Arc<dyn MessageHandlerBatch>,
    sampler: Arc<dyn LogSampler>,
}

impl MessageHandlerBatchSkipErrors {
    pub fn new(handler: Arc<dyn MessageHandlerBatch>, sampler: Arc<dyn LogSampler>) -> Self {
        Self { handler, sampler }
    }
}

#[async_trait]
impl MessageHandlerBatch for MessageHandlerBatchSkipErrors {
    async fn consume_messages(&self, cancel: &CancellationToken, msgs: &[Message]) -> Result<()> {
        if let Err(e) = self.handler.consume_messages(cancel, msgs).await {
            if let (Some(first), Some(last)) = (msgs.first(), msgs.last()) {
                if self.sampler.is_sample() {
                    warn!(
                        topic = %first.topic,
                        partition = %first.partition,
                        first_offset = %first.offset,
                        last_offset = %last.offset,
                        batch_size = msgs.len(),
                        error = ?e,
                        "handle batch failed, skipping"
                    );
                }
            }
        }
        Ok(())
    }
}
