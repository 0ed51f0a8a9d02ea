use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{ensure_not_cancelled, MessageHandler};
use crate::log_sampler::LogSampler;
use crate::metrics::MetricsMessageHandler;
use crate::types::Message;

/// Handler from a closure.
pub struct MessageHandlerFn<F> {
    func: F,
}

impl<F> MessageHandlerFn<F>
where
    F: Fn(&Message) -> Result<()> + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F> MessageHandler for MessageHandlerFn<F>
where
    F: Fn(&Message) -> Result<()> + Send + Sync,
{
    async fn consume_message(&self, _cancel: &CancellationToken, msg: &Message) -> Result<()> {
        (self.func)(msg)
    }
}

/// Runs every handler in order, stopping at the first failure.
pub struct MessageHandlerList {
    handlers: Vec<Arc<dyn MessageHandler>>,
}

impl MessageHandlerList {
    pub fn new(handlers: Vec<Arc<dyn MessageHandler>>) -> Self {
        Self { handlers }
    }
}

#[async_trait]
impl MessageHandler for MessageHandlerList {
    async fn consume_message(&self, cancel: &CancellationToken, msg: &Message) -> Result<()> {
        for handler in &self.handlers {
            ensure_not_cancelled(cancel)?;
            handler.consume_message(cancel, msg).await?;
        }
        Ok(())
    }
}

pub struct MessageHandlerMetrics {
    handler: Arc<dyn MessageHandler>,
    metrics: Arc<dyn MetricsMessageHandler>,
}

impl MessageHandlerMetrics {
    pub fn new(handler: Arc<dyn MessageHandler>, metrics: Arc<dyn MetricsMessageHandler>) -> Self {
        Self { handler, metrics }
    }
}

#[async_trait]
impl MessageHandler for MessageHandlerMetrics {
    async fn consume_message(&self, cancel: &CancellationToken, msg: &Message) -> Result<()> {
        self.metrics.total_counter_inc(&msg.topic, msg.partition);
        let start = Instant::now();
        let result = self.handler.consume_message(cancel, msg).await;
        self.metrics
            .duration_measure(&msg.topic, msg.partition, start.elapsed());
        match &result {
            Ok(()) => self.metrics.success_counter_inc(&msg.topic, msg.partition),
            Err(_) => self.metrics.failure_counter_inc(&msg.topic, msg.partition),
        }
        result
    }
}

/// Logs failures of the wrapped handler, sampled, and reports success.
pub struct MessageHandlerSkipErrors {
    handler: Arc<dyn MessageHandler>,
    sampler: Arc<dyn LogSampler>,
}

impl MessageHandlerSkipErrors {
    pub fn new(handler: Arc<dyn MessageHandler>, sampler: Arc<dyn LogSampler>) -> Self {
        Self { handler, sampler }
    }
}

#[async_trait]
impl MessageHandler for MessageHandlerSkipErrors {
    async fn consume_message(&self, cancel: &CancellationToken, msg: &Message) -> Result<()> {
        if let Err(e) = self.handler.consume_message(cancel, msg).await {
            if self.sampler.is_sample() {
                warn!(
                    topic = %msg.topic,
                    partition = %msg.partition,
                    offset = %msg.offset,
                    error = ?e,
                    "handle message failed, skipping"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_cancelled;
    use crate::log_sampler::AlwaysSampler;
    use crate::metrics::CountingMetrics;
    use crate::metrics_consts::{MESSAGE_HANDLER_FAILURE, MESSAGE_HANDLER_SUCCESS, MESSAGE_HANDLER_TOTAL};
    use crate::types::{Offset, Partition, Topic};
    use std::sync::Mutex;

    fn message(offset: i64) -> Message {
        Message::new(Topic::from("orders"), Partition::new(0), Offset::new(offset), "k", "v")
    }

    fn recording(seen: Arc<Mutex<Vec<String>>>, name: &'static str) -> Arc<dyn MessageHandler> {
        Arc::new(MessageHandlerFn::new(move |msg: &Message| {
            seen.lock().unwrap().push(format!("{name}:{}", msg.offset));
            Ok(())
        }))
    }

    fn failing() -> Arc<dyn MessageHandler> {
        Arc::new(MessageHandlerFn::new(|_: &Message| anyhow::bail!("boom")))
    }

    #[tokio::test]
    async fn test_list_runs_in_order_and_stops_at_failure() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let list = MessageHandlerList::new(vec![
            recording(seen.clone(), "a"),
            failing(),
            recording(seen.clone(), "b"),
        ]);

        let err = list
            .consume_message(&CancellationToken::new(), &message(3))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert_eq!(*seen.lock().unwrap(), vec!["a:3".to_string()]);
    }

    #[tokio::test]
    async fn test_list_respects_cancellation() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let list = MessageHandlerList::new(vec![recording(seen.clone(), "a")]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = list.consume_message(&cancel, &message(0)).await.unwrap_err();
        assert!(is_cancelled(&err));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_metrics_counts_outcomes() {
        let metrics = Arc::new(CountingMetrics::new());
        let ok = MessageHandlerMetrics::new(recording(Arc::default(), "a"), metrics.clone());
        let bad = MessageHandlerMetrics::new(failing(), metrics.clone());
        let cancel = CancellationToken::new();

        ok.consume_message(&cancel, &message(0)).await.unwrap();
        bad.consume_message(&cancel, &message(1)).await.unwrap_err();

        let topic = Topic::from("orders");
        let partition = Some(Partition::new(0));
        assert_eq!(metrics.value(MESSAGE_HANDLER_TOTAL, &topic, partition), 2.0);
        assert_eq!(metrics.value(MESSAGE_HANDLER_SUCCESS, &topic, partition), 1.0);
        assert_eq!(metrics.value(MESSAGE_HANDLER_FAILURE, &topic, partition), 1.0);
    }

    #[tokio::test]
    async fn test_skip_errors_swallows_but_failure_is_counted() {
        let metrics = Arc::new(CountingMetrics::new());
        let handler = MessageHandlerSkipErrors::new(
            Arc::new(MessageHandlerMetrics::new(failing(), metrics.clone())),
            Arc::new(AlwaysSampler),
        );

        handler
            .consume_message(&CancellationToken::new(), &message(0))
            .await
            .unwrap();
        assert_eq!(
            metrics.value(MESSAGE_HANDLER_FAILURE, &Topic::from("orders"), Some(Partition::new(0))),
            1.0
        );
    }
}
