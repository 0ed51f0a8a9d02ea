use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Consumer;
use crate::broker::{Broker, PartitionCursor};
use crate::error::is_cancelled;
use crate::handler::MessageHandler;
use crate::metrics::{KafkaMetrics, MetricsConsumer};
use crate::run::cancel_on_first_error;
use crate::types::{Offset, Partition, Topic};

/// Consumes every partition from a fixed offset, one message at a time,
/// without recording progress.
pub struct SimpleConsumer {
    broker: Arc<dyn Broker>,
    topic: Topic,
    offset: Offset,
    handler: Arc<dyn MessageHandler>,
    metrics: Arc<dyn MetricsConsumer>,
}

impl SimpleConsumer {
    pub fn new(
        broker: Arc<dyn Broker>,
        topic: Topic,
        offset: Offset,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            broker,
            topic,
            offset,
            handler,
            metrics: Arc::new(KafkaMetrics::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsConsumer>) -> Self {
        self.metrics = metrics;
        self
    }
}

#[async_trait]
impl Consumer for SimpleConsumer {
    async fn consume(&self, cancel: &CancellationToken) -> Result<()> {
        let partitions = self
            .broker
            .partitions(&self.topic)
            .await
            .with_context(|| format!("get partitions of topic {} failed", self.topic))?;
        info!(topic = %self.topic, partitions = partitions.len(), offset = %self.offset, "consume started");

        let loops = partitions.into_iter().map(|partition| {
            let broker = self.broker.clone();
            let topic = self.topic.clone();
            let handler = self.handler.clone();
            let metrics = self.metrics.clone();
            let offset = self.offset;
            move |token: CancellationToken| async move {
                let mut cursor = broker
                    .open_cursor(&topic, partition, offset)
                    .await
                    .with_context(|| {
                        format!("open cursor for topic {topic} partition {partition} at offset {offset} failed")
                    })?;
                let result = consume_partition(
                    &token,
                    &topic,
                    partition,
                    cursor.as_mut(),
                    handler.as_ref(),
                    metrics.as_ref(),
                )
                .await;
                if let Err(e) = cursor.close().await {
                    warn!(%topic, %partition, error = ?e, "close partition cursor failed");
                }
                match result {
                    Err(e) if token.is_cancelled() && is_cancelled(&e) => Ok(()),
                    result => result,
                }
            }
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

async fn consume_partition(
    cancel: &CancellationToken,
    topic: &Topic,
    partition: Partition,
    cursor: &mut dyn PartitionCursor,
    handler: &dyn MessageHandler,
    metrics: &dyn MetricsConsumer,
) -> Result<()> {
    loop {
        let msg = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(%topic, %partition, "partition consumer cancelled");
                return Ok(());
            }
            received = cursor.recv() => received
                .with_context(|| format!("consume topic {topic} partition {partition} failed"))?,
        };
        metrics.current_offset(topic, partition, msg.offset);
        metrics.high_water_mark_offset(topic, partition, cursor.high_water_mark());
        handler
            .consume_message(cancel, &msg)
            .await
            .with_context(|| {
                format!(
                    "handle message of topic {topic} partition {partition} offset {} failed",
                    msg.offset
                )
            })?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::handler::MessageHandlerFn;
    use crate::types::Message;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_consumes_from_fixed_offset() {
        let broker = Arc::new(MemoryBroker::new());
        let topic = Topic::from("orders");
        broker.create_topic(&topic, 1).unwrap();
        for i in 0..5 {
            broker
                .produce(&topic, Partition::new(0), format!("k{i}"), "v")
                .unwrap();
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let consumer = SimpleConsumer::new(
            broker.clone(),
            topic.clone(),
            Offset::new(3),
            Arc::new(MessageHandlerFn::new(move |msg: &Message| {
                recorder.lock().unwrap().push(msg.offset.as_i64());
                Ok(())
            })),
        );

        let cancel = CancellationToken::new();
        let run = {
            let cancel = cancel.clone();
            tokio::spawn(async move { consumer.consume(&cancel).await })
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            while seen.lock().unwrap().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        cancel.cancel();
        run.await.unwrap().unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![3, 4]);
    }

    #[tokio::test]
    async fn test_handler_error_is_returned() {
        let broker = Arc::new(MemoryBroker::new());
        let topic = Topic::from("orders");
        broker.create_topic(&topic, 2).unwrap();
        broker.produce(&topic, Partition::new(1), "k", "v").unwrap();

        let consumer = SimpleConsumer::new(
            broker,
            topic,
            Offset::OLDEST,
            Arc::new(MessageHandlerFn::new(|_: &Message| anyhow::bail!("boom"))),
        );

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            consumer.consume(&CancellationToken::new()),
        )
        .await
        .unwrap()
        .unwrap_err();
        let chain = format!("{err:#}");
        assert!(chain.contains("partition 1 offset 0"));
        assert!(chain.contains("boom"));
    }
}
