use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{ProducerMessage, SyncProducer};
use crate::error::ProducerError;
use crate::metrics::MetricsSyncProducer;
use crate::types::{Header, Topic};

/// Header carrying the name of the service that produced a message.
pub const HEADER_PRODUCER_NAME: &str = "producer-name";

/// Counts every sent message as total and as success or failure, labelled
/// by topic.
pub struct SyncProducerMetrics {
    inner: Arc<dyn SyncProducer>,
    metrics: Arc<dyn MetricsSyncProducer>,
}

impl SyncProducerMetrics {
    pub fn new(inner: Arc<dyn SyncProducer>, metrics: Arc<dyn MetricsSyncProducer>) -> Self {
        Self { inner, metrics }
    }

    fn record(&self, topic: &Topic, result: &Result<(), ProducerError>) {
        self.metrics.total_counter_inc(topic);
        match result {
            Ok(()) => self.metrics.success_counter_inc(topic),
            Err(_) => self.metrics.failure_counter_inc(topic),
        }
    }
}

#[async_trait]
impl SyncProducer for SyncProducerMetrics {
    async fn send_message(&self, msg: ProducerMessage) -> Result<(), ProducerError> {
        let topic = msg.topic.clone();
        let result = self.inner.send_message(msg).await;
        self.record(&topic, &result);
        result
    }

    /// A failed batch counts every message of it as failed.
    async fn send_messages(&self, msgs: Vec<ProducerMessage>) -> Result<(), ProducerError> {
        let topics: Vec<Topic> = msgs.iter().map(|msg| msg.topic.clone()).collect();
        let result = self.inner.send_messages(msgs).await;
        topics.iter().for_each(|topic| self.record(topic, &result));
        result
    }

    async fn close(&self) -> Result<(), ProducerError> {
        self.inner.close().await
    }
}

/// Rewrites every message before it is sent.
pub struct SyncProducerModify<F> {
    inner: Arc<dyn SyncProducer>,
    modify: F,
}

impl<F> SyncProducerModify<F>
where
    F: Fn(&mut ProducerMessage) + Send + Sync,
{
    pub fn new(inner: Arc<dyn SyncProducer>, modify: F) -> Self {
        Self { inner, modify }
    }
}

#[async_trait]
impl<F> SyncProducer for SyncProducerModify<F>
where
    F: Fn(&mut ProducerMessage) + Send + Sync,
{
    async fn send_message(&self, mut msg: ProducerMessage) -> Result<(), ProducerError> {
        (self.modify)(&mut msg);
        self.inner.send_message(msg).await
    }

    async fn send_messages(&self, mut msgs: Vec<ProducerMessage>) -> Result<(), ProducerError> {
        msgs.iter_mut().for_each(|msg| (self.modify)(msg));
        self.inner.send_messages(msgs).await
    }

    async fn close(&self) -> Result<(), ProducerError> {
        self.inner.close().await
    }
}

/// Adds a fixed set of headers to every message. Existing values of the
/// same keys are replaced.
pub struct SyncProducerHeader {
    inner: Arc<dyn SyncProducer>,
    header: Header,
}

impl SyncProducerHeader {
    pub fn new(inner: Arc<dyn SyncProducer>, header: Header) -> Self {
        Self { inner, header }
    }

    pub fn with_header(
        inner: Arc<dyn SyncProducer>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        let mut header = Header::new();
        header.add(key, value);
        Self::new(inner, header)
    }

    /// Tags every message with the producing service's name.
    pub fn with_name(inner: Arc<dyn SyncProducer>, name: impl Into<String>) -> Self {
        Self::with_header(inner, HEADER_PRODUCER_NAME, name)
    }

    fn apply(&self, msg: &mut ProducerMessage) {
        for key in self.header.keys() {
            msg.headers
                .set(key, self.header.get_all(key).to_vec());
        }
    }
}

#[async_trait]
impl SyncProducer for SyncProducerHeader {
    async fn send_message(&self, mut msg: ProducerMessage) -> Result<(), ProducerError> {
        self.apply(&mut msg);
        self.inner.send_message(msg).await
    }

    async fn send_messages(&self, mut msgs: Vec<ProducerMessage>) -> Result<(), ProducerError> {
        msgs.iter_mut().for_each(|msg| self.apply(msg));
        self.inner.send_messages(msgs).await
    }

    async fn close(&self) -> Result<(), ProducerError> {
        self.inner.close().await
    }
}

/// Drops every message.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopSyncProducer;

#[async_trait]
impl SyncProducer for NopSyncProducer {
    async fn send_message(&self, msg: ProducerMessage) -> Result<(), ProducerError> {
        debug!(topic = %msg.topic, "message dropped by nop producer");
        Ok(())
    }

    async fn close(&self) -> Result<(), ProducerError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::CountingMetrics;
    use crate::metrics_consts::{SYNC_PRODUCER_FAILURE, SYNC_PRODUCER_SUCCESS, SYNC_PRODUCER_TOTAL};
    use crate::producer::testing::RecordingProducer;

    #[tokio::test]
    async fn test_metrics_counts_success_and_failure() {
        let inner = Arc::new(RecordingProducer::failing("broken"));
        let metrics = Arc::new(CountingMetrics::new());
        let producer = SyncProducerMetrics::new(inner.clone(), metrics.clone());

        producer
            .send_message(ProducerMessage::new(Topic::from("orders"), "k", "v"))
            .await
            .unwrap();
        producer
            .send_message(ProducerMessage::new(Topic::from("broken"), "k", "v"))
            .await
            .unwrap_err();

        let orders = Topic::from("orders");
        let broken = Topic::from("broken");
        assert_eq!(metrics.value(SYNC_PRODUCER_TOTAL, &orders, None), 1.0);
        assert_eq!(metrics.value(SYNC_PRODUCER_SUCCESS, &orders, None), 1.0);
        assert_eq!(metrics.value(SYNC_PRODUCER_TOTAL, &broken, None), 1.0);
        assert_eq!(metrics.value(SYNC_PRODUCER_FAILURE, &broken, None), 1.0);
        assert_eq!(metrics.value(SYNC_PRODUCER_SUCCESS, &broken, None), 0.0);
    }

    #[tokio::test]
    async fn test_metrics_counts_each_message_of_a_batch() {
        let inner = Arc::new(RecordingProducer::default());
        let metrics = Arc::new(CountingMetrics::new());
        let producer = SyncProducerMetrics::new(inner.clone(), metrics.clone());
        let topic = Topic::from("orders");

        producer
            .send_messages(vec![
                ProducerMessage::new(topic.clone(), "a", "1"),
                ProducerMessage::new(topic.clone(), "b", "2"),
            ])
            .await
            .unwrap();

        assert_eq!(metrics.value(SYNC_PRODUCER_SUCCESS, &topic, None), 2.0);
        assert_eq!(inner.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_modify_rewrites_messages() {
        let inner = Arc::new(RecordingProducer::default());
        let producer = SyncProducerModify::new(inner.clone(), |msg: &mut ProducerMessage| {
            msg.topic = Topic::from("orders-v2");
        });

        producer
            .send_messages(vec![ProducerMessage::new(Topic::from("orders"), "a", "1")])
            .await
            .unwrap();

        assert_eq!(inner.sent()[0].topic, Topic::from("orders-v2"));
    }

    #[tokio::test]
    async fn test_header_replaces_existing_values() {
        let inner = Arc::new(RecordingProducer::default());
        let producer = SyncProducerHeader::with_name(inner.clone(), "order-sync");

        let mut headers = Header::new();
        headers.add(HEADER_PRODUCER_NAME, "someone-else");
        headers.add("trace", "abc");
        producer
            .send_message(ProducerMessage::new(Topic::from("orders"), "a", "1").with_headers(headers))
            .await
            .unwrap();

        let sent = inner.sent();
        assert_eq!(sent[0].headers.get_all(HEADER_PRODUCER_NAME), ["order-sync"]);
        assert_eq!(sent[0].headers.get("trace"), Some("abc"));
    }

    #[tokio::test]
    async fn test_nop_drops_messages() {
        let producer = NopSyncProducer;
        producer
            .send_message(ProducerMessage::new(Topic::from("orders"), "a", "1"))
            .await
            .unwrap();
        producer.close().await.unwrap();
    }
}
