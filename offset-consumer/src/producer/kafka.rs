use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use tracing::{debug, error, info};

use super::{ProducerMessage, SyncProducer};
use crate::broker::KafkaClientConfigBuilder;
use crate::error::ProducerError;
use crate::types::Brokers;

/// [`SyncProducer`] backed by an rdkafka `FutureProducer`.
///
/// The producer is configured with `acks=all` and idempotence, so a send
/// returns only once every in-sync replica has the message.
pub struct KafkaSyncProducer {
    producer: FutureProducer,
    timeout: Duration,
    closed: AtomicBool,
}

impl KafkaSyncProducer {
    pub fn new(brokers: &Brokers, tls: bool, timeout: Duration) -> Result<Self, ProducerError> {
        let config = KafkaClientConfigBuilder::for_producer(brokers)
            .with_tls(tls)
            .build();
        debug!("rdkafka producer configuration: {:?}", config);
        let producer: FutureProducer = config.create()?;

        match producer.client().fetch_metadata(None, timeout) {
            Ok(metadata) => {
                info!(
                    %brokers,
                    topics = metadata.topics().len(),
                    "connected to kafka brokers"
                );
            }
            Err(e) => {
                error!(%brokers, error = ?e, "fetch metadata from kafka brokers failed");
                return Err(e.into());
            }
        }

        Ok(Self {
            producer,
            timeout,
            closed: AtomicBool::new(false),
        })
    }

    async fn send(&self, msg: &ProducerMessage) -> Result<(), ProducerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProducerError::Closed);
        }

        let mut record: FutureRecord<'_, [u8], [u8]> = FutureRecord::to(msg.topic.as_str())
            .key(msg.key.as_slice())
            .payload(msg.value.as_slice());
        if let Some(partition) = msg.partition {
            record = record.partition(partition.as_i32());
        }
        if !msg.headers.is_empty() {
            record = record.headers(msg.headers.to_kafka_headers());
        }

        self.producer
            .send(record, Timeout::After(self.timeout))
            .await
            .map_err(|(e, _)| ProducerError::Kafka(e))?;
        Ok(())
    }
}

#[async_trait]
impl SyncProducer for KafkaSyncProducer {
    async fn send_message(&self, msg: ProducerMessage) -> Result<(), ProducerError> {
        self.send(&msg).await
    }

    /// Enqueues every message before waiting, so the batch shares round trips.
    async fn send_messages(&self, msgs: Vec<ProducerMessage>) -> Result<(), ProducerError> {
        let results = join_all(msgs.iter().map(|msg| self.send(msg))).await;
        results.into_iter().collect()
    }

    async fn close(&self) -> Result<(), ProducerError> {
        self.closed.store(true, Ordering::SeqCst);
        let producer = self.producer.clone();
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|_| ProducerError::Closed)??;
        info!("kafka producer flushed and closed");
        Ok(())
    }
}
