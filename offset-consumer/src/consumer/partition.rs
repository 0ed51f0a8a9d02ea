use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::broker::{Broker, PartitionCursor};
use crate::error::is_cancelled;
use crate::handler::MessageHandlerBatch;
use crate::log_sampler::LogSampler;
use crate::metrics::MetricsConsumer;
use crate::offset_manager::OffsetManager;
use crate::types::{BatchSize, Message, Offset, Partition, Topic};

enum PartitionState {
    Starting,
    /// The stored offset is no longer retained; reopen once at the initial offset.
    ErrorFallback { requested: Offset },
    Streaming {
        cursor: Box<dyn PartitionCursor>,
        offset: Offset,
        fell_back: bool,
    },
    Closed,
}

/// How a streaming cursor ended without error.
enum Streamed {
    Stopped,
    /// The first read was outside the retained range.
    OutOfRange,
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PartitionState::Starting => "starting",
            PartitionState::ErrorFallback { .. } => "error_fallback",
            PartitionState::Streaming { .. } => "streaming",
            PartitionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Consumption loop of one partition.
///
/// Pulls batches from the cursor, hands them to the handler and marks
/// `last offset + 1` once the handler succeeded. Returns `Ok` when the token
/// is cancelled and an annotated error on the first broker or handler
/// failure.
pub(super) struct PartitionLoop {
    pub(super) broker: Arc<dyn Broker>,
    pub(super) topic: Topic,
    pub(super) partition: Partition,
    pub(super) offset_manager: Arc<dyn OffsetManager>,
    pub(super) handler: Arc<dyn MessageHandlerBatch>,
    pub(super) batch_size: BatchSize,
    pub(super) metrics: Arc<dyn MetricsConsumer>,
    pub(super) sampler: Arc<dyn LogSampler>,
}

impl PartitionLoop {
    pub(super) async fn run(self, cancel: CancellationToken) -> Result<()> {
        match self.run_states(&cancel).await {
            Err(e) if cancel.is_cancelled() && is_cancelled(&e) => {
                debug!(topic = %self.topic, partition = %self.partition, "partition consumer cancelled");
                Ok(())
            }
            result => result,
        }
    }

    async fn run_states(&self, cancel: &CancellationToken) -> Result<()> {
        let mut state = PartitionState::Starting;
        loop {
            trace!(topic = %self.topic, partition = %self.partition, %state, "partition state");
            state = match state {
                PartitionState::Starting => {
                    if cancel.is_cancelled() {
                        PartitionState::Closed
                    } else {
                        self.start().await?
                    }
                }
                PartitionState::ErrorFallback { requested } => self.fall_back(requested).await?,
                PartitionState::Streaming {
                    mut cursor,
                    offset,
                    fell_back,
                } => {
                    let result = self.stream(cancel, cursor.as_mut(), !fell_back).await;
                    if let Err(e) = cursor.close().await {
                        warn!(
                            topic = %self.topic,
                            partition = %self.partition,
                            error = ?e,
                            "close partition cursor failed"
                        );
                    }
                    match result? {
                        Streamed::Stopped => PartitionState::Closed,
                        Streamed::OutOfRange => PartitionState::ErrorFallback { requested: offset },
                    }
                }
                PartitionState::Closed => return Ok(()),
            };
        }
    }

    async fn start(&self) -> Result<PartitionState> {
        let offset = self
            .offset_manager
            .next_offset(&self.topic, self.partition)
            .await
            .with_context(|| {
                format!(
                    "get next offset for topic {} partition {} failed",
                    self.topic, self.partition
                )
            })?;

        match self
            .broker
            .open_cursor(&self.topic, self.partition, offset)
            .await
        {
            Ok(cursor) => {
                debug!(topic = %self.topic, partition = %self.partition, %offset, "cursor opened");
                Ok(PartitionState::Streaming {
                    cursor,
                    offset,
                    fell_back: false,
                })
            }
            Err(e) if e.is_offset_out_of_range() => Ok(PartitionState::ErrorFallback { requested: offset }),
            Err(e) => Err(e).with_context(|| {
                format!(
                    "open cursor for topic {} partition {} at offset {offset} failed",
                    self.topic, self.partition
                )
            }),
        }
    }

    async fn fall_back(&self, requested: Offset) -> Result<PartitionState> {
        let initial = self.offset_manager.initial_offset();
        warn!(
            topic = %self.topic,
            partition = %self.partition,
            offset = %requested,
            initial_offset = %initial,
            "offset out of range, falling back to initial offset"
        );
        self.metrics.offset_fallback(&self.topic, self.partition);

        let cursor = self
            .broker
            .open_cursor(&self.topic, self.partition, initial)
            .await
            .with_context(|| {
                format!(
                    "open cursor for topic {} partition {} at initial offset {initial} failed",
                    self.topic, self.partition
                )
            })?;
        Ok(PartitionState::Streaming {
            cursor,
            offset: initial,
            fell_back: true,
        })
    }

    /// Consumes until cancelled. An out-of-range error on the very first read
    /// is reported as [`Streamed::OutOfRange`] when `may_fall_back`; any later
    /// one is fatal, since messages would be skipped.
    async fn stream(
        &self,
        cancel: &CancellationToken,
        cursor: &mut dyn PartitionCursor,
        may_fall_back: bool,
    ) -> Result<Streamed> {
        let max = self.batch_size.get();
        let mut received_any = false;
        loop {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Streamed::Stopped),
                received = cursor.recv() => received,
            };
            let first = match received {
                Err(e) if may_fall_back && !received_any && e.is_offset_out_of_range() => {
                    return Ok(Streamed::OutOfRange);
                }
                received => received.with_context(|| {
                    format!("consume topic {} partition {} failed", self.topic, self.partition)
                })?,
            };
            received_any = true;

            // A read error ends the batch; what was already received is handled first.
            let mut batch = Vec::with_capacity(max);
            batch.push(first);
            let mut failed = None;
            while batch.len() < max {
                match cursor.try_recv() {
                    Ok(Some(msg)) => batch.push(msg),
                    Ok(None) => break,
                    Err(e) => {
                        failed = Some(e);
                        break;
                    }
                }
            }

            self.handle(cancel, &batch, cursor.high_water_mark()).await?;
            if let Some(e) = failed {
                return Err(e).with_context(|| {
                    format!("consume topic {} partition {} failed", self.topic, self.partition)
                });
            }
        }
    }

    async fn handle(&self, cancel: &CancellationToken, batch: &[Message], high_water_mark: Offset) -> Result<()> {
        let (Some(first), Some(last)) = (batch.first(), batch.last()) else {
            return Ok(());
        };
        self.metrics
            .current_offset(&self.topic, self.partition, last.offset);
        self.metrics
            .high_water_mark_offset(&self.topic, self.partition, high_water_mark);

        self.handler
            .consume_messages(cancel, batch)
            .await
            .with_context(|| {
                format!(
                    "handle messages of topic {} partition {} offsets {}..={} failed",
                    self.topic, self.partition, first.offset, last.offset
                )
            })?;

        let next = last.offset.next();
        self.offset_manager
            .mark_offset(&self.topic, self.partition, next)
            .await
            .with_context(|| {
                format!(
                    "mark offset {next} for topic {} partition {} failed",
                    self.topic, self.partition
                )
            })?;

        if self.sampler.is_sample() {
            info!(
                topic = %self.topic,
                partition = %self.partition,
                offset = %last.offset,
                high_water_mark = %high_water_mark,
                lag = high_water_mark.as_i64() - next.as_i64(),
                batch_size = batch.len(),
                "batch consumed"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{ChannelCursor, GroupOffsetCoordinator};
    use crate::error::BrokerError;
    use crate::handler::MessageHandlerBatchFn;
    use crate::log_sampler::AlwaysSampler;
    use crate::metrics::CountingMetrics;
    use crate::metrics_consts::CONSUMER_OFFSET_FALLBACK;
    use crate::offset_manager::StoreOffsetManager;
    use crate::offset_store::{KvOffsetStore, OffsetStore};
    use crate::store::MemoryDb;
    use crate::types::{Group, Partitions};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    type Script = Vec<Result<Message, BrokerError>>;

    /// Hands out one scripted cursor per open, in order.
    struct ScriptedBroker {
        scripts: Mutex<VecDeque<Script>>,
        opened: Mutex<Vec<Offset>>,
    }

    impl ScriptedBroker {
        fn new(scripts: Vec<Script>) -> Self {
            Self {
                scripts: Mutex::new(scripts.into()),
                opened: Mutex::new(Vec::new()),
            }
        }

        fn opened(&self) -> Vec<Offset> {
            self.opened.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Broker for ScriptedBroker {
        async fn partitions(&self, _topic: &Topic) -> Result<Partitions, BrokerError> {
            Ok(vec![Partition::new(0)])
        }

        async fn get_offset(
            &self,
            _topic: &Topic,
            _partition: Partition,
            offset: Offset,
        ) -> Result<Offset, BrokerError> {
            Ok(offset)
        }

        async fn open_cursor(
            &self,
            _topic: &Topic,
            _partition: Partition,
            offset: Offset,
        ) -> Result<Box<dyn PartitionCursor>, BrokerError> {
            self.opened.lock().unwrap().push(offset);
            let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
            let cursor = ChannelCursor::spawn(16, Offset::new(0), move |tx, _hwm, cancel| async move {
                for item in script {
                    if tx.send(item).await.is_err() {
                        return;
                    }
                }
                cancel.cancelled().await;
            });
            Ok(Box::new(cursor))
        }

        async fn group_coordinator(
            &self,
            _group: &Group,
        ) -> Result<Arc<dyn GroupOffsetCoordinator>, BrokerError> {
            Err(BrokerError::Stream("no groups".to_string()))
        }
    }

    fn orders() -> Topic {
        Topic::from("orders")
    }

    fn message(offset: i64) -> Result<Message, BrokerError> {
        Ok(Message::new(orders(), Partition::new(0), Offset::new(offset), "k", "v"))
    }

    fn out_of_range(offset: i64) -> Result<Message, BrokerError> {
        Err(BrokerError::OffsetOutOfRange {
            topic: orders(),
            partition: Partition::new(0),
            offset: Offset::new(offset),
        })
    }

    struct Fixture {
        broker: Arc<ScriptedBroker>,
        store: Arc<KvOffsetStore>,
        metrics: Arc<CountingMetrics>,
        seen: Arc<Mutex<Vec<i64>>>,
    }

    impl Fixture {
        fn new(scripts: Vec<Script>, stored: i64) -> Self {
            let store = Arc::new(KvOffsetStore::new(Arc::new(MemoryDb::new())));
            store.set(&orders(), Partition::new(0), Offset::new(stored)).unwrap();
            Self {
                broker: Arc::new(ScriptedBroker::new(scripts)),
                store,
                metrics: Arc::new(CountingMetrics::new()),
                seen: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn partition_loop(&self) -> PartitionLoop {
            let seen = self.seen.clone();
            PartitionLoop {
                broker: self.broker.clone(),
                topic: orders(),
                partition: Partition::new(0),
                offset_manager: Arc::new(StoreOffsetManager::new(self.store.clone(), Offset::OLDEST)),
                handler: Arc::new(MessageHandlerBatchFn::new(move |msgs: &[Message]| {
                    seen.lock()
                        .unwrap()
                        .extend(msgs.iter().map(|msg| msg.offset.as_i64()));
                    Ok(())
                })),
                batch_size: BatchSize::default(),
                metrics: self.metrics.clone(),
                sampler: Arc::new(AlwaysSampler),
            }
        }

        fn fallbacks(&self) -> f64 {
            self.metrics
                .value(CONSUMER_OFFSET_FALLBACK, &orders(), Some(Partition::new(0)))
        }
    }

    #[tokio::test]
    async fn test_out_of_range_on_first_read_falls_back() {
        let fixture = Fixture::new(vec![vec![out_of_range(2)], vec![message(5), message(6)]], 2);

        let cancel = CancellationToken::new();
        let run = tokio::spawn(fixture.partition_loop().run(cancel.clone()));
        tokio::time::timeout(Duration::from_secs(5), async {
            while fixture.store.get(&orders(), Partition::new(0)).ok() != Some(Offset::new(7)) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        cancel.cancel();
        run.await.unwrap().unwrap();

        assert_eq!(fixture.broker.opened(), vec![Offset::new(2), Offset::OLDEST]);
        assert_eq!(*fixture.seen.lock().unwrap(), vec![5, 6]);
        assert_eq!(fixture.fallbacks(), 1.0);
    }

    #[tokio::test]
    async fn test_out_of_range_after_messages_is_fatal() {
        let fixture = Fixture::new(vec![vec![message(2), out_of_range(3)]], 2);

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            fixture.partition_loop().run(CancellationToken::new()),
        )
        .await
        .unwrap()
        .unwrap_err();

        let chain = format!("{err:#}");
        assert!(chain.contains("consume topic orders partition 0 failed"), "{chain}");
        assert_eq!(fixture.broker.opened(), vec![Offset::new(2)]);
        assert_eq!(*fixture.seen.lock().unwrap(), vec![2]);
        assert_eq!(
            fixture.store.get(&orders(), Partition::new(0)).unwrap(),
            Offset::new(3)
        );
        assert_eq!(fixture.fallbacks(), 0.0);
    }

    #[tokio::test]
    async fn test_fallback_is_attempted_once() {
        let fixture = Fixture::new(vec![vec![out_of_range(2)], vec![out_of_range(0)]], 2);

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            fixture.partition_loop().run(CancellationToken::new()),
        )
        .await
        .unwrap()
        .unwrap_err();

        let broker_err = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<BrokerError>());
        assert!(broker_err.is_some_and(BrokerError::is_offset_out_of_range), "{err:#}");
        assert_eq!(fixture.broker.opened(), vec![Offset::new(2), Offset::OLDEST]);
        assert!(fixture.seen.lock().unwrap().is_empty());
        assert_eq!(fixture.fallbacks(), 1.0);
    }
}
