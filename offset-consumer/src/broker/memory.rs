use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::cursor::CursorItem;
use super::{
    Broker, ChannelCursor, GroupOffsetCoordinator, PartitionCursor, PartitionOffsetCommitter,
};
use crate::error::BrokerError;
use crate::types::{Group, Message, Offset, Partition, Partitions, Topic, TopicPartition};

const CURSOR_CAPACITY: usize = 256;

#[derive(Default)]
struct PartitionLog {
    /// Offset of `messages[0]`; raised by [`MemoryBroker::truncate`].
    low: i64,
    messages: Vec<Message>,
    pending_error: Option<String>,
}

impl PartitionLog {
    fn high(&self) -> i64 {
        self.low + self.messages.len() as i64
    }
}

#[derive(Default)]
struct State {
    topics: HashMap<Topic, Vec<PartitionLog>>,
    committed: HashMap<(Group, TopicPartition), (Offset, String)>,
    opened: Vec<(TopicPartition, Offset)>,
    failing_partitions: HashMap<Topic, String>,
}

struct Inner {
    state: Mutex<State>,
    changed: watch::Sender<u64>,
}

/// Broker keeping topics, partitions and group commits in memory.
///
/// Used by the test suite and for local runs without a cluster.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                changed,
            }),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, BrokerError> {
        lock(&self.inner)
    }

    fn notify(&self) {
        self.inner.changed.send_modify(|version| *version += 1);
    }

    pub fn create_topic(&self, topic: &Topic, partitions: i32) -> Result<(), BrokerError> {
        let mut state = self.state()?;
        let logs = state.topics.entry(topic.clone()).or_default();
        while (logs.len() as i32) < partitions {
            logs.push(PartitionLog::default());
        }
        Ok(())
    }

    /// Appends a message and returns its offset.
    pub fn produce(
        &self,
        topic: &Topic,
        partition: Partition,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Result<Offset, BrokerError> {
        let offset = {
            let mut state = self.state()?;
            let log = partition_log(&mut state, topic, partition)?;
            let offset = Offset::new(log.high());
            log.messages
                .push(Message::new(topic.clone(), partition, offset, key, value));
            offset
        };
        self.notify();
        Ok(offset)
    }

    /// Drops every message below `low`, as retention would.
    pub fn truncate(&self, topic: &Topic, partition: Partition, low: Offset) -> Result<(), BrokerError> {
        let mut state = self.state()?;
        let log = partition_log(&mut state, topic, partition)?;
        let drop_count = (low.as_i64() - log.low).clamp(0, log.messages.len() as i64) as usize;
        log.messages.drain(..drop_count);
        log.low += drop_count as i64;
        Ok(())
    }

    /// Delivers a stream error on the next read of the partition.
    pub fn fail_partition(
        &self,
        topic: &Topic,
        partition: Partition,
        reason: &str,
    ) -> Result<(), BrokerError> {
        {
            let mut state = self.state()?;
            partition_log(&mut state, topic, partition)?.pending_error = Some(reason.to_string());
        }
        self.notify();
        Ok(())
    }

    /// Makes partition discovery of `topic` fail.
    pub fn fail_partitions(&self, topic: &Topic, reason: &str) -> Result<(), BrokerError> {
        self.state()?
            .failing_partitions
            .insert(topic.clone(), reason.to_string());
        Ok(())
    }

    /// Records a group commit as if another client had made it.
    pub fn commit(
        &self,
        group: &Group,
        topic: &Topic,
        partition: Partition,
        offset: Offset,
        metadata: &str,
    ) -> Result<(), BrokerError> {
        self.state()?.committed.insert(
            (group.clone(), TopicPartition::new(topic.clone(), partition)),
            (offset, metadata.to_string()),
        );
        Ok(())
    }

    pub fn committed(
        &self,
        group: &Group,
        topic: &Topic,
        partition: Partition,
    ) -> Option<(Offset, String)> {
        let state = self.state().ok()?;
        state
            .committed
            .get(&(group.clone(), TopicPartition::new(topic.clone(), partition)))
            .cloned()
    }

    /// Every cursor opened so far with its requested start offset.
    pub fn opened_cursors(&self) -> Vec<(TopicPartition, Offset)> {
        self.state()
            .map(|state| state.opened.clone())
            .unwrap_or_default()
    }

    fn watermarks(&self, topic: &Topic, partition: Partition) -> Result<(i64, i64), BrokerError> {
        let mut state = self.state()?;
        let log = partition_log(&mut state, topic, partition)?;
        Ok((log.low, log.high()))
    }
}

fn lock(inner: &Inner) -> Result<MutexGuard<'_, State>, BrokerError> {
    inner
        .state
        .lock()
        .map_err(|_| BrokerError::Stream("memory broker lock poisoned".to_string()))
}

fn partition_log<'a>(
    state: &'a mut State,
    topic: &Topic,
    partition: Partition,
) -> Result<&'a mut PartitionLog, BrokerError> {
    let logs = state
        .topics
        .get_mut(topic)
        .ok_or_else(|| BrokerError::UnknownTopic(topic.clone()))?;
    usize::try_from(partition.as_i32())
        .ok()
        .and_then(|index| logs.get_mut(index))
        .ok_or_else(|| BrokerError::UnknownPartition {
            topic: topic.clone(),
            partition,
        })
}

enum Read {
    Messages(Vec<Message>, i64),
    Error(String),
    /// `next` fell below the retained range.
    OutOfRange,
}

fn read_from(
    inner: &Inner,
    topic: &Topic,
    partition: Partition,
    next: i64,
) -> Result<Read, BrokerError> {
    let mut state = lock(inner)?;
    let log = partition_log(&mut state, topic, partition)?;
    if let Some(reason) = log.pending_error.take() {
        return Ok(Read::Error(reason));
    }
    if next < log.low {
        return Ok(Read::OutOfRange);
    }
    let start = usize::try_from((next - log.low).max(0)).unwrap_or_default();
    let messages = log.messages.get(start..).unwrap_or_default().to_vec();
    Ok(Read::Messages(messages, log.high()))
}

async fn feed(
    inner: Arc<Inner>,
    topic: Topic,
    partition: Partition,
    mut next: i64,
    tx: mpsc::Sender<CursorItem>,
    hwm: Arc<AtomicI64>,
    cancel: CancellationToken,
) {
    let mut changed = inner.changed.subscribe();
    loop {
        changed.borrow_and_update();
        let failure = match read_from(&inner, &topic, partition, next) {
            Ok(Read::Messages(messages, high)) => {
                hwm.store(high, Ordering::Release);
                for message in messages {
                    next = message.offset.as_i64() + 1;
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        sent = tx.send(Ok(message)) => if sent.is_err() { return },
                    }
                }
                None
            }
            Ok(Read::Error(reason)) => Some(BrokerError::Stream(reason)),
            Ok(Read::OutOfRange) => Some(BrokerError::OffsetOutOfRange {
                topic: topic.clone(),
                partition,
                offset: Offset::new(next),
            }),
            Err(err) => Some(err),
        };
        if let Some(err) = failure {
            if tx.send(Err(err)).await.is_err() {
                debug!(%topic, %partition, "cursor dropped before stream error was delivered");
            }
            return;
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            res = changed.changed() => if res.is_err() { return },
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn partitions(&self, topic: &Topic) -> Result<Partitions, BrokerError> {
        let state = self.state()?;
        if let Some(reason) = state.failing_partitions.get(topic) {
            return Err(BrokerError::Stream(reason.clone()));
        }
        let logs = state
            .topics
            .get(topic)
            .ok_or_else(|| BrokerError::UnknownTopic(topic.clone()))?;
        Ok((0..logs.len() as i32).map(Partition::new).collect())
    }

    async fn get_offset(
        &self,
        topic: &Topic,
        partition: Partition,
        offset: Offset,
    ) -> Result<Offset, BrokerError> {
        let (low, high) = self.watermarks(topic, partition)?;
        Ok(match offset {
            Offset::NEWEST => Offset::new(high),
            Offset::OLDEST => Offset::new(low),
            concrete => concrete,
        })
    }

    async fn open_cursor(
        &self,
        topic: &Topic,
        partition: Partition,
        offset: Offset,
    ) -> Result<Box<dyn PartitionCursor>, BrokerError> {
        let (low, high) = self.watermarks(topic, partition)?;
        self.state()?
            .opened
            .push((TopicPartition::new(topic.clone(), partition), offset));

        let start = match offset {
            Offset::NEWEST => high,
            Offset::OLDEST => low,
            concrete if concrete.as_i64() < low || concrete.as_i64() > high => {
                return Err(BrokerError::OffsetOutOfRange {
                    topic: topic.clone(),
                    partition,
                    offset,
                });
            }
            concrete => concrete.as_i64(),
        };
        debug!(%topic, %partition, start, "memory cursor opened");

        let inner = self.inner.clone();
        let topic = topic.clone();
        let cursor = ChannelCursor::spawn(
            CURSOR_CAPACITY,
            Offset::new(high),
            move |tx, hwm, cancel| async move {
                feed(inner, topic, partition, start, tx, hwm, cancel).await
            },
        );
        Ok(Box::new(cursor))
    }

    async fn group_coordinator(
        &self,
        group: &Group,
    ) -> Result<Arc<dyn GroupOffsetCoordinator>, BrokerError> {
        Ok(Arc::new(MemoryGroupCoordinator {
            broker: self.clone(),
            group: group.clone(),
        }))
    }
}

struct MemoryGroupCoordinator {
    broker: MemoryBroker,
    group: Group,
}

#[async_trait]
impl GroupOffsetCoordinator for MemoryGroupCoordinator {
    async fn manage_partition(
        &self,
        topic: &Topic,
        partition: Partition,
    ) -> Result<Arc<dyn PartitionOffsetCommitter>, BrokerError> {
        self.broker.watermarks(topic, partition)?;
        Ok(Arc::new(MemoryPartitionCommitter {
            broker: self.broker.clone(),
            group: self.group.clone(),
            topic: topic.clone(),
            partition,
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

struct MemoryPartitionCommitter {
    broker: MemoryBroker,
    group: Group,
    topic: Topic,
    partition: Partition,
}

#[async_trait]
impl PartitionOffsetCommitter for MemoryPartitionCommitter {
    async fn next_offset(&self) -> Result<(Offset, String), BrokerError> {
        Ok(self
            .broker
            .committed(&self.group, &self.topic, self.partition)
            .unwrap_or((Offset::OLDEST, String::new())))
    }

    async fn mark_offset(&self, offset: Offset, metadata: &str) -> Result<(), BrokerError> {
        self.broker
            .commit(&self.group, &self.topic, self.partition, offset, metadata)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}
