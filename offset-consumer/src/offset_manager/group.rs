use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use super::{ensure_concrete, OffsetManager};
use crate::broker::{Broker, GroupOffsetCoordinator, PartitionOffsetCommitter};
use crate::types::{Group, Offset, Partition, Topic, TopicPartition};

/// Metadata stored with every commit. A committed offset carrying any other
/// metadata was not written by this manager and is ignored.
pub const DEFAULT_METADATA: &str = "offset-consumer";

#[derive(Default)]
struct Committers {
    coordinator: Option<Arc<dyn GroupOffsetCoordinator>>,
    partitions: HashMap<TopicPartition, Arc<dyn PartitionOffsetCommitter>>,
}

/// [`OffsetManager`] committing to the broker under a consumer group.
///
/// The group coordinator and per-partition committers are created lazily on
/// first use and held until [`GroupOffsetManager::close`].
pub struct GroupOffsetManager {
    broker: Arc<dyn Broker>,
    group: Group,
    initial_offset: Offset,
    committers: Mutex<Committers>,
}

impl GroupOffsetManager {
    pub fn new(broker: Arc<dyn Broker>, group: Group, initial_offset: Offset) -> Self {
        Self {
            broker,
            group,
            initial_offset,
            committers: Mutex::new(Committers::default()),
        }
    }

    pub fn group(&self) -> &Group {
        &self.group
    }

    async fn committer(
        &self,
        topic: &Topic,
        partition: Partition,
    ) -> Result<Arc<dyn PartitionOffsetCommitter>> {
        let mut committers = self.committers.lock().await;
        let key = TopicPartition::new(topic.clone(), partition);
        if let Some(committer) = committers.partitions.get(&key) {
            return Ok(committer.clone());
        }

        let coordinator = match &committers.coordinator {
            Some(coordinator) => coordinator.clone(),
            None => {
                let coordinator = self
                    .broker
                    .group_coordinator(&self.group)
                    .await
                    .with_context(|| format!("create coordinator for group {} failed", self.group))?;
                committers.coordinator = Some(coordinator.clone());
                coordinator
            }
        };

        let committer = coordinator
            .manage_partition(topic, partition)
            .await
            .with_context(|| format!("manage topic {topic} partition {partition} failed"))?;
        committers.partitions.insert(key, committer.clone());
        Ok(committer)
    }

    /// Releases every committer and the coordinator. All of them are closed
    /// even if some fail; the first failure is returned.
    pub async fn close(&self) -> Result<()> {
        let mut committers = self.committers.lock().await;
        let mut errors = Vec::new();
        for (tp, committer) in committers.partitions.drain() {
            if let Err(e) = committer.close().await {
                warn!(topic_partition = %tp, error = ?e, "close partition committer failed");
                errors.push(e);
            }
        }
        if let Some(coordinator) = committers.coordinator.take() {
            if let Err(e) = coordinator.close().await {
                warn!(group = %self.group, error = ?e, "close group coordinator failed");
                errors.push(e);
            }
        }

        let failed = errors.len();
        match errors.into_iter().next() {
            Some(first) => Err(first).with_context(|| {
                format!("close offset manager of group {} failed ({failed} errors)", self.group)
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl OffsetManager for GroupOffsetManager {
    fn initial_offset(&self) -> Offset {
        self.initial_offset
    }

    async fn next_offset(&self, topic: &Topic, partition: Partition) -> Result<Offset> {
        let committer = self.committer(topic, partition).await?;
        let (offset, metadata) = committer
            .next_offset()
            .await
            .with_context(|| format!("get committed offset for topic {topic} partition {partition} failed"))?;
        if metadata != DEFAULT_METADATA {
            debug!(
                group = %self.group,
                %topic,
                %partition,
                initial_offset = %self.initial_offset,
                "metadata missing, using initial offset"
            );
            return Ok(self.initial_offset);
        }
        Ok(offset)
    }

    async fn mark_offset(
        &self,
        topic: &Topic,
        partition: Partition,
        next_offset: Offset,
    ) -> Result<()> {
        ensure_concrete(next_offset)?;
        let committer = self.committer(topic, partition).await?;
        committer
            .mark_offset(next_offset, DEFAULT_METADATA)
            .await
            .with_context(|| {
                format!("commit offset {next_offset} for topic {topic} partition {partition} failed")
            })?;
        trace!(group = %self.group, %topic, %partition, %next_offset, "offset committed");
        Ok(())
    }
}
