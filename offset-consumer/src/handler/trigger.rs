use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{MessageHandler, MessageHandlerBatch};
use crate::run::Fire;
use crate::types::{Message, PartitionOffsets, Topic};

/// Fires once every partition of `topic` delivered a message at or past its
/// target offset.
///
/// Each partition is removed from the pending set the first time it crosses
/// its target, and the trigger fires under the same lock that empties the
/// set, so it fires exactly once. An empty target set fires on construction.
pub struct OffsetTriggerMessageHandler {
    topic: Topic,
    pending: Mutex<PartitionOffsets>,
    trigger: Arc<dyn Fire>,
    partitions: usize,
}

impl OffsetTriggerMessageHandler {
    pub fn new(trigger_offsets: &PartitionOffsets, topic: Topic, trigger: Arc<dyn Fire>) -> Self {
        let partitions = trigger_offsets.len();
        if trigger_offsets.is_empty() {
            info!(%topic, "nothing to drain, trigger fired");
            trigger.fire();
        }
        Self {
            topic,
            pending: Mutex::new(trigger_offsets.clone()),
            trigger,
            partitions,
        }
    }

    /// Partitions that have not reached their target yet.
    pub fn pending(&self) -> PartitionOffsets {
        self.pending
            .lock()
            .map(|pending| pending.clone())
            .unwrap_or_default()
    }

    fn observe(&self, msg: &Message) {
        if msg.topic != self.topic {
            return;
        }
        let mut pending = match self.pending.lock() {
            Ok(pending) => pending,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(target) = pending.get(&msg.partition) else {
            return;
        };
        if msg.offset < target {
            return;
        }

        pending.remove(&msg.partition);
        debug!(
            topic = %msg.topic,
            partition = %msg.partition,
            offset = %msg.offset,
            %target,
            remaining = pending.len(),
            "partition reached trigger offset"
        );
        if pending.is_empty() {
            info!(topic = %self.topic, partitions = self.partitions, "all trigger offsets reached, trigger fired");
            self.trigger.fire();
        }
    }
}

#[async_trait]
impl MessageHandler for OffsetTriggerMessageHandler {
    async fn consume_message(&self, _cancel: &CancellationToken, msg: &Message) -> Result<()> {
        self.observe(msg);
        Ok(())
    }
}

/// Observes the whole batch even after the trigger fired, so a trigger that
/// cancels the consumer does not fail the batch that crossed the last target.
#[async_trait]
impl MessageHandlerBatch for OffsetTriggerMessageHandler {
    async fn consume_messages(&self, _cancel: &CancellationToken, msgs: &[Message]) -> Result<()> {
        for msg in msgs {
            self.observe(msg);
        }
        Ok(())
    }
}
