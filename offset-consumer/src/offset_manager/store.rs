use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, trace};

use super::{ensure_concrete, OffsetManager};
use crate::offset_store::OffsetStore;
use crate::types::{Offset, Partition, Topic};

/// [`OffsetManager`] backed by an [`OffsetStore`].
pub struct StoreOffsetManager {
    store: Arc<dyn OffsetStore>,
    initial_offset: Offset,
}

impl StoreOffsetManager {
    pub fn new(store: Arc<dyn OffsetStore>, initial_offset: Offset) -> Self {
        Self {
            store,
            initial_offset,
        }
    }
}

#[async_trait]
impl OffsetManager for StoreOffsetManager {
    fn initial_offset(&self) -> Offset {
        self.initial_offset
    }

    async fn next_offset(&self, topic: &Topic, partition: Partition) -> Result<Offset> {
        match self.store.get(topic, partition) {
            Ok(offset) => Ok(offset),
            Err(e) if e.is_not_found() => {
                debug!(
                    %topic,
                    %partition,
                    initial_offset = %self.initial_offset,
                    "no stored offset, using initial offset"
                );
                Ok(self.initial_offset)
            }
            Err(e) => Err(e).with_context(|| {
                format!("get offset for topic {topic} partition {partition} failed")
            }),
        }
    }

    async fn mark_offset(
        &self,
        topic: &Topic,
        partition: Partition,
        next_offset: Offset,
    ) -> Result<()> {
        ensure_concrete(next_offset)?;
        self.store
            .set(topic, partition, next_offset)
            .with_context(|| {
                format!("set offset {next_offset} for topic {topic} partition {partition} failed")
            })?;
        trace!(%topic, %partition, %next_offset, "offset marked");
        Ok(())
    }
}
