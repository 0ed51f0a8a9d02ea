//! Where a partition loop resumes and how it records progress.
//!
//! Two interchangeable implementations: [`StoreOffsetManager`] keeps offsets
//! in the transactional store, [`GroupOffsetManager`] commits them to the
//! broker under a consumer group.

mod group;
pub mod http;
mod store;

use anyhow::Result;
use async_trait::async_trait;

pub use self::group::{GroupOffsetManager, DEFAULT_METADATA};
pub use self::store::StoreOffsetManager;

use crate::error::ConsumerError;
use crate::types::{Offset, Partition, Topic};

#[async_trait]
pub trait OffsetManager: Send + Sync {
    /// Fallback start offset when nothing was marked yet or the marked
    /// offset is no longer retained.
    fn initial_offset(&self) -> Offset;

    /// Offset consumption of the partition resumes at.
    async fn next_offset(&self, topic: &Topic, partition: Partition) -> Result<Offset>;

    /// Durably records `next_offset`. Returns only once the write is durable.
    async fn mark_offset(&self, topic: &Topic, partition: Partition, next_offset: Offset)
        -> Result<()>;
}

fn ensure_concrete(offset: Offset) -> Result<(), ConsumerError> {
    if offset.is_sentinel() {
        return Err(ConsumerError::SentinelOffset(offset));
    }
    Ok(())
}
