//! Topic consumers.
//!
//! Every consumer fans out one task per partition and waits for all of them.
//! The first partition to fail cancels its siblings and its error is
//! returned. Cancelling the token passed to [`Consumer::consume`] is the
//! normal way to stop and yields `Ok(())`.

mod high_water_mark;
mod offset;
mod partition;
mod simple;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub use self::high_water_mark::HighWaterMarkConsumer;
pub use self::offset::OffsetConsumer;
pub use self::simple::SimpleConsumer;

#[async_trait]
pub trait Consumer: Send + Sync {
    async fn consume(&self, cancel: &CancellationToken) -> Result<()>;
}
