//! Message handler chain.
//!
//! Handlers come in four shapes: single message or batch, each with and
//! without a store transaction. Every shape has a closure adapter, a list
//! that runs several handlers in order, a metrics decorator and a
//! skip-errors decorator. A list stops at the first failure and checks the
//! cancellation token between steps, so a cancelled consumer never starts
//! new work but never interrupts a running handler either.
//!
//! The transactional shapes are turned into plain ones by the view/update
//! adapters, which run a whole batch inside one store transaction.

mod batch;
mod batch_tx;
mod single;
mod trigger;
mod tx;
pub mod update;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub use self::batch::{
    BatchFromSingle, MessageHandlerBatchFn, MessageHandlerBatchList, MessageHandlerBatchMetrics,
    MessageHandlerBatchSkipErrors,
};
pub use self::batch_tx::{
    BatchTxFromSingle, MarkOffsetBatchTx, MessageHandlerBatchTxFn, MessageHandlerBatchTxList,
    MessageHandlerBatchTxMetrics, MessageHandlerBatchTxSkipErrors, MessageHandlerBatchTxUpdate,
    MessageHandlerBatchTxView,
};
pub use self::single::{
    MessageHandlerFn, MessageHandlerList, MessageHandlerMetrics, MessageHandlerSkipErrors,
};
pub use self::trigger::OffsetTriggerMessageHandler;
pub use self::tx::{
    MessageHandlerTxFn, MessageHandlerTxList, MessageHandlerTxMetrics,
    MessageHandlerTxSkipErrors, MessageHandlerTxUpdate, MessageHandlerTxView,
};

use crate::error::ConsumerError;
use crate::store::Tx;
use crate::types::Message;

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn consume_message(&self, cancel: &CancellationToken, msg: &Message) -> Result<()>;
}

#[async_trait]
pub trait MessageHandlerBatch: Send + Sync {
    /// Handles all of `msgs` or fails. Messages are in offset order and all
    /// belong to the same partition.
    async fn consume_messages(&self, cancel: &CancellationToken, msgs: &[Message]) -> Result<()>;
}

#[async_trait]
pub trait MessageHandlerTx: Send + Sync {
    async fn consume_message(
        &self,
        cancel: &CancellationToken,
        tx: &dyn Tx,
        msg: &Message,
    ) -> Result<()>;
}

#[async_trait]
pub trait MessageHandlerBatchTx: Send + Sync {
    async fn consume_messages(
        &self,
        cancel: &CancellationToken,
        tx: &dyn Tx,
        msgs: &[Message],
    ) -> Result<()>;
}

fn ensure_not_cancelled(cancel: &CancellationToken) -> Result<(), ConsumerError> {
    if cancel.is_cancelled() {
        return Err(ConsumerError::Cancelled);
    }
    Ok(())
}
