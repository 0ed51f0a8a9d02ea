use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use super::tx::{finish_update, finish_view};
use super::{ensure_not_cancelled, MessageHandlerBatch, MessageHandlerBatchTx, MessageHandlerTx};
use crate::log_sampler::LogSampler;
use crate::metrics::MetricsMessageHandler;
use crate::offset_store::KvOffsetStore;
use crate::store::{Db, Tx};
use crate::types::Message;

/// Feeds each message of a batch to a transactional single-message handler,
/// all within the caller's transaction.
pub struct BatchTxFromSingle {
    handler: Arc<dyn MessageHandlerTx>,
}

impl BatchTxFromSingle {
    pub fn new(handler: Arc<dyn MessageHandlerTx>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl MessageHandlerBatchTx for BatchTxFromSingle {
    async fn consume_messages(
        &self,
        cancel: &CancellationToken,
        tx: &dyn Tx,
        msgs: &[Message],
    ) -> Result<()> {
        for msg in msgs {
            ensure_not_cancelled(cancel)?;
            self.handler.consume_message(cancel, tx, msg).await?;
        }
        Ok(())
    }
}

pub struct MessageHandlerBatchTxFn<F> {
    func: F,
}

impl<F> MessageHandlerBatchTxFn<F>
where
    F: Fn(&dyn Tx, &[Message]) -> Result<()> + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F> MessageHandlerBatchTx for MessageHandlerBatchTxFn<F>
where
    F: Fn(&dyn Tx, &[Message]) -> Result<()> + Send + Sync,
{
    async fn consume_messages(
        &self,
        _cancel: &CancellationToken,
        tx: &dyn Tx,
        msgs: &[Message],
    ) -> Result<()> {
        (self.func)(tx, msgs)
    }
}

pub struct MessageHandlerBatchTxList {
    handlers: Vec<Arc<dyn MessageHandlerBatchTx>>,
}

impl MessageHandlerBatchTxList {
    pub fn new(handlers: Vec<Arc<dyn MessageHandlerBatchTx>>) -> Self {
        Self { handlers }
    }
}

#[async_trait]
impl MessageHandlerBatchTx for MessageHandlerBatchTxList {
    async fn consume_messages(
        &self,
        cancel: &CancellationToken,
        tx: &dyn Tx,
        msgs: &[Message],
    ) -> Result<()> {
        for handler in &self.handlers {
            ensure_not_cancelled(cancel)?;
            handler.consume_messages(cancel, tx, msgs).await?;
        }
        Ok(())
    }
}

pub struct MessageHandlerBatchTxMetrics {
    handler: Arc<dyn MessageHandlerBatchTx>,
    metrics: Arc<dyn MetricsMessageHandler>,
}

impl MessageHandlerBatchTxMetrics {
    pub fn new(
        handler: Arc<dyn MessageHandlerBatchTx>,
        metrics: Arc<dyn MetricsMessageHandler>,
    ) -> Self {
        Self { handler, metrics }
    }
}

#[async_trait]
impl MessageHandlerBatchTx for MessageHandlerBatchTxMetrics {
    async fn consume_messages(
        &self,
        cancel: &CancellationToken,
        tx: &dyn Tx,
        msgs: &[Message],
    ) -> Result<()> {
        let Some(first) = msgs.first() else {
            return self.handler.consume_messages(cancel, tx, msgs).await;
        };
        self.metrics.total_counter_inc(&first.topic, first.partition);
        let start = Instant::now();
        let result = self.handler.consume_messages(cancel, tx, msgs).await;
        self.metrics
            .duration_measure(&first.topic, first.partition, start.elapsed());
        match &result {
            Ok(()) => self.metrics.success_counter_inc(&first.topic, first.partition),
            Err(_) => self.metrics.failure_counter_inc(&first.topic, first.partition),
        }
        result
    }
}

pub struct MessageHandlerBatchTxSkipErrors {
    handler: Arc<dyn MessageHandlerBatchTx>,
    sampler: Arc<dyn LogSampler>,
}

impl MessageHandlerBatchTxSkipErrors {
    pub fn new(handler: Arc<dyn MessageHandlerBatchTx>, sampler: Arc<dyn LogSampler>) -> Self {
        Self { handler, sampler }
    }
}

#[async_trait]
impl MessageHandlerBatchTx for MessageHandlerBatchTxSkipErrors {
    async fn consume_messages(
        &self,
        cancel: &CancellationToken,
        tx: &dyn Tx,
        msgs: &[Message],
    ) -> Result<()> {
        if let Err(e) = self.handler.consume_messages(cancel, tx, msgs).await {
            if let (Some(first), Some(last)) = (msgs.first(), msgs.last()) {
                if self.sampler.is_sample() {
                    warn!(
                        topic = %first.topic,
                        partition = %first.partition,
                        first_offset = %first.offset,
                        last_offset = %last.offset,
                        batch_size = msgs.len(),
                        error = ?e,
                        "handle batch in transaction failed, skipping"
                    );
                }
            }
        }
        Ok(())
    }
}

/// Runs a whole batch inside one read-only transaction.
pub struct MessageHandlerBatchTxView {
    db: Arc<dyn Db>,
    handler: Arc<dyn MessageHandlerBatchTx>,
}

impl MessageHandlerBatchTxView {
    pub fn new(db: Arc<dyn Db>, handler: Arc<dyn MessageHandlerBatchTx>) -> Self {
        Self { db, handler }
    }
}

#[async_trait]
impl MessageHandlerBatch for MessageHandlerBatchTxView {
    async fn consume_messages(&self, cancel: &CancellationToken, msgs: &[Message]) -> Result<()> {
        let txn = self.db.begin(false).context("begin read transaction failed")?;
        let result = self.handler.consume_messages(cancel, txn.tx(), msgs).await;
        finish_view(txn, result)
    }
}

/// Runs a whole batch inside one read-write transaction, committed only if
/// every message was handled.
pub struct MessageHandlerBatchTxUpdate {
    db: Arc<dyn Db>,
    handler: Arc<dyn MessageHandlerBatchTx>,
}

impl MessageHandlerBatchTxUpdate {
    pub fn new(db: Arc<dyn Db>, handler: Arc<dyn MessageHandlerBatchTx>) -> Self {
        Self { db, handler }
    }
}

#[async_trait]
impl MessageHandlerBatch for MessageHandlerBatchTxUpdate {
    async fn consume_messages(&self, cancel: &CancellationToken, msgs: &[Message]) -> Result<()> {
        let txn = self.db.begin(true).context("begin write transaction failed")?;
        let result = self.handler.consume_messages(cancel, txn.tx(), msgs).await;
        finish_update(txn, result)
    }
}

/// Writes the batch's next offset into the offset store inside the batch
/// transaction. Placed last in a list, application state and offset commit
/// together or not at all.
pub struct MarkOffsetBatchTx {
    store: Arc<KvOffsetStore>,
}

impl MarkOffsetBatchTx {
    pub fn new(store: Arc<KvOffsetStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl MessageHandlerBatchTx for MarkOffsetBatchTx {
    async fn consume_messages(
        &self,
        _cancel: &CancellationToken,
        tx: &dyn Tx,
        msgs: &[Message],
    ) -> Result<()> {
        let Some(last) = msgs.last() else {
            return Ok(());
        };
        let next = last.offset.next();
        self.store
            .set_tx(tx, &last.topic, last.partition, next)
            .with_context(|| {
                format!(
                    "mark offset {next} for topic {} partition {} failed",
                    last.topic, last.partition
                )
            })?;
        trace!(topic = %last.topic, partition = %last.partition, next_offset = %next, "offset marked in transaction");
        Ok(())
    }
}
