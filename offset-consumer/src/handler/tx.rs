use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{ensure_not_cancelled, MessageHandler, MessageHandlerTx};
use crate::log_sampler::LogSampler;
use crate::metrics::MetricsMessageHandler;
use crate::store::{Db, Transaction, Tx};
use crate::types::Message;

pub struct MessageHandlerTxFn<F> {
    func: F,
}

impl<F> MessageHandlerTxFn<F>
where
    F: Fn(&dyn Tx, &Message) -> Result<()> + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F> MessageHandlerTx for MessageHandlerTxFn<F>
where
    F: Fn(&dyn Tx, &Message) -> Result<()> + Send + Sync,
{
    async fn consume_message(
        &self,
        _cancel: &CancellationToken,
        tx: &dyn Tx,
        msg: &Message,
    ) -> Result<()> {
        (self.func)(tx, msg)
    }
}

pub struct MessageHandlerTxList {
    handlers: Vec<Arc<dyn MessageHandlerTx>>,
}

impl MessageHandlerTxList {
    pub fn new(handlers: Vec<Arc<dyn MessageHandlerTx>>) -> Self {
        Self { handlers }
    }
}

#[async_trait]
impl MessageHandlerTx for MessageHandlerTxList {
    async fn consume_message(
        &self,
        cancel: &CancellationToken,
        tx: &dyn Tx,
        msg: &Message,
    ) -> Result<()> {
        for handler in &self.handlers {
            ensure_not_cancelled(cancel)?;
            handler.consume_message(cancel, tx, msg).await?;
        }
        Ok(())
    }
}

pub struct MessageHandlerTxMetrics {
    handler: Arc<dyn MessageHandlerTx>,
    metrics: Arc<dyn MetricsMessageHandler>,
}

impl MessageHandlerTxMetrics {
    pub fn new(handler: Arc<dyn MessageHandlerTx>, metrics: Arc<dyn MetricsMessageHandler>) -> Self {
        Self { handler, metrics }
    }
}

#[async_trait]
impl MessageHandlerTx for MessageHandlerTxMetrics {
    async fn consume_message(
        &self,
        cancel: &CancellationToken,
        tx: &dyn Tx,
        msg: &Message,
    ) -> Result<()> {
        self.metrics.total_counter_inc(&msg.topic, msg.partition);
        let start = Instant::now();
        let result = self.handler.consume_message(cancel, tx, msg).await;
        self.metrics
            .duration_measure(&msg.topic, msg.partition, start.elapsed());
        match &result {
            Ok(()) => self.metrics.success_counter_inc(&msg.topic, msg.partition),
            Err(_) => self.metrics.failure_counter_inc(&msg.topic, msg.partition),
        }
        result
    }
}

pub struct MessageHandlerTxSkipErrors {
    handler: Arc<dyn MessageHandlerTx>,
    sampler: Arc<dyn LogSampler>,
}

impl MessageHandlerTxSkipErrors {
    pub fn new(handler: Arc<dyn MessageHandlerTx>, sampler: Arc<dyn LogSampler>) -> Self {
        Self { handler, sampler }
    }
}

#[async_trait]
impl MessageHandlerTx for MessageHandlerTxSkipErrors {
    async fn consume_message(
        &self,
        cancel: &CancellationToken,
        tx: &dyn Tx,
        msg: &Message,
    ) -> Result<()> {
        if let Err(e) = self.handler.consume_message(cancel, tx, msg).await {
            if self.sampler.is_sample() {
                warn!(
                    topic = %msg.topic,
                    partition = %msg.partition,
                    offset = %msg.offset,
                    error = ?e,
                    "handle message in transaction failed, skipping"
                );
            }
        }
        Ok(())
    }
}

/// Runs the wrapped handler inside a read-only transaction per message.
pub struct MessageHandlerTxView {
    db: Arc<dyn Db>,
    handler: Arc<dyn MessageHandlerTx>,
}

impl MessageHandlerTxView {
    pub fn new(db: Arc<dyn Db>, handler: Arc<dyn MessageHandlerTx>) -> Self {
        Self { db, handler }
    }
}

#[async_trait]
impl MessageHandler for MessageHandlerTxView {
    async fn consume_message(&self, cancel: &CancellationToken, msg: &Message) -> Result<()> {
        let txn = self.db.begin(false).context("begin read transaction failed")?;
        let result = self.handler.consume_message(cancel, txn.tx(), msg).await;
        finish_view(txn, result)
    }
}

/// Runs the wrapped handler inside a read-write transaction per message.
/// The transaction commits only if the handler succeeds.
pub struct MessageHandlerTxUpdate {
    db: Arc<dyn Db>,
    handler: Arc<dyn MessageHandlerTx>,
}

impl MessageHandlerTxUpdate {
    pub fn new(db: Arc<dyn Db>, handler: Arc<dyn MessageHandlerTx>) -> Self {
        Self { db, handler }
    }
}

#[async_trait]
impl MessageHandler for MessageHandlerTxUpdate {
    async fn consume_message(&self, cancel: &CancellationToken, msg: &Message) -> Result<()> {
        let txn = self.db.begin(true).context("begin write transaction failed")?;
        let result = self.handler.consume_message(cancel, txn.tx(), msg).await;
        finish_update(txn, result)
    }
}

pub(super) fn finish_view(txn: Box<dyn Transaction + '_>, result: Result<()>) -> Result<()> {
    let rollback = txn.rollback();
    result?;
    rollback.context("release read transaction failed")
}

pub(super) fn finish_update(txn: Box<dyn Transaction + '_>, result: Result<()>) -> Result<()> {
    match result {
        Ok(()) => txn.commit().context("commit transaction failed"),
        Err(e) => {
            if let Err(rollback) = txn.rollback() {
                warn!(error = ?rollback, "rollback transaction failed");
            }
            Err(e)
        }
    }
}
