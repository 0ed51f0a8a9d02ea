//! Key/value updaters.
//!
//! A message's key identifies an object and its value is the object as JSON.
//! An empty value is a tombstone and deletes the object. [`MessageHandlerUpdater`]
//! and [`MessageHandlerTxUpdater`] decode messages and dispatch to an
//! [`UpdaterHandler`] or [`UpdaterHandlerTx`].

use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::tx::{finish_update, finish_view};
use super::{ensure_not_cancelled, MessageHandler, MessageHandlerTx};
use crate::error::DecodeError;
use crate::log_sampler::LogSampler;
use crate::store::{Db, Tx};
use crate::types::{Key, Message};

/// Object ids decodable from raw message keys.
pub trait FromKeyBytes: Sized {
    fn from_key_bytes(bytes: &[u8]) -> Result<Self, DecodeError>;
}

impl FromKeyBytes for Vec<u8> {
    fn from_key_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        Ok(bytes.to_vec())
    }
}

impl FromKeyBytes for String {
    fn from_key_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        Ok(String::from_utf8(bytes.to_vec())?)
    }
}

impl FromKeyBytes for Key {
    fn from_key_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        Ok(Key::new(bytes))
    }
}

#[async_trait]
pub trait UpdaterHandler<K, O>: Send + Sync {
    async fn update(&self, cancel: &CancellationToken, key: &K, object: &O) -> Result<()>;
    async fn delete(&self, cancel: &CancellationToken, key: &K) -> Result<()>;
}

#[async_trait]
pub trait UpdaterHandlerTx<K, O>: Send + Sync {
    async fn update(
        &self,
        cancel: &CancellationToken,
        tx: &dyn Tx,
        key: &K,
        object: &O,
    ) -> Result<()>;
    async fn delete(&self, cancel: &CancellationToken, tx: &dyn Tx, key: &K) -> Result<()>;
}

/// Decides whether an object should be removed instead of stored.
pub trait Filter<K, O>: Send + Sync {
    /// True if the object is filtered out.
    fn filtered(&self, key: &K, object: &O) -> Result<bool>;
}

pub struct FilterFn<F> {
    func: F,
}

impl<F> FilterFn<F> {
    pub fn new<K, O>(func: F) -> Self
    where
        F: Fn(&K, &O) -> Result<bool> + Send + Sync,
    {
        Self { func }
    }
}

impl<K, O, F> Filter<K, O> for FilterFn<F>
where
    F: Fn(&K, &O) -> Result<bool> + Send + Sync,
{
    fn filtered(&self, key: &K, object: &O) -> Result<bool> {
        (self.func)(key, object)
    }
}

/// Updater from an update and a delete closure.
pub struct UpdaterHandlerFn<U, D> {
    update: U,
    delete: D,
}

impl<U, D> UpdaterHandlerFn<U, D> {
    pub fn new<K, O>(update: U, delete: D) -> Self
    where
        U: Fn(&K, &O) -> Result<()> + Send + Sync,
        D: Fn(&K) -> Result<()> + Send + Sync,
    {
        Self { update, delete }
    }
}

#[async_trait]
impl<K, O, U, D> UpdaterHandler<K, O> for UpdaterHandlerFn<U, D>
where
    K: Send + Sync,
    O: Send + Sync,
    U: Fn(&K, &O) -> Result<()> + Send + Sync,
    D: Fn(&K) -> Result<()> + Send + Sync,
{
    async fn update(&self, _cancel: &CancellationToken, key: &K, object: &O) -> Result<()> {
        (self.update)(key, object)
    }

    async fn delete(&self, _cancel: &CancellationToken, key: &K) -> Result<()> {
        (self.delete)(key)
    }
}

/// Transactional updater from an update and a delete closure.
pub struct UpdaterHandlerTxFn<U, D> {
    update: U,
    delete: D,
}

impl<U, D> UpdaterHandlerTxFn<U, D> {
    pub fn new<K, O>(update: U, delete: D) -> Self
    where
        U: Fn(&dyn Tx, &K, &O) -> Result<()> + Send + Sync,
        D: Fn(&dyn Tx, &K) -> Result<()> + Send + Sync,
    {
        Self { update, delete }
    }
}

#[async_trait]
impl<K, O, U, D> UpdaterHandlerTx<K, O> for UpdaterHandlerTxFn<U, D>
where
    K: Send + Sync,
    O: Send + Sync,
    U: Fn(&dyn Tx, &K, &O) -> Result<()> + Send + Sync,
    D: Fn(&dyn Tx, &K) -> Result<()> + Send + Sync,
{
    async fn update(
        &self,
        _cancel: &CancellationToken,
        tx: &dyn Tx,
        key: &K,
        object: &O,
    ) -> Result<()> {
        (self.update)(tx, key, object)
    }

    async fn delete(&self, _cancel: &CancellationToken, tx: &dyn Tx, key: &K) -> Result<()> {
        (self.delete)(tx, key)
    }
}

pub struct UpdaterHandlerList<K, O> {
    handlers: Vec<Arc<dyn UpdaterHandler<K, O>>>,
}

impl<K, O> UpdaterHandlerList<K, O> {
    pub fn new(handlers: Vec<Arc<dyn UpdaterHandler<K, O>>>) -> Self {
        Self { handlers }
    }
}

#[async_trait]
impl<K, O> UpdaterHandler<K, O> for UpdaterHandlerList<K, O>
where
    K: Send + Sync,
    O: Send + Sync,
{
    async fn update(&self, cancel: &CancellationToken, key: &K, object: &O) -> Result<()> {
        for handler in &self.handlers {
            ensure_not_cancelled(cancel)?;
            handler.update(cancel, key, object).await?;
        }
        Ok(())
    }

    async fn delete(&self, cancel: &CancellationToken, key: &K) -> Result<()> {
        for handler in &self.handlers {
            ensure_not_cancelled(cancel)?;
            handler.delete(cancel, key).await?;
        }
        Ok(())
    }
}

pub struct UpdaterHandlerTxList<K, O> {
    handlers: Vec<Arc<dyn UpdaterHandlerTx<K, O>>>,
}

impl<K, O> UpdaterHandlerTxList<K, O> {
    pub fn new(handlers: Vec<Arc<dyn UpdaterHandlerTx<K, O>>>) -> Self {
        Self { handlers }
    }
}

#[async_trait]
impl<K, O> UpdaterHandlerTx<K, O> for UpdaterHandlerTxList<K, O>
where
    K: Send + Sync,
    O: Send + Sync,
{
    async fn update(
        &self,
        cancel: &CancellationToken,
        tx: &dyn Tx,
        key: &K,
        object: &O,
    ) -> Result<()> {
        for handler in &self.handlers {
            ensure_not_cancelled(cancel)?;
            handler.update(cancel, tx, key, object).await?;
        }
        Ok(())
    }

    async fn delete(&self, cancel: &CancellationToken, tx: &dyn Tx, key: &K) -> Result<()> {
        for handler in &self.handlers {
            ensure_not_cancelled(cancel)?;
            handler.delete(cancel, tx, key).await?;
        }
        Ok(())
    }
}

/// Turns updates of filtered objects into deletes.
pub struct UpdaterHandlerFilter<K, O> {
    filter: Arc<dyn Filter<K, O>>,
    handler: Arc<dyn UpdaterHandler<K, O>>,
}

impl<K, O> UpdaterHandlerFilter<K, O> {
    pub fn new(filter: Arc<dyn Filter<K, O>>, handler: Arc<dyn UpdaterHandler<K, O>>) -> Self {
        Self { filter, handler }
    }
}

#[async_trait]
impl<K, O> UpdaterHandler<K, O> for UpdaterHandlerFilter<K, O>
where
    K: Send + Sync,
    O: Send + Sync,
{
    async fn update(&self, cancel: &CancellationToken, key: &K, object: &O) -> Result<()> {
        if self.filter.filtered(key, object).context("filter failed")? {
            return self.handler.delete(cancel, key).await;
        }
        self.handler.update(cancel, key, object).await
    }

    async fn delete(&self, cancel: &CancellationToken, key: &K) -> Result<()> {
        self.handler.delete(cancel, key).await
    }
}

pub struct UpdaterHandlerTxFilter<K, O> {
    filter: Arc<dyn Filter<K, O>>,
    handler: Arc<dyn UpdaterHandlerTx<K, O>>,
}

impl<K, O> UpdaterHandlerTxFilter<K, O> {
    pub fn new(filter: Arc<dyn Filter<K, O>>, handler: Arc<dyn UpdaterHandlerTx<K, O>>) -> Self {
        Self { filter, handler }
    }
}

#[async_trait]
impl<K, O> UpdaterHandlerTx<K, O> for UpdaterHandlerTxFilter<K, O>
where
    K: Send + Sync,
    O: Send + Sync,
{
    async fn update(
        &self,
        cancel: &CancellationToken,
        tx: &dyn Tx,
        key: &K,
        object: &O,
    ) -> Result<()> {
        if self.filter.filtered(key, object).context("filter failed")? {
            return self.handler.delete(cancel, tx, key).await;
        }
        self.handler.update(cancel, tx, key, object).await
    }

    async fn delete(&self, cancel: &CancellationToken, tx: &dyn Tx, key: &K) -> Result<()> {
        self.handler.delete(cancel, tx, key).await
    }
}

pub struct UpdaterHandlerSkipErrors<K, O> {
    handler: Arc<dyn UpdaterHandler<K, O>>,
    sampler: Arc<dyn LogSampler>,
}

impl<K, O> UpdaterHandlerSkipErrors<K, O> {
    pub fn new(handler: Arc<dyn UpdaterHandler<K, O>>, sampler: Arc<dyn LogSampler>) -> Self {
        Self { handler, sampler }
    }
}

#[async_trait]
impl<K, O> UpdaterHandler<K, O> for UpdaterHandlerSkipErrors<K, O>
where
    K: Debug + Send + Sync,
    O: Send + Sync,
{
    async fn update(&self, cancel: &CancellationToken, key: &K, object: &O) -> Result<()> {
        if let Err(e) = self.handler.update(cancel, key, object).await {
            if self.sampler.is_sample() {
                warn!(?key, error = ?e, "update failed, skipping");
            }
        }
        Ok(())
    }

    async fn delete(&self, cancel: &CancellationToken, key: &K) -> Result<()> {
        if let Err(e) = self.handler.delete(cancel, key).await {
            if self.sampler.is_sample() {
                warn!(?key, error = ?e, "delete failed, skipping");
            }
        }
        Ok(())
    }
}

pub struct UpdaterHandlerTxSkipErrors<K, O> {
    handler: Arc<dyn UpdaterHandlerTx<K, O>>,
    sampler: Arc<dyn LogSampler>,
}

impl<K, O> UpdaterHandlerTxSkipErrors<K, O> {
    pub fn new(handler: Arc<dyn UpdaterHandlerTx<K, O>>, sampler: Arc<dyn LogSampler>) -> Self {
        Self { handler, sampler }
    }
}

#[async_trait]
impl<K, O> UpdaterHandlerTx<K, O> for UpdaterHandlerTxSkipErrors<K, O>
where
    K: Debug + Send + Sync,
    O: Send + Sync,
{
    async fn update(
        &self,
        cancel: &CancellationToken,
        tx: &dyn Tx,
        key: &K,
        object: &O,
    ) -> Result<()> {
        if let Err(e) = self.handler.update(cancel, tx, key, object).await {
            if self.sampler.is_sample() {
                warn!(?key, error = ?e, "update in transaction failed, skipping");
            }
        }
        Ok(())
    }

    async fn delete(&self, cancel: &CancellationToken, tx: &dyn Tx, key: &K) -> Result<()> {
        if let Err(e) = self.handler.delete(cancel, tx, key).await {
            if self.sampler.is_sample() {
                warn!(?key, error = ?e, "delete in transaction failed, skipping");
            }
        }
        Ok(())
    }
}

/// Runs a transactional updater in its own read-only transaction per call.
pub struct UpdaterHandlerTxView<K, O> {
    db: Arc<dyn Db>,
    handler: Arc<dyn UpdaterHandlerTx<K, O>>,
}

impl<K, O> UpdaterHandlerTxView<K, O> {
    pub fn new(db: Arc<dyn Db>, handler: Arc<dyn UpdaterHandlerTx<K, O>>) -> Self {
        Self { db, handler }
    }
}

#[async_trait]
impl<K, O> UpdaterHandler<K, O> for UpdaterHandlerTxView<K, O>
where
    K: Send + Sync,
    O: Send + Sync,
{
    async fn update(&self, cancel: &CancellationToken, key: &K, object: &O) -> Result<()> {
        let txn = self.db.begin(false).context("begin read transaction failed")?;
        let result = self.handler.update(cancel, txn.tx(), key, object).await;
        finish_view(txn, result)
    }

    async fn delete(&self, cancel: &CancellationToken, key: &K) -> Result<()> {
        let txn = self.db.begin(false).context("begin read transaction failed")?;
        let result = self.handler.delete(cancel, txn.tx(), key).await;
        finish_view(txn, result)
    }
}

/// Runs a transactional updater in its own read-write transaction per call.
pub struct UpdaterHandlerTxUpdate<K, O> {
    db: Arc<dyn Db>,
    handler: Arc<dyn UpdaterHandlerTx<K, O>>,
}

impl<K, O> UpdaterHandlerTxUpdate<K, O> {
    pub fn new(db: Arc<dyn Db>, handler: Arc<dyn UpdaterHandlerTx<K, O>>) -> Self {
        Self { db, handler }
    }
}

#[async_trait]
impl<K, O> UpdaterHandler<K, O> for UpdaterHandlerTxUpdate<K, O>
where
    K: Send + Sync,
    O: Send + Sync,
{
    async fn update(&self, cancel: &CancellationToken, key: &K, object: &O) -> Result<()> {
        let txn = self.db.begin(true).context("begin write transaction failed")?;
        let result = self.handler.update(cancel, txn.tx(), key, object).await;
        finish_update(txn, result)
    }

    async fn delete(&self, cancel: &CancellationToken, key: &K) -> Result<()> {
        let txn = self.db.begin(true).context("begin write transaction failed")?;
        let result = self.handler.delete(cancel, txn.tx(), key).await;
        finish_update(txn, result)
    }
}

enum Decoded<K, O> {
    Update(K, O),
    Delete(K),
}

fn decode<K, O>(msg: &Message) -> Result<Decoded<K, O>>
where
    K: FromKeyBytes + Debug,
    O: DeserializeOwned,
{
    let key = K::from_key_bytes(&msg.key)
        .with_context(|| format!("decode key at offset {} failed", msg.offset))?;
    if msg.value.is_empty() {
        return Ok(Decoded::Delete(key));
    }
    let object = serde_json::from_slice(&msg.value)
        .map_err(DecodeError::from)
        .with_context(|| format!("unmarshal value of {key:?} failed"))?;
    Ok(Decoded::Update(key, object))
}

/// Decodes messages and dispatches them to an [`UpdaterHandler`].
pub struct MessageHandlerUpdater<K, O> {
    handler: Arc<dyn UpdaterHandler<K, O>>,
    _types: PhantomData<fn() -> (K, O)>,
}

impl<K, O> MessageHandlerUpdater<K, O> {
    pub fn new(handler: Arc<dyn UpdaterHandler<K, O>>) -> Self {
        Self {
            handler,
            _types: PhantomData,
        }
    }
}

#[async_trait]
impl<K, O> MessageHandler for MessageHandlerUpdater<K, O>
where
    K: FromKeyBytes + Debug + Send + Sync + 'static,
    O: DeserializeOwned + Send + Sync + 'static,
{
    async fn consume_message(&self, cancel: &CancellationToken, msg: &Message) -> Result<()> {
        match decode::<K, O>(msg)? {
            Decoded::Update(key, object) => self
                .handler
                .update(cancel, &key, &object)
                .await
                .with_context(|| format!("update {key:?} failed")),
            Decoded::Delete(key) => self
                .handler
                .delete(cancel, &key)
                .await
                .with_context(|| format!("delete {key:?} failed")),
        }
    }
}

/// Decodes messages and dispatches them to an [`UpdaterHandlerTx`].
pub struct MessageHandlerTxUpdater<K, O> {
    handler: Arc<dyn UpdaterHandlerTx<K, O>>,
    _types: PhantomData<fn() -> (K, O)>,
}

impl<K, O> MessageHandlerTxUpdater<K, O> {
    pub fn new(handler: Arc<dyn UpdaterHandlerTx<K, O>>) -> Self {
        Self {
            handler,
            _types: PhantomData,
        }
    }
}

#[async_trait]
impl<K, O> MessageHandlerTx for MessageHandlerTxUpdater<K, O>
where
    K: FromKeyBytes + Debug + Send + Sync + 'static,
    O: DeserializeOwned + Send + Sync + 'static,
{
    async fn consume_message(
        &self,
        cancel: &CancellationToken,
        tx: &dyn Tx,
        msg: &Message,
    ) -> Result<()> {
        match decode::<K, O>(msg)? {
            Decoded::Update(key, object) => self
                .handler
                .update(cancel, tx, &key, &object)
                .await
                .with_context(|| format!("update {key:?} failed")),
            Decoded::Delete(key) => self
                .handler
                .delete(cancel, tx, &key)
                .await
                .with_context(|| format!("delete {key:?} failed")),
        }
    }
}
