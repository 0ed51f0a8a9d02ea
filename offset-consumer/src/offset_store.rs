use std::sync::Arc;

use crate::error::{DecodeError, StoreError};
use crate::store::{BucketName, Db, DbExt, Tx};
use crate::types::{Group, Offset, Partition, Topic, TopicPartition};

pub const OFFSET_STORE_BUCKET: &str = "offset-store";

/// Durable mapping of (topic, partition) to the next offset to consume.
pub trait OffsetStore: Send + Sync {
    /// Returns a not-found [`StoreError`] if nothing was ever stored.
    fn get(&self, topic: &Topic, partition: Partition) -> Result<Offset, StoreError>;
    fn set(&self, topic: &Topic, partition: Partition, offset: Offset) -> Result<(), StoreError>;
}

/// Encoding of the (topic, partition) storage key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyFormat {
    /// `<topic>-<partition>`
    #[default]
    Text,
    /// Length-prefixed topic followed by the big-endian partition.
    Binary,
}

impl KeyFormat {
    fn encode(&self, topic: &Topic, partition: Partition) -> Result<Vec<u8>, DecodeError> {
        let tp = TopicPartition::new(topic.clone(), partition);
        match self {
            KeyFormat::Text => Ok(tp.text_key()),
            KeyFormat::Binary => tp.binary_key(),
        }
    }
}

/// [`OffsetStore`] persisting 8-byte big-endian offsets in a [`Db`] bucket.
pub struct KvOffsetStore {
    db: Arc<dyn Db>,
    bucket: BucketName,
    key_format: KeyFormat,
}

impl KvOffsetStore {
    /// Store shared by every consumer of the database.
    pub fn new(db: Arc<dyn Db>) -> Self {
        Self {
            db,
            bucket: BucketName::new(OFFSET_STORE_BUCKET),
            key_format: KeyFormat::default(),
        }
    }

    /// Store scoped to one consumer group, so groups reading the same topic
    /// keep independent offsets.
    pub fn new_group(db: Arc<dyn Db>, group: &Group) -> Self {
        Self {
            db,
            bucket: BucketName::from_strings(&[OFFSET_STORE_BUCKET, group.as_str()]),
            key_format: KeyFormat::default(),
        }
    }

    pub fn with_key_format(mut self, key_format: KeyFormat) -> Self {
        self.key_format = key_format;
        self
    }

    pub fn bucket(&self) -> &BucketName {
        &self.bucket
    }
}

impl KvOffsetStore {
    /// Reads the next offset inside an already open transaction.
    pub fn get_tx(&self, tx: &dyn Tx, topic: &Topic, partition: Partition) -> Result<Offset, StoreError> {
        let key = self.key_format.encode(topic, partition)?;
        let value = tx.bucket(&self.bucket)?.get(&key)?;
        if value.is_empty() {
            return Err(StoreError::KeyNotFound);
        }
        Ok(Offset::from_bytes(&value)?)
    }

    /// Writes the next offset inside an already open transaction, so it
    /// commits together with whatever else the transaction changed.
    pub fn set_tx(
        &self,
        tx: &dyn Tx,
        topic: &Topic,
        partition: Partition,
        offset: Offset,
    ) -> Result<(), StoreError> {
        let key = self.key_format.encode(topic, partition)?;
        tx.create_bucket_if_not_exists(&self.bucket)?
            .put(&key, &offset.to_bytes())
    }
}

impl OffsetStore for KvOffsetStore {
    fn get(&self, topic: &Topic, partition: Partition) -> Result<Offset, StoreError> {
        self.db.view(|tx| self.get_tx(tx, topic, partition))
    }

    fn set(&self, topic: &Topic, partition: Partition, offset: Offset) -> Result<(), StoreError> {
        self.db.update(|tx| self.set_tx(tx, topic, partition, offset))
    }
}
