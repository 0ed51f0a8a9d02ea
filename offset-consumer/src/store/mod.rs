//! Transactional key-value store over named buckets.
//!
//! Transactions are scoped: [`DbExt::view`] and [`DbExt::update`] open one,
//! hand it to a closure and release it on every exit path. Callers that need
//! to await inside a transaction use [`Db::begin`] directly; dropping a
//! [`Transaction`] without committing rolls it back.

mod memory;
mod rocksdb;

use std::fmt;

pub use self::memory::MemoryDb;
pub use self::rocksdb::RocksDb;

use crate::error::StoreError;

/// Name of a bucket, optionally composed from several parts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketName(String);

impl BucketName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Joins the non-empty parts with `_`.
    pub fn from_strings(parts: &[&str]) -> Self {
        Self(
            parts
                .iter()
                .filter(|p| !p.is_empty())
                .copied()
                .collect::<Vec<_>>()
                .join("_"),
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for BucketName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A bucket opened inside a transaction.
pub trait Bucket {
    /// Returns [`StoreError::KeyNotFound`] if the key is absent.
    fn get(&self, key: &[u8]) -> Result<Vec<u8>, StoreError>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, key: &[u8]) -> Result<(), StoreError>;
}

/// Operations available inside an open transaction.
pub trait Tx: Send + Sync {
    /// Returns [`StoreError::BucketNotFound`] if the bucket was never created.
    fn bucket(&self, name: &BucketName) -> Result<Box<dyn Bucket + '_>, StoreError>;
    fn create_bucket_if_not_exists(
        &self,
        name: &BucketName,
    ) -> Result<Box<dyn Bucket + '_>, StoreError>;
    fn is_writable(&self) -> bool;
}

/// An open transaction. Dropping it without [`Transaction::commit`] rolls back.
pub trait Transaction: Send + Sync {
    fn tx(&self) -> &dyn Tx;
    fn commit(self: Box<Self>) -> Result<(), StoreError>;
    fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

pub trait Db: Send + Sync {
    fn begin(&self, writable: bool) -> Result<Box<dyn Transaction + '_>, StoreError>;
}

/// Scoped transaction helpers for every [`Db`].
pub trait DbExt: Db {
    /// Runs `f` in a read-only transaction.
    fn view<T, E, F>(&self, f: F) -> Result<T, E>
    where
        E: From<StoreError>,
        F: FnOnce(&dyn Tx) -> Result<T, E>,
    {
        let txn = self.begin(false)?;
        let result = f(txn.tx());
        txn.rollback()?;
        result
    }

    /// Runs `f` in a read-write transaction, committing only if it succeeds.
    fn update<T, E, F>(&self, f: F) -> Result<T, E>
    where
        E: From<StoreError>,
        F: FnOnce(&dyn Tx) -> Result<T, E>,
    {
        let txn = self.begin(true)?;
        match f(txn.tx()) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(err) => {
                txn.rollback()?;
                Err(err)
            }
        }
    }
}

impl<D: Db + ?Sized> DbExt for D {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_name_from_strings() {
        assert_eq!(
            BucketName::from_strings(&["offset-store", "my-group"]).as_str(),
            "offset-store_my-group"
        );
        assert_eq!(
            BucketName::from_strings(&["offset-store", ""]).as_str(),
            "offset-store"
        );
    }
}
