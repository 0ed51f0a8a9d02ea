use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use ::rocksdb::{OptimisticTransactionDB, Options};
use tracing::info;

use super::{Bucket, BucketName, Db, Transaction, Tx};
use crate::error::StoreError;

const BUCKET_MARKER_PREFIX: &[u8] = b"__bucket__/";

/// Marker key recording that a bucket exists.
fn bucket_key(name: &BucketName) -> Vec<u8> {
    let mut key = Vec::with_capacity(BUCKET_MARKER_PREFIX.len() + name.as_bytes().len());
    key.extend_from_slice(BUCKET_MARKER_PREFIX);
    key.extend_from_slice(name.as_bytes());
    key
}

/// Data key: bucket name, a zero byte, then the caller's key.
fn data_key(name: &BucketName, key: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(name.as_bytes().len() + 1 + key.len());
    data.extend_from_slice(name.as_bytes());
    data.push(0);
    data.extend_from_slice(key);
    data
}

/// [`Db`] on top of a RocksDB optimistic transaction database.
///
/// Bucket markers are written straight to the database, outside of any
/// transaction: they are idempotent, and keeping them out of the tracked
/// write set lets concurrent transactions create the same bucket without
/// failing each other's commit. A bucket created by a transaction that
/// rolls back stays, empty.
pub struct RocksDb {
    db: OptimisticTransactionDB,
    path: PathBuf,
}

impl RocksDb {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);

        let path = path.as_ref().to_path_buf();
        let db: OptimisticTransactionDB = OptimisticTransactionDB::open(&opts, &path)?;
        info!(path = %path.display(), "opened rocksdb store");
        Ok(Self { db, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Db for RocksDb {
    fn begin(&self, writable: bool) -> Result<Box<dyn Transaction + '_>, StoreError> {
        Ok(Box::new(RocksTransaction {
            db: &self.db,
            txn: Mutex::new(self.db.transaction()),
            writable,
        }))
    }
}

struct RocksTransaction<'db> {
    db: &'db OptimisticTransactionDB,
    txn: Mutex<::rocksdb::Transaction<'db, OptimisticTransactionDB>>,
    writable: bool,
}

impl<'db> RocksTransaction<'db> {
    fn lock(
        &self,
    ) -> Result<MutexGuard<'_, ::rocksdb::Transaction<'db, OptimisticTransactionDB>>, StoreError>
    {
        self.txn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if !self.writable {
            return Err(StoreError::ReadOnly);
        }
        Ok(())
    }
}

impl Tx for RocksTransaction<'_> {
    fn bucket(&self, name: &BucketName) -> Result<Box<dyn Bucket + '_>, StoreError> {
        if self.db.get(bucket_key(name))?.is_none() {
            return Err(StoreError::BucketNotFound(name.clone()));
        }
        Ok(Box::new(RocksBucket {
            txn: self,
            name: name.clone(),
        }))
    }

    fn create_bucket_if_not_exists(
        &self,
        name: &BucketName,
    ) -> Result<Box<dyn Bucket + '_>, StoreError> {
        self.check_writable()?;
        let marker = bucket_key(name);
        if self.db.get(&marker)?.is_none() {
            self.db.put(&marker, b"")?;
        }
        Ok(Box::new(RocksBucket {
            txn: self,
            name: name.clone(),
        }))
    }

    fn is_writable(&self) -> bool {
        self.writable
    }
}

impl Transaction for RocksTransaction<'_> {
    fn tx(&self) -> &dyn Tx {
        self
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let txn = self.txn.into_inner().map_err(|_| StoreError::Poisoned)?;
        txn.commit()?;
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.lock()?.rollback()?;
        Ok(())
    }
}

struct RocksBucket<'a, 'db> {
    txn: &'a RocksTransaction<'db>,
    name: BucketName,
}

impl Bucket for RocksBucket<'_, '_> {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        self.txn
            .lock()?
            .get(data_key(&self.name, key))?
            .ok_or(StoreError::KeyNotFound)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.txn.check_writable()?;
        self.txn.lock()?.put(data_key(&self.name, key), value)?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.txn.check_writable()?;
        self.txn.lock()?.delete(data_key(&self.name, key))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DbExt;
    use tempfile::TempDir;

    fn open_test_db() -> (RocksDb, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = RocksDb::open(temp_dir.path()).unwrap();
        (db, temp_dir)
    }

    #[test]
    fn test_missing_bucket_and_key() {
        let (db, _dir) = open_test_db();
        let name = BucketName::new("offsets");

        let err = db
            .view(|tx| tx.bucket(&name).map(|_| ()))
            .unwrap_err();
        assert!(matches!(err, StoreError::BucketNotFound(_)));

        db.update(|tx| tx.create_bucket_if_not_exists(&name).map(|_| ()))
            .unwrap();
        let err = db
            .view(|tx| tx.bucket(&name)?.get(b"missing"))
            .unwrap_err();
        assert!(matches!(err, StoreError::KeyNotFound));
    }

    #[test]
    fn test_update_commits_and_view_reads() {
        let (db, _dir) = open_test_db();
        let name = BucketName::new("offsets");

        db.update(|tx| tx.create_bucket_if_not_exists(&name)?.put(b"orders-0", b"42"))
            .unwrap();
        let value = db.view(|tx| tx.bucket(&name)?.get(b"orders-0")).unwrap();
        assert_eq!(value, b"42".to_vec());

        db.update(|tx| tx.bucket(&name)?.delete(b"orders-0")).unwrap();
        let err = db
            .view(|tx| tx.bucket(&name)?.get(b"orders-0"))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_failed_update_rolls_back() {
        let (db, _dir) = open_test_db();
        let name = BucketName::new("offsets");

        let result: Result<(), StoreError> = db.update(|tx| {
            tx.create_bucket_if_not_exists(&name)?.put(b"k", b"v")?;
            Err(StoreError::KeyNotFound)
        });
        assert!(result.is_err());

        // the bucket stays, the write does not
        let err = db.view(|tx| tx.bucket(&name)?.get(b"k")).unwrap_err();
        assert!(matches!(err, StoreError::KeyNotFound));
    }

    #[test]
    fn test_concurrent_transactions_create_same_bucket() {
        let (db, _dir) = open_test_db();
        let name = BucketName::new("offsets");

        let a = db.begin(true).unwrap();
        let b = db.begin(true).unwrap();
        a.tx().create_bucket_if_not_exists(&name).unwrap().put(b"orders-0", b"1").unwrap();
        b.tx().create_bucket_if_not_exists(&name).unwrap().put(b"orders-1", b"2").unwrap();
        a.commit().unwrap();
        b.commit().unwrap();

        assert_eq!(db.view(|tx| tx.bucket(&name)?.get(b"orders-0")).unwrap(), b"1");
        assert_eq!(db.view(|tx| tx.bucket(&name)?.get(b"orders-1")).unwrap(), b"2");
    }

    #[test]
    fn test_view_rejects_writes() {
        let (db, _dir) = open_test_db();
        let name = BucketName::new("offsets");
        db.update(|tx| tx.create_bucket_if_not_exists(&name).map(|_| ()))
            .unwrap();

        let err = db
            .view(|tx| tx.bucket(&name)?.put(b"k", b"v"))
            .unwrap_err();
        assert!(matches!(err, StoreError::ReadOnly));
    }

    #[test]
    fn test_buckets_do_not_share_keys() {
        let (db, _dir) = open_test_db();
        let a = BucketName::new("a");
        let b = BucketName::new("b");

        db.update(|tx| {
            tx.create_bucket_if_not_exists(&a)?.put(b"key", b"1")?;
            tx.create_bucket_if_not_exists(&b)?.put(b"key", b"2")
        })
        .unwrap();

        assert_eq!(db.view(|tx| tx.bucket(&a)?.get(b"key")).unwrap(), b"1");
        assert_eq!(db.view(|tx| tx.bucket(&b)?.get(b"key")).unwrap(), b"2");
    }

    #[test]
    fn test_data_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let name = BucketName::new("offsets");
        {
            let db = RocksDb::open(temp_dir.path()).unwrap();
            db.update(|tx| tx.create_bucket_if_not_exists(&name)?.put(b"k", b"v"))
                .unwrap();
        }
        let db = RocksDb::open(temp_dir.path()).unwrap();
        assert_eq!(db.view(|tx| tx.bucket(&name)?.get(b"k")).unwrap(), b"v");
    }
}
