use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{Bucket, BucketName, Db, Transaction, Tx};
use crate::error::StoreError;

type Buckets = BTreeMap<BucketName, BTreeMap<Vec<u8>, Vec<u8>>>;

enum Op {
    CreateBucket(BucketName),
    Put(BucketName, Vec<u8>, Vec<u8>),
    Delete(BucketName, Vec<u8>),
}

/// In-memory [`Db`]. Each transaction works on a snapshot and replays its
/// writes onto the shared state on commit.
#[derive(Clone, Default)]
pub struct MemoryDb {
    state: Arc<Mutex<Buckets>>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed value of `key` in `bucket`, outside of any transaction.
    pub fn committed(&self, bucket: &BucketName, key: &[u8]) -> Option<Vec<u8>> {
        let state = self.state.lock().ok()?;
        state.get(bucket)?.get(key).cloned()
    }

    pub fn bucket_names(&self) -> Vec<BucketName> {
        self.state
            .lock()
            .map(|state| state.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl Db for MemoryDb {
    fn begin(&self, writable: bool) -> Result<Box<dyn Transaction + '_>, StoreError> {
        let snapshot = self
            .state
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .clone();
        Ok(Box::new(MemoryTransaction {
            state: self.state.clone(),
            local: Mutex::new(Local {
                buckets: snapshot,
                ops: Vec::new(),
            }),
            writable,
        }))
    }
}

struct Local {
    buckets: Buckets,
    ops: Vec<Op>,
}

struct MemoryTransaction {
    state: Arc<Mutex<Buckets>>,
    local: Mutex<Local>,
    writable: bool,
}

impl MemoryTransaction {
    fn lock(&self) -> Result<MutexGuard<'_, Local>, StoreError> {
        self.local.lock().map_err(|_| StoreError::Poisoned)
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if !self.writable {
            return Err(StoreError::ReadOnly);
        }
        Ok(())
    }
}

impl Tx for MemoryTransaction {
    fn bucket(&self, name: &BucketName) -> Result<Box<dyn Bucket + '_>, StoreError> {
        if !self.lock()?.buckets.contains_key(name) {
            return Err(StoreError::BucketNotFound(name.clone()));
        }
        Ok(Box::new(MemoryBucket {
            txn: self,
            name: name.clone(),
        }))
    }

    fn create_bucket_if_not_exists(
        &self,
        name: &BucketName,
    ) -> Result<Box<dyn Bucket + '_>, StoreError> {
        self.check_writable()?;
        {
            let mut local = self.lock()?;
            if !local.buckets.contains_key(name) {
                local.buckets.insert(name.clone(), BTreeMap::new());
                local.ops.push(Op::CreateBucket(name.clone()));
            }
        }
        Ok(Box::new(MemoryBucket {
            txn: self,
            name: name.clone(),
        }))
    }

    fn is_writable(&self) -> bool {
        self.writable
    }
}

impl Transaction for MemoryTransaction {
    fn tx(&self) -> &dyn Tx {
        self
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let local = self.local.into_inner().map_err(|_| StoreError::Poisoned)?;
        let mut state = self.state.lock().map_err(|_| StoreError::Poisoned)?;
        for op in local.ops {
            match op {
                Op::CreateBucket(name) => {
                    state.entry(name).or_default();
                }
                Op::Put(name, key, value) => {
                    state.entry(name).or_default().insert(key, value);
                }
                Op::Delete(name, key) => {
                    if let Some(bucket) = state.get_mut(&name) {
                        bucket.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

struct MemoryBucket<'a> {
    txn: &'a MemoryTransaction,
    name: BucketName,
}

impl Bucket for MemoryBucket<'_> {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        self.txn
            .lock()?
            .buckets
            .get(&self.name)
            .and_then(|bucket| bucket.get(key))
            .cloned()
            .ok_or(StoreError::KeyNotFound)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.txn.check_writable()?;
        let mut local = self.txn.lock()?;
        local
            .buckets
            .entry(self.name.clone())
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        local
            .ops
            .push(Op::Put(self.name.clone(), key.to_vec(), value.to_vec()));
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.txn.check_writable()?;
        let mut local = self.txn.lock()?;
        if let Some(bucket) = local.buckets.get_mut(&self.name) {
            bucket.remove(key);
        }
        local.ops.push(Op::Delete(self.name.clone(), key.to_vec()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DbExt;

    #[test]
    fn test_uncommitted_writes_are_invisible() {
        let db = MemoryDb::new();
        let name = BucketName::new("offsets");

        let txn = db.begin(true).unwrap();
        txn.tx()
            .create_bucket_if_not_exists(&name)
            .unwrap()
            .put(b"k", b"v")
            .unwrap();
        assert_eq!(txn.tx().bucket(&name).unwrap().get(b"k").unwrap(), b"v");
        assert_eq!(db.committed(&name, b"k"), None);

        drop(txn);
        assert!(db.bucket_names().is_empty());
    }

    #[test]
    fn test_commit_applies_writes() {
        let db = MemoryDb::new();
        let name = BucketName::new("offsets");

        db.update(|tx| {
            let bucket = tx.create_bucket_if_not_exists(&name)?;
            bucket.put(b"a", b"1")?;
            bucket.put(b"b", b"2")?;
            bucket.delete(b"a")
        })
        .unwrap();

        assert_eq!(db.committed(&name, b"a"), None);
        assert_eq!(db.committed(&name, b"b"), Some(b"2".to_vec()));
    }

    #[test]
    fn test_view_is_read_only() {
        let db = MemoryDb::new();
        let name = BucketName::new("offsets");
        let err = db
            .view(|tx| tx.create_bucket_if_not_exists(&name).map(|_| ()))
            .unwrap_err();
        assert!(matches!(err, StoreError::ReadOnly));
    }
}
