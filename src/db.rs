//! Bucketed key/value storage consumed by the service core.
//!
//! The core never talks to a storage engine directly; it opens named buckets through [Database]
//! and uses the four [Bucket] operations. [MapDatabase] is the in-memory backend; a persistent
//! RocksDB backend lives in `chainsvc-tools`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Result;

/// Logical bucket name. Each bucket is an independent key space.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct BucketId(pub &'static str);

impl BucketId {
    /// Transaction id => locator of the finalized transaction list it belongs to.
    pub const TRANSACTION_LOCATOR_BY_HASH: BucketId = BucketId("transaction-locator-by-hash");
    /// Content hash => bytes (contract code, transaction lists, receipts, validator lists).
    pub const BYTES_BY_HASH: BucketId = BucketId("bytes-by-hash");
    /// Content hash => encoded world/account snapshot nodes.
    pub const MERKLE_TRIE: BucketId = BucketId("merkle-trie");
    /// Result hash => encoded transition result record.
    pub const TRANSITION_RESULT: BucketId = BucketId("transition-result");

    pub fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// A single key space. An empty value is distinct from an absent key: `has` reports true and
/// `get` returns `Some(vec![])`.
pub trait Bucket: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn has(&self, key: &[u8]) -> Result<bool>;
    fn set(&self, key: &[u8], value: &[u8]) -> Result<()>;
    fn delete(&self, key: &[u8]) -> Result<()>;
}

pub trait Database: Send + Sync {
    fn get_bucket(&self, id: BucketId) -> Result<Arc<dyn Bucket>>;
    fn close(&self) -> Result<()>;
}

type Table = Arc<RwLock<HashMap<Vec<u8>, Vec<u8>>>>;

/// In-memory backend. Cloning shares the underlying tables.
#[derive(Clone, Default)]
pub struct MapDatabase {
    buckets: Arc<RwLock<HashMap<&'static str, Table>>>,
}

impl MapDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<dyn Database> {
        Arc::new(Self::new())
    }
}

struct MapBucket(Table);

impl Bucket for MapBucket {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.0.read().get(key).cloned())
    }

    fn has(&self, key: &[u8]) -> Result<bool> {
        Ok(self.0.read().contains_key(key))
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.0.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.0.write().remove(key);
        Ok(())
    }
}

impl Database for MapDatabase {
    fn get_bucket(&self, id: BucketId) -> Result<Arc<dyn Bucket>> {
        let table = self
            .buckets
            .write()
            .entry(id.name())
            .or_insert_with(Default::default)
            .clone();
        Ok(Arc::new(MapBucket(table)))
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}
