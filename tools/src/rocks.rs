use std::path::Path;
use std::sync::Arc;

use rocksdb::DB;

use chainsvc::db::{Bucket, BucketId, Database};
use chainsvc::error::{Error, Result};

fn db_err(e: rocksdb::Error) -> Error {
    Error::Db(e.into_string())
}

/// RocksDB backed [Database]. All buckets share one key space; every key is prefixed with the
/// length and the name of its bucket, so no bucket can see another one's keys.
#[derive(Clone)]
pub struct RocksDatabase(Arc<DB>);

impl RocksDatabase {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = DB::open_default(path).map_err(db_err)?;
        Ok(Self(Arc::new(db)))
    }

    pub fn new_shared<P: AsRef<Path>>(path: P) -> Result<Arc<dyn Database>> {
        Ok(Arc::new(Self::open(path)?))
    }

    /// Removes every file of the database at `path`.
    pub fn destroy<P: AsRef<Path>>(path: P) -> Result<()> {
        DB::destroy(&rocksdb::Options::default(), path).map_err(db_err)
    }
}

struct RocksBucket {
    db: Arc<DB>,
    prefix: Vec<u8>,
}

impl RocksBucket {
    fn key(&self, key: &[u8]) -> Vec<u8> {
        let mut k = Vec::with_capacity(self.prefix.len() + key.len());
        k.extend_from_slice(&self.prefix);
        k.extend_from_slice(key);
        k
    }
}

impl Bucket for RocksBucket {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.db.get(self.key(key)).map_err(db_err)
    }

    fn has(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db.put(self.key(key), value).map_err(db_err)
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.db.delete(self.key(key)).map_err(db_err)
    }
}

impl Database for RocksDatabase {
    fn get_bucket(&self, id: BucketId) -> Result<Arc<dyn Bucket>> {
        let name = id.name().as_bytes();
        if name.len() > u8::MAX as usize {
            return Err(Error::IllegalArgument(format!("bucket name too long: {}", id)))
        }
        let mut prefix = Vec::with_capacity(name.len() + 1);
        prefix.push(name.len() as u8);
        prefix.extend_from_slice(name);
        log::trace!("open bucket {}", id);
        Ok(Arc::new(RocksBucket {
            db: self.0.clone(),
            prefix,
        }))
    }

    fn close(&self) -> Result<()> {
        self.0.flush().map_err(db_err)
    }
}
