//! Deferred resolution of content-addressed data during state synchronization.
//!
//! While importing a world snapshot from peers, nodes that are not in the local store cannot be
//! read yet. Owners of such nodes register a [DataRequester] against the missing hash; when the
//! bytes arrive, [MerkleBuilder::on_data] verifies them against the hash, persists them and hands
//! them to every waiting requester.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::Hash;
use crate::db::{BucketId, Database};
use crate::error::Result;

pub trait DataRequester: Send + Sync {
    fn on_data(&self, bytes: &[u8]) -> Result<()>;
}

pub struct MerkleBuilder {
    db: Arc<dyn Database>,
    requests: Mutex<HashMap<Hash, Request>>,
}

struct Request {
    bucket: BucketId,
    requesters: Vec<Arc<dyn DataRequester>>,
}

impl MerkleBuilder {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            db,
            requests: Mutex::new(HashMap::new()),
        }
    }

    pub fn database(&self) -> &Arc<dyn Database> {
        &self.db
    }

    pub fn request_data(
        &self, bucket: BucketId, hash: Hash, requester: Arc<dyn DataRequester>,
    ) {
        log::debug!("requesting {} from {}", hash, bucket);
        self.requests
            .lock()
            .entry(hash)
            .or_insert_with(|| Request {
                bucket,
                requesters: Vec::new(),
            })
            .requesters
            .push(requester);
    }

    /// Hashes that are still missing.
    pub fn requested(&self) -> Vec<Hash> {
        self.requests.lock().keys().cloned().collect()
    }

    pub fn unresolved_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Feeds one piece of data received from a peer. Returns false when nothing was waiting for
    /// it (unrequested or corrupted data is dropped).
    pub fn on_data(&self, bytes: &[u8]) -> Result<bool> {
        let hash = Hash::hash(bytes);
        let req = match self.requests.lock().remove(&hash) {
            Some(req) => req,
            None => return Ok(false),
        };
        self.db
            .get_bucket(req.bucket)?
            .set(hash.as_bytes(), bytes)
            .map_err(|e| e.critical("FailToStoreRequestedData"))?;
        for r in req.requesters {
            r.on_data(bytes)?;
        }
        Ok(true)
    }
}
