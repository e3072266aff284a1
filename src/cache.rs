//! Cache of recently computed or loaded transition results.
//!
//! Entries are keyed by result hash (plus validator list hash for world snapshots) and bounded
//! both by count and by approximate byte size, evicting the least recently used first. Each entry
//! is a write-once slot: concurrent misses on the same key share one load, while loads for
//! different keys run in parallel outside the cache lock. A failed load leaves nothing behind.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rlp_derive::{RlpDecodable, RlpEncodable};

use crate::common::Hash;
use crate::db::{BucketId, Database};
use crate::error::{Error, Result};
use crate::receipt::ReceiptList;
use crate::state::WorldSnapshot;
use crate::tx::TxGroup;

/// The persisted outcome of a transition. Its hash is the transition's result hash.
#[derive(RlpDecodable, RlpEncodable, Clone, PartialEq, Eq, Debug)]
pub struct TransitionResult {
    pub state_hash: Hash,
    pub patch_receipts_hash: Hash,
    pub normal_receipts_hash: Hash,
}

impl TransitionResult {
    pub fn encode(&self) -> Vec<u8> {
        rlp::encode(self).to_vec()
    }

    pub fn hash(&self) -> Hash {
        Hash::hash(&self.encode())
    }

    pub fn receipts_hash(&self, group: TxGroup) -> &Hash {
        match group {
            TxGroup::Patch => &self.patch_receipts_hash,
            TxGroup::Normal => &self.normal_receipts_hash,
        }
    }

    pub fn flush(&self, db: &dyn Database) -> Result<()> {
        let write = || -> Result<()> {
            let bk = db.get_bucket(BucketId::TRANSITION_RESULT)?;
            bk.set(self.hash().as_bytes(), &self.encode())
        };
        write().map_err(|e| e.critical("FailToFlushResult"))
    }

    pub fn load(db: &dyn Database, result: &Hash) -> Result<Self> {
        let raw = db
            .get_bucket(BucketId::TRANSITION_RESULT)?
            .get(result.as_bytes())?
            .ok_or_else(|| Error::NotFound(format!("transition result {}", result)))?;
        Ok(rlp::decode(&raw)?)
    }
}

type WorldKey = (Hash, Option<Hash>);
type WorldSlot = Arc<OnceCell<Arc<WorldSnapshot>>>;
type ReceiptKey = (Hash, TxGroup);
type ReceiptSlot = Arc<OnceCell<Arc<ReceiptList>>>;

struct CacheInner {
    worlds: LruCache<WorldKey, WorldSlot>,
    receipts: LruCache<ReceiptKey, ReceiptSlot>,
}

impl CacheInner {
    fn world_bytes(&self) -> usize {
        self.worlds
            .iter()
            .filter_map(|(_, slot)| slot.get())
            .map(|ws| ws.size_in_bytes())
            .sum()
    }

    fn receipt_bytes(&self) -> usize {
        self.receipts
            .iter()
            .filter_map(|(_, slot)| slot.get())
            .map(|rl| rl.size_in_bytes())
            .sum()
    }

    /// Evicts least recently used entries until the byte budget holds. The most recent entry is
    /// always kept.
    fn enforce_budget(&mut self, max_bytes: usize) {
        while self.worlds.len() > 1 && self.world_bytes() > max_bytes {
            if let Some((key, _)) = self.worlds.pop_lru() {
                log::trace!("evicted world snapshot of result {}", key.0);
            }
        }
        while self.receipts.len() > 1 && self.receipt_bytes() > max_bytes {
            self.receipts.pop_lru();
        }
    }
}

pub struct TransitionResultCache {
    db: Arc<dyn Database>,
    max_bytes: usize,
    inner: Mutex<CacheInner>,
}

impl TransitionResultCache {
    pub fn new(db: Arc<dyn Database>, max_entries: usize, max_bytes: usize) -> Self {
        let cap = |n: usize| NonZeroUsize::new(n).unwrap_or(NonZeroUsize::MIN);
        Self {
            db,
            max_bytes,
            inner: Mutex::new(CacheInner {
                worlds: LruCache::new(cap(max_entries)),
                // two receipt lists per result
                receipts: LruCache::new(cap(max_entries.saturating_mul(2))),
            }),
        }
    }

    pub fn database(&self) -> &Arc<dyn Database> {
        &self.db
    }

    fn world_slot(&self, key: &WorldKey) -> WorldSlot {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.worlds.get(key) {
            return slot.clone()
        }
        let slot = WorldSlot::default();
        inner.worlds.put(key.clone(), slot.clone());
        slot
    }

    fn receipt_slot(&self, key: &ReceiptKey) -> ReceiptSlot {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.receipts.get(key) {
            return slot.clone()
        }
        let slot = ReceiptSlot::default();
        inner.receipts.put(*key, slot.clone());
        slot
    }

    fn settle<K, V>(
        &self, slot: &Arc<OnceCell<V>>, result: &Result<&V>,
        pick: impl FnOnce(&mut CacheInner) -> &mut LruCache<K, Arc<OnceCell<V>>>, key: &K,
    ) where
        K: std::hash::Hash + Eq,
    {
        let mut inner = self.inner.lock();
        if result.is_err() {
            // drop the empty slot unless it has been replaced meanwhile
            let cache = pick(&mut inner);
            if cache.peek(key).map(|s| Arc::ptr_eq(s, slot)).unwrap_or(false) {
                cache.pop(key);
            }
            return
        }
        inner.enforce_budget(self.max_bytes);
    }

    /// World snapshot of a result. With `vl_hash` set, the validator list is loaded along with it;
    /// without it the snapshot carries an empty validator list.
    pub fn get_world_snapshot(
        &self, result: &Hash, vl_hash: Option<&Hash>,
    ) -> Result<Arc<WorldSnapshot>> {
        let key = (*result, vl_hash.cloned());
        let slot = self.world_slot(&key);
        let loaded = slot.get_or_try_init(|| {
            log::debug!("loading world snapshot of result {}", result);
            let tr = TransitionResult::load(&*self.db, result)?;
            Ok(Arc::new(WorldSnapshot::load(
                self.db.clone(),
                &tr.state_hash,
                vl_hash,
            )?))
        });
        self.settle(&slot, &loaded, |inner| &mut inner.worlds, &key);
        loaded.map(|ws| ws.clone())
    }

    pub fn get_receipts(&self, result: &Hash, group: TxGroup) -> Result<Arc<ReceiptList>> {
        let key = (*result, group);
        let slot = self.receipt_slot(&key);
        let loaded = slot.get_or_try_init(|| {
            let tr = TransitionResult::load(&*self.db, result)?;
            Ok(Arc::new(ReceiptList::load(&*self.db, tr.receipts_hash(group))?))
        });
        self.settle(&slot, &loaded, |inner| &mut inner.receipts, &key);
        loaded.map(|rl| rl.clone())
    }

    /// Registers the output of a transition that has just been computed.
    pub fn put(
        &self, result: &Hash, snapshot: Arc<WorldSnapshot>, patch_receipts: Arc<ReceiptList>,
        normal_receipts: Arc<ReceiptList>,
    ) {
        let key = (*result, snapshot.validators().hash());
        let mut inner = self.inner.lock();
        inner
            .worlds
            .put(key, Arc::new(OnceCell::with_value(snapshot)));
        inner.receipts.put(
            (*result, TxGroup::Patch),
            Arc::new(OnceCell::with_value(patch_receipts)),
        );
        inner.receipts.put(
            (*result, TxGroup::Normal),
            Arc::new(OnceCell::with_value(normal_receipts)),
        );
        inner.enforce_budget(self.max_bytes);
    }

    pub fn contains(&self, result: &Hash, vl_hash: Option<&Hash>) -> bool {
        let key = (*result, vl_hash.cloned());
        self.inner
            .lock()
            .worlds
            .peek(&key)
            .map(|slot| slot.get().is_some())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().worlds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size_in_bytes(&self) -> usize {
        self.inner.lock().world_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Addr;
    use crate::db::MapDatabase;
    use crate::state::WorldState;

    fn stored_result(db: &Arc<dyn Database>, n: u8) -> (Hash, Arc<WorldSnapshot>) {
        let mut ws = WorldState::new(Arc::new(WorldSnapshot::empty(db.clone())));
        ws.get_account(&Addr::new(false, [n; 20]))
            .set_balance((n as u64 + 1).into());
        let snapshot = Arc::new(ws.get_snapshot());
        snapshot.flush().unwrap();
        let receipts = ReceiptList::default();
        receipts.flush(&**db).unwrap();
        let tr = TransitionResult {
            state_hash: *snapshot.hash(),
            patch_receipts_hash: *receipts.hash(),
            normal_receipts_hash: *receipts.hash(),
        };
        tr.flush(&**db).unwrap();
        (tr.hash(), snapshot)
    }

    #[test]
    fn test_hit_returns_same_snapshot() {
        let db = MapDatabase::new_shared();
        let (result, snapshot) = stored_result(&db, 1);
        let cache = TransitionResultCache::new(db, 2, usize::MAX);
        let a = cache.get_world_snapshot(&result, None).unwrap();
        assert_eq!(a.hash(), snapshot.hash());
        let b = cache.get_world_snapshot(&result, None).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_lru_eviction_and_reload() {
        let db = MapDatabase::new_shared();
        let results: Vec<_> = (1..=3).map(|n| stored_result(&db, n)).collect();
        let cache = TransitionResultCache::new(db, 2, usize::MAX);
        for (r, _) in &results {
            cache.get_world_snapshot(r, None).unwrap();
        }
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&results[0].0, None));
        let again = cache.get_world_snapshot(&results[0].0, None).unwrap();
        assert_eq!(again.hash(), results[0].1.hash());
        assert!(!cache.contains(&results[1].0, None));
    }

    #[test]
    fn test_byte_budget() {
        let db = MapDatabase::new_shared();
        let results: Vec<_> = (1..=3).map(|n| stored_result(&db, n)).collect();
        let one = results[0].1.size_in_bytes();
        let cache = TransitionResultCache::new(db, 10, one + one / 2);
        for (r, _) in &results {
            cache.get_world_snapshot(r, None).unwrap();
        }
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&results[2].0, None));
    }

    #[test]
    fn test_unknown_result_is_not_cached() {
        let db = MapDatabase::new_shared();
        let cache = TransitionResultCache::new(db, 2, usize::MAX);
        let unknown = Hash::hash(b"unknown");
        assert!(cache.get_world_snapshot(&unknown, None).unwrap_err().is_not_found());
        assert!(cache.get_receipts(&unknown, TxGroup::Normal).unwrap_err().is_not_found());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_concurrent_misses_share_one_load() {
        let db = MapDatabase::new_shared();
        let (result, _) = stored_result(&db, 1);
        let cache = Arc::new(TransitionResultCache::new(db, 2, usize::MAX));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || cache.get_world_snapshot(&result, None).unwrap())
            })
            .collect();
        let snapshots: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for s in &snapshots[1..] {
            assert!(Arc::ptr_eq(s, &snapshots[0]));
        }
    }

    #[test]
    fn test_receipts() {
        let db = MapDatabase::new_shared();
        let (result, _) = stored_result(&db, 1);
        let cache = TransitionResultCache::new(db, 2, usize::MAX);
        assert!(cache.get_receipts(&result, TxGroup::Patch).unwrap().is_empty());
        assert!(cache.get_receipts(&result, TxGroup::Normal).unwrap().is_empty());
    }
}
