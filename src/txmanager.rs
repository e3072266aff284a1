use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::common::{now_micros, Hash, Timestamp};
use crate::error::{Error, Result};
use crate::mempool::TransactionPool;
use crate::state::WorldContext;
use crate::tx::{Transaction, TxGroup, TxKind};

/// Freshness window for transaction timestamps.
#[derive(Clone, Copy, Debug)]
pub struct TimestampChecker {
    threshold: i64,
}

impl TimestampChecker {
    pub fn new(threshold: i64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> i64 {
        self.threshold
    }

    pub fn check(&self, tx: &Transaction, reference: Timestamp) -> Result<()> {
        tx.check_timestamp(reference, self.threshold)
    }

    pub fn check_now(&self, tx: &Transaction) -> Result<()> {
        self.check(tx, now_micros())
    }
}

/// Admission front of the two transaction pools.
pub struct TransactionManager {
    nid: u64,
    normal: TransactionPool,
    patch: TransactionPool,
    checker: TimestampChecker,
    /// Bumped on every admission; waiters sleep until it moves.
    generation: Mutex<u64>,
    admitted: Condvar,
}

impl TransactionManager {
    pub fn new(
        nid: u64, normal_size: usize, patch_size: usize, checker: TimestampChecker,
    ) -> Self {
        Self {
            nid,
            normal: TransactionPool::new(TxGroup::Normal, normal_size),
            patch: TransactionPool::new(TxGroup::Patch, patch_size),
            checker,
            generation: Mutex::new(0),
            admitted: Condvar::new(),
        }
    }

    pub fn pool(&self, group: TxGroup) -> &TransactionPool {
        match group {
            TxGroup::Normal => &self.normal,
            TxGroup::Patch => &self.patch,
        }
    }

    pub fn timestamp_checker(&self) -> &TimestampChecker {
        &self.checker
    }

    /// Validates and admits a submitted normal transaction. `direct` marks a submission from a
    /// local client, whose timestamp is checked against the current time; relayed transactions
    /// are only checked against the block they are proposed for. Patch transactions are never
    /// accepted here: they carry no signature, so anyone could forge one.
    pub fn add(&self, tx: Arc<Transaction>, direct: bool) -> Result<()> {
        if tx.kind() == TxKind::Patch {
            return Err(Error::InvalidTransaction(format!(
                "patch transaction {} from outside the node",
                tx.id()
            )))
        }
        self.admit(tx, direct)
    }

    /// Admits a patch transaction issued by this node.
    pub fn add_patch(&self, tx: Arc<Transaction>) -> Result<()> {
        if tx.kind() != TxKind::Patch {
            return Err(Error::InvalidTransaction(format!("{} is not a patch", tx.id())))
        }
        self.admit(tx, true)
    }

    fn admit(&self, tx: Arc<Transaction>, direct: bool) -> Result<()> {
        tx.verify()?;
        if self.nid != 0 && tx.nid() != self.nid {
            return Err(Error::InvalidTransaction(format!(
                "invalid network id {} (expected {})",
                tx.nid(),
                self.nid
            )))
        }
        if direct {
            self.checker.check_now(&tx)?;
        }
        if self.has_tx(tx.id()) {
            return Err(Error::DuplicateTransaction(*tx.id()))
        }
        let pool = match tx.kind() {
            TxKind::Normal => &self.normal,
            TxKind::Patch => &self.patch,
        };
        let id = *tx.id();
        pool.add(tx)?;
        log::debug!("admitted transaction {} to {:?} pool", id, pool.group());

        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        self.admitted.notify_all();
        Ok(())
    }

    pub fn has_tx(&self, id: &Hash) -> bool {
        self.normal.has_tx(id) || self.patch.has_tx(id)
    }

    /// Blocks until a transaction is admitted or `timeout` elapses, then calls `cb`. If the
    /// normal pool can already offer a candidate for `wc`, `cb` runs right away and the result is
    /// `false`.
    pub fn wait<F: FnOnce()>(&self, wc: &WorldContext, timeout: Duration, cb: F) -> bool {
        // admissions after this point move the generation, so none is missed while checking
        let start = *self.generation.lock();
        let ready = match self.normal.candidate(wc, usize::MAX, 1) {
            Ok((txs, _)) => !txs.is_empty(),
            Err(e) => {
                log::warn!("candidate check failed while waiting: {}", e);
                false
            }
        };
        if ready {
            cb();
            return false
        }
        let deadline = Instant::now() + timeout;
        let mut generation = self.generation.lock();
        while *generation == start {
            if self.admitted.wait_until(&mut generation, deadline).timed_out() {
                break
            }
        }
        drop(generation);
        cb();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Addr;
    use crate::db::MapDatabase;
    use crate::state::{BlockInfo, WorldSnapshot};
    use crate::tx::{PatchData, TxParams, DATA_TYPE_CALL, TX_VERSION};
    use std::sync::atomic::{AtomicBool, Ordering};

    const MINUTE: i64 = 60 * 1_000_000;

    fn manager() -> TransactionManager {
        TransactionManager::new(1, 10, 10, TimestampChecker::new(5 * MINUTE))
    }

    fn tx(n: u8, ts: Timestamp) -> Arc<Transaction> {
        let key = libsecp256k1::SecretKey::parse(&[n; 32]).unwrap();
        Arc::new(Transaction::sign(
            TxParams {
                version: TX_VERSION,
                to: Addr::new(false, [1; 20]),
                timestamp: ts as u64,
                nid: 1,
                data_type: DATA_TYPE_CALL.into(),
                ..Default::default()
            },
            &key,
        ))
    }

    fn context() -> WorldContext {
        let ws = Arc::new(WorldSnapshot::empty(MapDatabase::new_shared()));
        WorldContext::new(ws, BlockInfo::new(1, now_micros()), 5 * MINUTE)
    }

    #[test]
    fn test_add_classifies_and_checks() {
        let tm = manager();
        let now = now_micros();
        let t = tx(1, now);
        tm.add(t.clone(), true).unwrap();
        assert!(tm.pool(TxGroup::Normal).has_tx(t.id()));
        assert_eq!(tm.add(t.clone(), true), Err(Error::DuplicateTransaction(*t.id())));

        let old = tx(2, now - 10 * MINUTE);
        assert_eq!(tm.add(old.clone(), true), Err(Error::ExpiredTransaction(*old.id())));
        // relayed transactions are not checked against the local clock
        tm.add(old, false).unwrap();

        let future = tx(3, now + 10 * MINUTE);
        assert_eq!(tm.add(future.clone(), true), Err(Error::FutureTransaction(*future.id())));

        let patch = Arc::new(
            Transaction::new_patch(&PatchData::SkipTransaction { height: 1 }, now, 1).unwrap(),
        );
        assert!(matches!(tm.add(patch.clone(), true), Err(Error::InvalidTransaction(_))));
        assert!(matches!(tm.add(patch.clone(), false), Err(Error::InvalidTransaction(_))));
        assert!(!tm.has_tx(patch.id()));
        tm.add_patch(patch.clone()).unwrap();
        assert!(tm.pool(TxGroup::Patch).has_tx(patch.id()));
        assert!(tm.has_tx(patch.id()));
        assert!(matches!(tm.add_patch(tx(4, now)), Err(Error::InvalidTransaction(_))));
    }

    #[test]
    fn test_add_rejects_other_network() {
        let tm = TransactionManager::new(2, 10, 10, TimestampChecker::new(5 * MINUTE));
        assert!(matches!(
            tm.add(tx(1, now_micros()), true),
            Err(Error::InvalidTransaction(_))
        ));
    }

    #[test]
    fn test_wait_returns_immediately_with_candidate() {
        let tm = manager();
        tm.add(tx(1, now_micros()), true).unwrap();
        let called = AtomicBool::new(false);
        let waited = tm.wait(&context(), Duration::from_secs(10), || {
            called.store(true, Ordering::SeqCst)
        });
        assert!(!waited);
        assert!(called.load(Ordering::SeqCst));
    }

    #[test]
    fn test_wait_times_out() {
        let tm = manager();
        let start = Instant::now();
        assert!(tm.wait(&context(), Duration::from_millis(50), || ()));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_wait_wakes_on_admission() {
        let tm = Arc::new(manager());
        let waiter = {
            let tm = tm.clone();
            std::thread::spawn(move || {
                let start = Instant::now();
                let waited = tm.wait(&context(), Duration::from_secs(30), || ());
                (waited, start.elapsed())
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        tm.add(tx(1, now_micros()), true).unwrap();
        // woken by the admission (or, if it came first, served immediately)
        let (_, elapsed) = waiter.join().unwrap();
        assert!(elapsed < Duration::from_secs(30));
    }
}
