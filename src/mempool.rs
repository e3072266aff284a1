//! Bounded pools of pending transactions.
//!
//! A pool keeps transactions in arrival order and hands out block candidates as a strict prefix of
//! that order: transactions that are not valid for the block being built are skipped (they stay in
//! the pool), and packing stops at the first valid transaction that no longer fits the budget.
//! Selection and removal take the same lock, so a transaction being removed is never selected.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::{Hash, Timestamp};
use crate::error::{Error, Result};
use crate::metric::TxMetric;
use crate::state::WorldContext;
use crate::tx::{Transaction, TransactionList, TxGroup};

#[derive(Default)]
struct PoolInner {
    next_seq: u64,
    by_seq: BTreeMap<u64, Arc<Transaction>>,
    index: HashMap<Hash, u64>,
    bytes: usize,
}

impl PoolInner {
    fn remove(&mut self, id: &Hash) -> bool {
        match self.index.remove(id) {
            Some(seq) => {
                if let Some(tx) = self.by_seq.remove(&seq) {
                    self.bytes -= tx.size();
                }
                true
            }
            None => false,
        }
    }
}

pub struct TransactionPool {
    group: TxGroup,
    capacity: usize,
    inner: Mutex<PoolInner>,
    metric: TxMetric,
}

impl TransactionPool {
    pub fn new(group: TxGroup, capacity: usize) -> Self {
        Self {
            group,
            capacity,
            inner: Mutex::new(PoolInner::default()),
            metric: TxMetric::default(),
        }
    }

    pub fn group(&self) -> TxGroup {
        self.group
    }

    pub fn metric(&self) -> &TxMetric {
        &self.metric
    }

    pub fn add(&self, tx: Arc<Transaction>) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.index.contains_key(tx.id()) {
            return Err(Error::DuplicateTransaction(*tx.id()))
        }
        if inner.by_seq.len() >= self.capacity {
            return Err(Error::PoolFull(inner.by_seq.len()))
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.index.insert(*tx.id(), seq);
        inner.bytes += tx.size();
        inner.by_seq.insert(seq, tx);
        drop(inner);
        self.metric.on_add(1);
        Ok(())
    }

    fn is_valid(wc: &WorldContext, tx: &Transaction) -> Result<bool> {
        if tx
            .check_timestamp(wc.block().timestamp, wc.tx_threshold())
            .is_err()
        {
            return Ok(false)
        }
        Ok(!wc.is_finalized_tx(tx.id())?)
    }

    /// Packs a candidate list for the block described by `wc`. `max_count == 0` means no count
    /// limit. Returns the transactions and their total size.
    pub fn candidate(
        &self, wc: &WorldContext, max_bytes: usize, max_count: usize,
    ) -> Result<(Vec<Arc<Transaction>>, usize)> {
        let inner = self.inner.lock();
        let mut txs = Vec::new();
        let mut bytes = 0;
        for tx in inner.by_seq.values() {
            if max_count != 0 && txs.len() >= max_count {
                break
            }
            if !Self::is_valid(wc, tx)? {
                log::trace!("skip invalid candidate {}", tx.id());
                continue
            }
            if bytes + tx.size() > max_bytes {
                break
            }
            bytes += tx.size();
            txs.push(tx.clone());
        }
        Ok((txs, bytes))
    }

    /// Removes finalized transactions. Returns how many were actually in the pool.
    pub fn remove_list(&self, list: &TransactionList) -> usize {
        let mut inner = self.inner.lock();
        let removed = list.iter().filter(|tx| inner.remove(tx.id())).count();
        drop(inner);
        self.metric.on_remove(removed as u64);
        self.metric.on_finalize(list.len() as u64);
        removed
    }

    /// Evicts transactions older than `before`.
    pub fn remove_old_txs(&self, before: Timestamp) -> usize {
        let mut inner = self.inner.lock();
        let old: Vec<Hash> = inner
            .by_seq
            .values()
            .filter(|tx| tx.timestamp() < before)
            .map(|tx| *tx.id())
            .collect();
        for id in &old {
            inner.remove(id);
        }
        drop(inner);
        if !old.is_empty() {
            log::debug!("dropped {} expired transactions from {:?} pool", old.len(), self.group);
            self.metric.on_drop(old.len() as u64);
        }
        old.len()
    }

    pub fn has_tx(&self, id: &Hash) -> bool {
        self.inner.lock().index.contains_key(id)
    }

    pub fn get_tx(&self, id: &Hash) -> Option<Arc<Transaction>> {
        let inner = self.inner.lock();
        let seq = inner.index.get(id)?;
        inner.by_seq.get(seq).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().by_seq.is_empty()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.inner.lock().bytes
    }
}
