use std::sync::atomic::{AtomicU64, Ordering};

/// Counters of one transaction pool.
#[derive(Default, Debug)]
pub struct TxMetric {
    added: AtomicU64,
    removed: AtomicU64,
    dropped: AtomicU64,
    finalized: AtomicU64,
}

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct TxMetricSnapshot {
    pub added: u64,
    pub removed: u64,
    pub dropped: u64,
    pub finalized: u64,
}

impl TxMetric {
    pub fn on_add(&self, n: u64) {
        self.added.fetch_add(n, Ordering::Relaxed);
    }

    pub fn on_remove(&self, n: u64) {
        self.removed.fetch_add(n, Ordering::Relaxed);
    }

    /// Transactions evicted without being finalized (expired).
    pub fn on_drop(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn on_finalize(&self, n: u64) {
        self.finalized.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TxMetricSnapshot {
        TxMetricSnapshot {
            added: self.added.load(Ordering::Relaxed),
            removed: self.removed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            finalized: self.finalized.load(Ordering::Relaxed),
        }
    }
}
