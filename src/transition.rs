//! One block's worth of execution.
//!
//! A [Transition] goes `Created -> Executing -> Complete | Failed`, never backwards. Only a
//! `Complete` transition can serve as a parent or be finalized; its output (world snapshot,
//! receipts and the [TransitionResult] naming them) is a pure function of the parent snapshot,
//! the two transaction lists and the block info.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::cache::{TransitionResult, TransitionResultCache};
use crate::common::Hash;
use crate::error::{invariant_violation, Error, Result};
use crate::executor::TxExecutor;
use crate::processor::{run_tx_list, skips_height};
use crate::receipt::ReceiptList;
use crate::state::{BlockInfo, WorldSnapshot, WorldState};
use crate::trace::TraceLogger;
use crate::tx::{TransactionList, TxGroup};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Step {
    Created,
    Executing,
    Complete,
    Failed,
}

pub struct TransitionOutput {
    pub world: Arc<WorldSnapshot>,
    pub patch_receipts: Arc<ReceiptList>,
    pub normal_receipts: Arc<ReceiptList>,
    pub result: TransitionResult,
    pub result_hash: Hash,
}

impl TransitionOutput {
    fn new(
        world: Arc<WorldSnapshot>, patch_receipts: Arc<ReceiptList>,
        normal_receipts: Arc<ReceiptList>,
    ) -> Self {
        let result = TransitionResult {
            state_hash: *world.hash(),
            patch_receipts_hash: *patch_receipts.hash(),
            normal_receipts_hash: *normal_receipts.hash(),
        };
        Self {
            result_hash: result.hash(),
            world,
            patch_receipts,
            normal_receipts,
            result,
        }
    }

    pub fn receipts(&self, group: TxGroup) -> &Arc<ReceiptList> {
        match group {
            TxGroup::Patch => &self.patch_receipts,
            TxGroup::Normal => &self.normal_receipts,
        }
    }
}

const FINALIZED_NORMAL: u8 = 0x1;
const FINALIZED_PATCH: u8 = 0x2;
const FINALIZED_RESULT: u8 = 0x4;

pub struct Transition {
    parent: Option<Arc<Transition>>,
    patch_txs: Arc<TransactionList>,
    normal_txs: Arc<TransactionList>,
    block: BlockInfo,
    cache: Arc<TransitionResultCache>,
    logger: TraceLogger,
    step: Mutex<Step>,
    output: OnceCell<TransitionOutput>,
    finalized: AtomicU8,
}

impl Transition {
    /// A transition on top of `parent`, which must be complete.
    pub fn new(
        parent: &Arc<Transition>, patch_txs: TransactionList, normal_txs: TransactionList,
        block: BlockInfo, logger: TraceLogger,
    ) -> Result<Arc<Self>> {
        Self::with_lists(
            parent,
            Arc::new(patch_txs),
            Arc::new(normal_txs),
            block,
            logger,
        )
    }

    fn with_lists(
        parent: &Arc<Transition>, patch_txs: Arc<TransactionList>,
        normal_txs: Arc<TransactionList>, block: BlockInfo, logger: TraceLogger,
    ) -> Result<Arc<Self>> {
        let step = parent.step();
        if step != Step::Complete {
            return Err(Error::IllegalArgument(format!(
                "parent transition is not complete ({:?})",
                step
            )))
        }
        Ok(Arc::new(Self {
            parent: Some(parent.clone()),
            patch_txs,
            normal_txs,
            block,
            cache: parent.cache.clone(),
            logger,
            step: Mutex::new(Step::Created),
            output: OnceCell::new(),
            finalized: AtomicU8::new(0),
        }))
    }

    /// A complete transition standing for an already computed result, or for the empty world
    /// when `result` is `None`.
    pub fn initial(
        cache: Arc<TransitionResultCache>, result: Option<&Hash>, vl_hash: Option<&Hash>,
        logger: TraceLogger,
    ) -> Result<Arc<Self>> {
        let output = match result {
            Some(result) => {
                let out = TransitionOutput::new(
                    cache.get_world_snapshot(result, vl_hash)?,
                    cache.get_receipts(result, TxGroup::Patch)?,
                    cache.get_receipts(result, TxGroup::Normal)?,
                );
                if &out.result_hash != result {
                    return Err(Error::Codec(format!("inconsistent result {}", result)))
                }
                out
            }
            None => {
                let world = WorldSnapshot::empty(cache.database().clone());
                let world = match vl_hash {
                    Some(h) => {
                        let vl = crate::state::ValidatorList::load(&**cache.database(), Some(h))?;
                        world.with_validators(Arc::new(vl))
                    }
                    None => world,
                };
                TransitionOutput::new(
                    Arc::new(world),
                    Arc::new(ReceiptList::new(Vec::new())),
                    Arc::new(ReceiptList::new(Vec::new())),
                )
            }
        };
        let t = Self {
            parent: None,
            patch_txs: Arc::new(TransactionList::empty()),
            normal_txs: Arc::new(TransactionList::empty()),
            block: BlockInfo::new(-1, 0),
            cache,
            logger,
            step: Mutex::new(Step::Complete),
            output: OnceCell::with_value(output),
            finalized: AtomicU8::new(0),
        };
        Ok(Arc::new(t))
    }

    /// Same parent, normal transactions and block as `self`, with another patch list. The new
    /// transition starts over from `Created`.
    pub fn patched(&self, patch_txs: TransactionList) -> Result<Arc<Self>> {
        let parent = self
            .parent
            .as_ref()
            .ok_or_else(|| Error::IllegalArgument("cannot patch an initial transition".into()))?;
        Self::with_lists(
            parent,
            Arc::new(patch_txs),
            self.normal_txs.clone(),
            self.block,
            self.logger.clone(),
        )
    }

    pub fn step(&self) -> Step {
        *self.step.lock()
    }

    pub fn parent(&self) -> Option<&Arc<Transition>> {
        self.parent.as_ref()
    }

    pub fn block(&self) -> &BlockInfo {
        &self.block
    }

    pub fn patch_transactions(&self) -> &Arc<TransactionList> {
        &self.patch_txs
    }

    pub fn normal_transactions(&self) -> &Arc<TransactionList> {
        &self.normal_txs
    }

    pub fn transactions(&self, group: TxGroup) -> &Arc<TransactionList> {
        match group {
            TxGroup::Patch => &self.patch_txs,
            TxGroup::Normal => &self.normal_txs,
        }
    }

    /// Available once the transition is complete.
    pub fn output(&self) -> Option<&TransitionOutput> {
        self.output.get()
    }

    pub fn result_hash(&self) -> Option<&Hash> {
        self.output().map(|o| &o.result_hash)
    }

    pub fn world_snapshot(&self) -> Option<&Arc<WorldSnapshot>> {
        self.output().map(|o| &o.world)
    }

    /// Executes the patch list, then the normal list, on top of the parent's world. Can only be
    /// called once; a failed execution leaves the transition `Failed` for good.
    pub async fn execute(&self, executor: &dyn TxExecutor) -> Result<()> {
        {
            let mut step = self.step.lock();
            if *step != Step::Created {
                return Err(Error::InvalidState(format!("transition already {:?}", *step)))
            }
            *step = Step::Executing;
        }
        match self.run(executor).await {
            Ok(output) => {
                log::debug!(
                    "transition of block {} complete: result {}",
                    self.block.height,
                    output.result_hash
                );
                self.cache.put(
                    &output.result_hash,
                    output.world.clone(),
                    output.patch_receipts.clone(),
                    output.normal_receipts.clone(),
                );
                if self.output.set(output).is_err() {
                    invariant_violation("transition output set twice")
                }
                *self.step.lock() = Step::Complete;
                Ok(())
            }
            Err(e) => {
                log::warn!("transition of block {} failed: {}", self.block.height, e);
                *self.step.lock() = Step::Failed;
                Err(e)
            }
        }
    }

    async fn run(&self, executor: &dyn TxExecutor) -> Result<TransitionOutput> {
        let base = match self.parent.as_ref().and_then(|p| p.world_snapshot()) {
            Some(ws) => ws.clone(),
            None => invariant_violation("executing a transition without a complete parent"),
        };
        let mut ws = WorldState::new(base);
        let patch_receipts = run_tx_list(
            executor,
            &mut ws,
            &self.patch_txs,
            &self.block,
            false,
            &self.logger.with_prefix("patch "),
        )
        .await?;
        let skip = skips_height(&self.patch_txs, self.block.height);
        if skip {
            self.logger.tsystem(format_args!(
                "skipping {} transactions of block {}",
                self.normal_txs.len(),
                self.block.height
            ));
        }
        let normal_receipts = run_tx_list(
            executor,
            &mut ws,
            &self.normal_txs,
            &self.block,
            skip,
            &self.logger,
        )
        .await?;
        Ok(TransitionOutput::new(
            Arc::new(ws.get_snapshot()),
            Arc::new(patch_receipts),
            Arc::new(normal_receipts),
        ))
    }

    fn complete_output(&self, what: &str) -> &TransitionOutput {
        match (self.step(), self.output()) {
            (Step::Complete, Some(out)) => out,
            (step, _) => invariant_violation(format!("{} on a transition in step {:?}", what, step)),
        }
    }

    /// Runs `flush` unless the component was already finalized. Returns whether it ran.
    fn finalize_once(&self, flag: u8, flush: impl FnOnce() -> Result<()>) -> Result<bool> {
        if self.finalized.load(Ordering::Acquire) & flag != 0 {
            return Ok(false)
        }
        flush()?;
        Ok(self.finalized.fetch_or(flag, Ordering::AcqRel) & flag == 0)
    }

    /// Persists the normal transaction list with its locators.
    pub fn finalize_normal(&self) -> Result<bool> {
        self.complete_output("finalize_normal");
        self.finalize_once(FINALIZED_NORMAL, || {
            self.normal_txs.flush(&**self.cache.database(), true)
        })
    }

    pub fn finalize_patch(&self) -> Result<bool> {
        self.complete_output("finalize_patch");
        self.finalize_once(FINALIZED_PATCH, || {
            self.patch_txs.flush(&**self.cache.database(), true)
        })
    }

    /// Persists the world snapshot (new code included), both receipt lists and the result
    /// record.
    pub fn finalize_result(&self) -> Result<bool> {
        let out = self.complete_output("finalize_result");
        self.finalize_once(FINALIZED_RESULT, || {
            let db = &**self.cache.database();
            out.world.flush()?;
            out.patch_receipts.flush(db)?;
            out.normal_receipts.flush(db)?;
            out.result.flush(db)
        })
    }
}

impl fmt::Debug for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transition")
            .field("height", &self.block.height)
            .field("step", &self.step())
            .field("patch_txs", &self.patch_txs.len())
            .field("normal_txs", &self.normal_txs.len())
            .field("result", &self.result_hash())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Addr;
    use crate::db::MapDatabase;
    use crate::executor::BasicExecutor;
    use crate::tx::{Transaction, TxParams, DATA_TYPE_CALL, TX_VERSION};
    use futures::executor::block_on;

    fn genesis() -> Arc<Transition> {
        let cache = Arc::new(TransitionResultCache::new(MapDatabase::new_shared(), 4, 1 << 20));
        Transition::initial(cache, None, None, TraceLogger::default()).unwrap()
    }

    fn transfer(n: u8) -> Arc<Transaction> {
        let key = libsecp256k1::SecretKey::parse(&[n; 32]).unwrap();
        Arc::new(Transaction::sign(
            TxParams {
                version: TX_VERSION,
                to: Addr::new(false, [n; 20]),
                data_type: DATA_TYPE_CALL.into(),
                ..Default::default()
            },
            &key,
        ))
    }

    fn child(parent: &Arc<Transition>, txs: Vec<Arc<Transaction>>) -> Arc<Transition> {
        Transition::new(
            parent,
            TransactionList::empty(),
            TransactionList::new(txs),
            BlockInfo::new(parent.block().height + 1, 0),
            TraceLogger::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_step_and_parent_guard() {
        let g = genesis();
        assert_eq!(g.step(), Step::Complete);
        let t = child(&g, vec![transfer(1)]);
        assert_eq!(t.step(), Step::Created);
        assert!(t.output().is_none());
        assert!(matches!(
            Transition::new(
                &t,
                TransactionList::empty(),
                TransactionList::empty(),
                BlockInfo::new(2, 0),
                TraceLogger::default()
            ),
            Err(Error::IllegalArgument(_))
        ));

        block_on(t.execute(&BasicExecutor)).unwrap();
        assert_eq!(t.step(), Step::Complete);
        assert_eq!(t.output().unwrap().normal_receipts.len(), 1);
        assert!(matches!(block_on(t.execute(&BasicExecutor)), Err(Error::InvalidState(_))));
        child(&t, vec![]);
    }

    #[test]
    fn test_deterministic_result() {
        let g = genesis();
        let a = child(&g, vec![transfer(1), transfer(2)]);
        let b = child(&g, vec![transfer(1), transfer(2)]);
        block_on(a.execute(&BasicExecutor)).unwrap();
        block_on(b.execute(&BasicExecutor)).unwrap();
        assert_eq!(a.result_hash(), b.result_hash());
        let c = child(&g, vec![transfer(2), transfer(1)]);
        block_on(c.execute(&BasicExecutor)).unwrap();
        assert_ne!(a.result_hash(), c.result_hash());
    }

    #[test]
    fn test_finalize_is_idempotent_and_reloadable() {
        let g = genesis();
        let t = child(&g, vec![transfer(1)]);
        block_on(t.execute(&BasicExecutor)).unwrap();
        assert!(t.finalize_normal().unwrap());
        assert!(!t.finalize_normal().unwrap());
        assert!(t.finalize_result().unwrap());
        assert!(!t.finalize_result().unwrap());
        assert!(t.finalize_patch().unwrap());

        let result = *t.result_hash().unwrap();
        let fresh = Arc::new(TransitionResultCache::new(g.cache.database().clone(), 4, 1 << 20));
        let reloaded = Transition::initial(fresh, Some(&result), None, TraceLogger::default())
            .unwrap();
        assert_eq!(reloaded.result_hash(), Some(&result));
        assert_eq!(
            reloaded.output().unwrap().normal_receipts.get(0),
            t.output().unwrap().normal_receipts.get(0)
        );
    }

    #[test]
    #[should_panic(expected = "invariant violation")]
    fn test_finalize_before_complete_panics() {
        let g = genesis();
        let t = child(&g, vec![]);
        let _ = t.finalize_result();
    }

    #[test]
    fn test_patched_keeps_parent_and_normal_list() {
        let g = genesis();
        let t = child(&g, vec![transfer(1)]);
        let patch = Arc::new(
            Transaction::new_patch(
                &crate::tx::PatchData::SkipTransaction { height: 0 },
                0,
                0,
            )
            .unwrap(),
        );
        let p = t.patched(TransactionList::new(vec![patch])).unwrap();
        assert_eq!(p.step(), Step::Created);
        assert!(Arc::ptr_eq(p.parent().unwrap(), &g));
        assert_eq!(p.normal_transactions().hash(), t.normal_transactions().hash());
        block_on(p.execute(&BasicExecutor)).unwrap();
        let out = p.output().unwrap();
        assert_eq!(
            out.normal_receipts.get(0).unwrap().status,
            crate::receipt::ReceiptStatus::Skipped
        );
        assert!(g.patched(TransactionList::empty()).is_err());
    }
}
