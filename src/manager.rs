//! Top-level orchestration: proposing, creating, patching and finalizing transitions, admitting
//! transactions, and answering point queries against computed results.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use bitflags::bitflags;
use serde_json::Value;
use thiserror::Error;

use crate::cache::TransitionResultCache;
use crate::codec::TypedValue;
use crate::common::{Addr, Amount, Hash, U256};
use crate::config::ServiceConfig;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::executor::TxExecutor;
use crate::receipt::ReceiptList;
use crate::state::world::{
    VAR_MEMBERS, VAR_MINIMIZE_BLOCK_GEN, VAR_NETWORK, VAR_ROUND_LIMIT_FACTOR, VAR_TOTAL_SUPPLY,
};
use crate::state::{ApiInfo, BlockInfo, ReadOnlyWorldState, ValidatorList, WorldContext};
use crate::trace::TraceLogger;
use crate::transition::{Step, Transition};
use crate::tx::{PatchData, Transaction, TransactionList, TxGroup, DATA_TYPE_CALL};
use crate::txmanager::{TimestampChecker, TransactionManager};

bitflags! {
    /// Components committed by [Manager::finalize].
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct FinalizeOptions: u8 {
        const NORMAL_TRANSACTIONS = 0x1;
        const PATCH_TRANSACTIONS = 0x2;
        const RESULT = 0x4;
    }
}

/// Protocol id under which new transactions are relayed.
pub const PROTO_PROPAGATE_TRANSACTION: u16 = 0x1001;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PropagateError {
    #[error("network not available")]
    NotAvailable,
    #[error("propagation failed: {0}")]
    Failed(String),
}

/// Relays admitted transactions to peers.
pub trait TxPropagator: Send + Sync {
    fn propagate(&self, protocol: u16, tx: &[u8]) -> std::result::Result<(), PropagateError>;
}

/// The accepted shapes of a submitted transaction.
pub enum TxInput {
    Bytes(Vec<u8>),
    Json(String),
    Typed(Arc<Transaction>),
}

pub struct Manager {
    config: ServiceConfig,
    cache: Arc<TransitionResultCache>,
    tm: Arc<TransactionManager>,
    executor: Arc<dyn TxExecutor>,
    propagator: Option<Arc<dyn TxPropagator>>,
    skip_patch: ArcSwapOption<PatchData>,
    logger: TraceLogger,
}

impl Manager {
    pub fn new(
        config: ServiceConfig, db: Arc<dyn Database>, executor: Arc<dyn TxExecutor>,
        propagator: Option<Arc<dyn TxPropagator>>,
    ) -> Self {
        let cache = Arc::new(TransitionResultCache::new(
            db,
            config.result_cache_entry_count,
            config.result_cache_entry_size,
        ));
        let tm = Arc::new(TransactionManager::new(
            config.nid,
            config.normal_tx_pool_size,
            config.patch_tx_pool_size,
            TimestampChecker::new(config.tx_timestamp_threshold_us),
        ));
        Self {
            config,
            cache,
            tm,
            executor,
            propagator,
            skip_patch: ArcSwapOption::empty(),
            logger: TraceLogger::default(),
        }
    }

    pub fn with_logger(mut self, logger: TraceLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn database(&self) -> &Arc<dyn Database> {
        self.cache.database()
    }

    pub fn cache(&self) -> &Arc<TransitionResultCache> {
        &self.cache
    }

    pub fn tx_manager(&self) -> &Arc<TransactionManager> {
        &self.tm
    }

    pub fn executor(&self) -> &Arc<dyn TxExecutor> {
        &self.executor
    }

    fn world_context(&self, parent: &Transition, block: BlockInfo) -> Result<WorldContext> {
        let world = match (parent.step(), parent.world_snapshot()) {
            (Step::Complete, Some(ws)) => ws.clone(),
            (step, _) => {
                return Err(Error::IllegalArgument(format!(
                    "parent transition is not complete ({:?})",
                    step
                )))
            }
        };
        Ok(WorldContext::new(world, block, self.tm.timestamp_checker().threshold()))
    }

    /// Packs pending normal transactions into a new transition on top of `parent`. The proposal
    /// carries no patches; they are attached with [get_patches](Self::get_patches) and
    /// [patch_transition](Self::patch_transition).
    pub fn propose_transition(
        &self, parent: &Arc<Transition>, block: BlockInfo,
    ) -> Result<Arc<Transition>> {
        let wc = self.world_context(parent, block)?;
        let (normal, bytes) = self.tm.pool(TxGroup::Normal).candidate(
            &wc,
            self.config.max_tx_bytes_in_block,
            self.config.max_tx_count,
        )?;
        log::debug!(
            "proposing block {} with {} transactions ({} bytes)",
            block.height,
            normal.len(),
            bytes
        );
        Transition::new(
            parent,
            TransactionList::empty(),
            TransactionList::new(normal),
            block,
            self.logger.clone(),
        )
    }

    /// A complete transition for an already computed result; `None` stands for the empty world.
    pub fn create_initial_transition(
        &self, result: Option<&Hash>, vl_hash: Option<&Hash>,
    ) -> Result<Arc<Transition>> {
        Transition::initial(self.cache.clone(), result, vl_hash, self.logger.clone())
    }

    /// A transition for a block received from elsewhere.
    pub fn create_transition(
        &self, parent: &Arc<Transition>, normal_txs: TransactionList, block: BlockInfo,
    ) -> Result<Arc<Transition>> {
        for tx in normal_txs.iter() {
            tx.verify()?;
        }
        Transition::new(
            parent,
            TransactionList::empty(),
            normal_txs,
            block,
            self.logger.clone(),
        )
    }

    fn patches_for(&self, wc: &WorldContext) -> Result<TransactionList> {
        let (mut txs, _) =
            self.tm
                .pool(TxGroup::Patch)
                .candidate(wc, self.config.max_tx_bytes_in_block, 0)?;
        if let Some(patch) = self.skip_patch.load_full() {
            let PatchData::SkipTransaction { height } = *patch;
            if height.checked_add(1) == Some(wc.block().height) {
                let tx = Transaction::new_patch(&patch, wc.block().timestamp, self.config.nid)?;
                if txs.iter().all(|t| t.id() != tx.id()) {
                    txs.push(Arc::new(tx));
                }
            }
        }
        Ok(TransactionList::new(txs))
    }

    /// Patch transactions to apply on top of `parent` for `block`.
    pub fn get_patches(&self, parent: &Arc<Transition>, block: BlockInfo) -> Result<TransactionList> {
        let wc = self.world_context(parent, block)?;
        self.patches_for(&wc)
    }

    pub fn patch_transition(
        &self, transition: &Arc<Transition>, patch_txs: TransactionList,
    ) -> Result<Arc<Transition>> {
        for tx in patch_txs.iter() {
            tx.verify()?;
        }
        transition.patched(patch_txs)
    }

    /// Registers an administrative patch. A skip-transaction patch replaces any pending one of a
    /// lower height.
    pub fn send_patch(&self, patch: PatchData) -> Result<()> {
        let PatchData::SkipTransaction { height } = patch;
        if !(1..i64::MAX).contains(&height) {
            return Err(Error::InvalidPatchData(format!("invalid height {}", height)))
        }
        let new = Arc::new(patch);
        let mut current = self.skip_patch.load_full();
        loop {
            if let Some(cur) = &current {
                let PatchData::SkipTransaction { height: h } = **cur;
                if h >= height {
                    log::debug!("ignoring skip patch for {}; {} is pending", height, h);
                    return Ok(())
                }
            }
            let prev = self.skip_patch.compare_and_swap(&current, Some(new.clone()));
            let swapped = match (&*prev, &current) {
                (Some(p), Some(c)) => Arc::ptr_eq(p, c),
                (None, None) => true,
                _ => false,
            };
            if swapped {
                log::info!("skip transaction patch registered for height {}", height);
                return Ok(())
            }
            current = arc_swap::Guard::into_inner(prev);
        }
    }

    /// Commits the selected components of a complete transition. Each component is committed at
    /// most once, however often it is requested.
    pub fn finalize(&self, transition: &Transition, opts: FinalizeOptions) -> Result<()> {
        let threshold = self.tm.timestamp_checker().threshold();
        let before = transition.block().timestamp.saturating_sub(threshold);
        if opts.contains(FinalizeOptions::NORMAL_TRANSACTIONS) && transition.finalize_normal()? {
            let pool = self.tm.pool(TxGroup::Normal);
            let removed = pool.remove_list(transition.normal_transactions());
            pool.remove_old_txs(before);
            log::debug!(
                "finalized {} transactions of block {} ({} pooled)",
                transition.normal_transactions().len(),
                transition.block().height,
                removed
            );
        }
        if opts.contains(FinalizeOptions::PATCH_TRANSACTIONS) && transition.finalize_patch()? {
            let pool = self.tm.pool(TxGroup::Patch);
            pool.remove_list(transition.patch_transactions());
            pool.remove_old_txs(before);
            self.clear_applied_skip(transition);
        }
        if opts.contains(FinalizeOptions::RESULT) && transition.finalize_result()? {
            if let Some(out) = transition.output() {
                log::info!(
                    "finalized result {} of block {} (world {}, {} bytes)",
                    out.result_hash,
                    transition.block().height,
                    out.world.hash(),
                    out.world.size_in_bytes()
                );
            }
        }
        Ok(())
    }

    fn clear_applied_skip(&self, transition: &Transition) {
        let current = self.skip_patch.load_full();
        if let Some(patch) = &current {
            let applied = transition
                .patch_transactions()
                .iter()
                .any(|tx| tx.patch_data().ok().flatten().as_ref() == Some(&**patch));
            if applied {
                self.skip_patch.compare_and_swap(&current, None::<Arc<PatchData>>);
            }
        }
    }

    /// Parses, admits and relays a transaction. Returns its id.
    pub fn send_transaction(&self, input: TxInput) -> Result<Hash> {
        let tx = match input {
            TxInput::Bytes(b) => Arc::new(Transaction::from_bytes(&b)?),
            TxInput::Json(s) => {
                let js: Value = serde_json::from_str(&s)
                    .map_err(|e| Error::InvalidTransaction(e.to_string()))?;
                Arc::new(Transaction::from_json(&js)?)
            }
            TxInput::Typed(tx) => tx,
        };
        let id = *tx.id();
        self.tm.add(tx.clone(), true)?;
        if let Some(p) = &self.propagator {
            match p.propagate(PROTO_PROPAGATE_TRANSACTION, tx.bytes()) {
                Ok(()) | Err(PropagateError::NotAvailable) => {}
                Err(e) => log::trace!("failed to propagate {}: {}", id, e),
            }
        }
        Ok(id)
    }

    fn read_world(&self, result: &Hash, vl_hash: Option<&Hash>) -> Result<ReadOnlyWorldState> {
        Ok(ReadOnlyWorldState::new(
            self.cache.get_world_snapshot(result, vl_hash)?,
        ))
    }

    /// Read-only contract call. `js` is `{"to", "dataType": "call", "data": {"method", "params"}}`.
    pub fn call(&self, result: &Hash, vl_hash: Option<&Hash>, js: &Value) -> Result<Value> {
        let field = |name: &str| {
            js.get(name)
                .ok_or_else(|| Error::InvalidQuery(format!("missing {}", name)))
        };
        let to: Addr = field("to")?
            .as_str()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::InvalidQuery("bad to".into()))?;
        if field("dataType")?.as_str() != Some(DATA_TYPE_CALL) {
            return Err(Error::InvalidQuery("dataType must be call".into()))
        }
        let data = field("data")?;
        let method = data
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidQuery("missing method".into()))?;
        let params = data.get("params").cloned().unwrap_or(Value::Null);
        let ws = self.read_world(result, vl_hash)?;
        self.executor.query(&ws, &to, method, &params)
    }

    pub fn get_balance(&self, result: &Hash, addr: &Addr) -> Result<Amount> {
        Ok(self
            .read_world(result, None)?
            .get_account(addr)
            .map(|a| a.balance().clone())
            .unwrap_or_default())
    }

    fn system_int(&self, result: &Hash, name: &str) -> Result<Option<U256>> {
        match self.read_world(result, None)?.get_system_var(name)? {
            Some(v) => match v.as_int() {
                Some(i) => Ok(Some(*i)),
                None => Err(Error::Codec(format!("{} is not an integer", name))),
            },
            None => Ok(None),
        }
    }

    pub fn get_total_supply(&self, result: &Hash) -> Result<Amount> {
        Ok(self
            .system_int(result, VAR_TOTAL_SUPPLY)?
            .map(Amount::from)
            .unwrap_or_default())
    }

    pub fn get_network_id(&self, result: &Hash) -> Result<u64> {
        let nid = self
            .system_int(result, VAR_NETWORK)?
            .ok_or_else(|| Error::NotFound("network id".into()))?;
        if nid.bits() > 64 {
            return Err(Error::Codec(format!("network id {} out of range", nid)))
        }
        Ok(nid.low_u64())
    }

    pub fn get_api_info(&self, result: &Hash, addr: &Addr) -> Result<ApiInfo> {
        if !addr.is_contract() {
            return Err(Error::NotContractAddress(addr.to_string()))
        }
        self.read_world(result, None)?
            .get_account(addr)
            .and_then(|a| a.api_info().cloned())
            .ok_or_else(|| Error::NoActiveContract(addr.to_string()))
    }

    /// Network members; empty when membership is not restricted.
    pub fn get_members(&self, result: &Hash) -> Result<Vec<Addr>> {
        match self.read_world(result, None)?.get_system_var(VAR_MEMBERS)? {
            Some(TypedValue::List(items)) => items
                .iter()
                .map(|v| {
                    v.as_address()
                        .cloned()
                        .ok_or_else(|| Error::Codec("member is not an address".into()))
                })
                .collect(),
            Some(_) => Err(Error::Codec("members is not a list".into())),
            None => Ok(Vec::new()),
        }
    }

    /// Round limit for `validators` validators: `ceil(validators * factor / 3)`, 0 when the factor
    /// is unset or unreadable.
    pub fn get_round_limit(&self, result: &Hash, validators: usize) -> i64 {
        let factor = match self.system_int(result, VAR_ROUND_LIMIT_FACTOR) {
            Ok(Some(f)) if f.bits() <= 32 => f.low_u64() as i64,
            _ => return 0,
        };
        i64::try_from(validators)
            .unwrap_or(i64::MAX)
            .saturating_mul(factor)
            .saturating_add(2)
            / 3
    }

    pub fn get_minimize_block_gen(&self, result: &Hash) -> bool {
        self.read_world(result, None)
            .and_then(|ws| ws.get_system_var(VAR_MINIMIZE_BLOCK_GEN))
            .ok()
            .flatten()
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn has_transaction(&self, id: &Hash) -> bool {
        self.tm.has_tx(id)
    }

    /// Blocks until a transaction worth proposing on top of `parent` is pending, or the
    /// configured timeout elapses; then runs `cb`. See [TransactionManager::wait].
    pub fn wait_for_transaction<F: FnOnce()>(
        &self, parent: &Arc<Transition>, block: BlockInfo, cb: F,
    ) -> Result<bool> {
        let wc = self.world_context(parent, block)?;
        Ok(self.tm.wait(
            &wc,
            Duration::from_millis(self.config.wait_timeout_ms),
            cb,
        ))
    }

    pub fn receipt_list_from_result(
        &self, result: &Hash, group: TxGroup,
    ) -> Result<Arc<ReceiptList>> {
        self.cache.get_receipts(result, group)
    }

    pub fn transaction_list_from_hash(&self, hash: &Hash) -> Result<TransactionList> {
        TransactionList::load(&**self.database(), hash)
    }

    pub fn transaction_from_bytes(&self, bytes: &[u8]) -> Result<Transaction> {
        Transaction::from_bytes(bytes)
    }

    pub fn validator_list_from_hash(&self, hash: &Hash) -> Result<ValidatorList> {
        ValidatorList::load(&**self.database(), Some(hash))
    }
}
