//! Runs ordered transaction lists through a [TxExecutor](crate::executor::TxExecutor).

use crate::error::{Error, Result};
use crate::executor::TxExecutor;
use crate::receipt::{Receipt, ReceiptList};
use crate::state::{BlockInfo, WorldState};
use crate::trace::TraceLogger;
use crate::tx::{PatchData, TransactionList};

/// Whether a patch list asks to skip the normal transactions of the block at `height`.
pub fn skips_height(patches: &TransactionList, height: i64) -> bool {
    patches.iter().any(|tx| match tx.patch_data() {
        Ok(Some(PatchData::SkipTransaction { height: h })) => h.checked_add(1) == Some(height),
        _ => false,
    })
}

/// Executes `txs` one after another on `ws`, producing one receipt per transaction.
///
/// A failing transaction leaves no trace in the world: its changes are rolled back and a failure
/// receipt takes its place. Critical I/O failures are not absorbed; they abort the whole run.
/// With `skip` set nothing is executed and every transaction gets a skipped receipt.
pub async fn run_tx_list(
    executor: &dyn TxExecutor, ws: &mut WorldState, txs: &TransactionList, block: &BlockInfo,
    skip: bool, logger: &TraceLogger,
) -> Result<ReceiptList> {
    let mut receipts = Vec::with_capacity(txs.len());
    for (i, tx) in txs.iter().enumerate() {
        if skip {
            receipts.push(Receipt::skipped(*tx.id()));
            continue
        }
        let tlog = logger.with_prefix(format!("tx[{}] ", i));
        ws.checkpoint();
        let receipt = match tx.verify() {
            Ok(()) => executor.execute(ws, tx, block, &tlog).await,
            Err(e) => Err(e),
        };
        match receipt {
            Ok(r) => {
                ws.commit();
                receipts.push(r)
            }
            Err(e @ Error::CriticalIo(_)) => return Err(e),
            Err(e) => {
                tlog.tdebug(format_args!("failed {}: {}", tx.id(), e));
                ws.rollback();
                receipts.push(Receipt::failure(*tx.id(), e.to_string()));
            }
        }
    }
    Ok(ReceiptList::new(receipts))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::common::{Addr, Amount};
    use crate::db::MapDatabase;
    use crate::executor::BasicExecutor;
    use crate::receipt::ReceiptStatus;
    use crate::state::{system_addr, WorldSnapshot};
    use crate::tx::{Transaction, TxParams, DATA_TYPE_CALL, TX_VERSION};

    fn transfer(n: u8, to: Addr, value: u64) -> Arc<Transaction> {
        let key = libsecp256k1::SecretKey::parse(&[n; 32]).unwrap();
        Arc::new(Transaction::sign(
            TxParams {
                version: TX_VERSION,
                to,
                value: value.into(),
                data_type: DATA_TYPE_CALL.into(),
                ..Default::default()
            },
            &key,
        ))
    }

    #[test]
    fn test_failed_transaction_is_rolled_back() {
        let to = Addr::new(false, [9; 20]);
        let ok = transfer(1, to.clone(), 10);
        let broke = transfer(2, to.clone(), 10);
        let mut ws = WorldState::new(Arc::new(WorldSnapshot::empty(MapDatabase::new_shared())));
        ws.get_account(ok.from()).set_balance(10u64.into());
        let txs = TransactionList::new(vec![ok.clone(), broke.clone()]);
        let receipts = futures::executor::block_on(run_tx_list(
            &BasicExecutor,
            &mut ws,
            &txs,
            &BlockInfo::new(1, 0),
            false,
            &TraceLogger::default(),
        ))
        .unwrap();
        assert_eq!(receipts.get(0).unwrap().status, ReceiptStatus::Success);
        assert_eq!(receipts.get(1).unwrap().status, ReceiptStatus::Failure);
        assert_eq!(ws.balance(&to), Amount::from(10u64));
        assert!(ws.balance(ok.from()).is_zero());
    }

    struct WriteThenFail;

    #[async_trait::async_trait]
    impl TxExecutor for WriteThenFail {
        async fn execute(
            &self, ws: &mut WorldState, tx: &Transaction, _block: &BlockInfo,
            _logger: &TraceLogger,
        ) -> Result<crate::receipt::Receipt> {
            ws.get_account(tx.from()).set_balance(1u64.into());
            ws.get_account(tx.to()).set_balance(99u64.into());
            Err(Error::Execution("out of step".into()))
        }

        fn query(
            &self, _ws: &crate::state::ReadOnlyWorldState, _to: &Addr, _method: &str,
            _params: &serde_json::Value,
        ) -> Result<serde_json::Value> {
            Ok(serde_json::Value::Null)
        }
    }

    #[test]
    fn test_partial_writes_are_undone() {
        let to = Addr::new(false, [9; 20]);
        let tx = transfer(1, to.clone(), 10);
        let mut ws = WorldState::new(Arc::new(WorldSnapshot::empty(MapDatabase::new_shared())));
        ws.get_account(tx.from()).set_balance(10u64.into());
        let before = *ws.get_snapshot().hash();
        let receipts = futures::executor::block_on(run_tx_list(
            &WriteThenFail,
            &mut ws,
            &TransactionList::new(vec![tx.clone()]),
            &BlockInfo::new(1, 0),
            false,
            &TraceLogger::default(),
        ))
        .unwrap();
        assert_eq!(receipts.get(0).unwrap().status, ReceiptStatus::Failure);
        assert_eq!(ws.balance(tx.from()), Amount::from(10u64));
        assert!(ws.balance(&to).is_zero());
        assert_eq!(ws.get_snapshot().hash(), &before);
    }

    #[test]
    fn test_skip() {
        let patch = Arc::new(
            Transaction::new_patch(&PatchData::SkipTransaction { height: 4 }, 0, 0).unwrap(),
        );
        let patches = TransactionList::new(vec![patch]);
        assert!(skips_height(&patches, 5));
        assert!(!skips_height(&patches, 4));
        assert!(!skips_height(&TransactionList::empty(), 5));

        let last = Arc::new(
            Transaction::new_patch(&PatchData::SkipTransaction { height: i64::MAX }, 0, 0)
                .unwrap(),
        );
        assert!(!skips_height(&TransactionList::new(vec![last]), i64::MAX));

        let mut ws = WorldState::new(Arc::new(WorldSnapshot::empty(MapDatabase::new_shared())));
        let txs = TransactionList::new(vec![transfer(1, system_addr().clone(), 1)]);
        let receipts = futures::executor::block_on(run_tx_list(
            &BasicExecutor,
            &mut ws,
            &txs,
            &BlockInfo::new(5, 0),
            true,
            &TraceLogger::default(),
        ))
        .unwrap();
        assert_eq!(receipts.get(0).unwrap().status, ReceiptStatus::Skipped);
    }
}
