use std::sync::Arc;

use chainsvc::codec::TypedValue;
use chainsvc::common::{now_micros, Addr, Amount, Hash};
use chainsvc::config::ServiceConfig;
use chainsvc::db::{BucketId, Database, MapDatabase};
use chainsvc::error::Error;
use chainsvc::executor::BasicExecutor;
use chainsvc::manager::{
    FinalizeOptions, Manager, TxInput, TxPropagator, PROTO_PROPAGATE_TRANSACTION,
};
use chainsvc::receipt::ReceiptStatus;
use chainsvc::state::world::VAR_ROUND_LIMIT_FACTOR;
use chainsvc::state::{BlockInfo, WorldContext};
use chainsvc::transition::{Step, Transition};
use chainsvc::tx::{PatchData, Transaction, TransactionList, TxGroup};
use chainsvc_tools::dummy::{
    genesis, init_logger, key_pair, GenesisBuilder, RecordingPropagator, TxBuilder,
};

const NID: u64 = 1;

fn config() -> ServiceConfig {
    ServiceConfig {
        nid: NID,
        ..Default::default()
    }
}

fn manager(db: Arc<dyn Database>) -> Manager {
    Manager::new(config(), db, Arc::new(BasicExecutor), None)
}

fn block(parent: &Transition) -> BlockInfo {
    BlockInfo::new(parent.block().height + 1, now_micros())
}

async fn next(m: &Manager, parent: &Arc<Transition>) -> Arc<Transition> {
    let t = m.propose_transition(parent, block(parent)).unwrap();
    t.execute(m.executor().as_ref()).await.unwrap();
    t
}

#[tokio::test]
async fn test_propose_empty_and_pack_by_size() {
    init_logger();
    let db = MapDatabase::new_shared();
    let (key, alice) = key_pair("alice");
    let bob = key_pair("bob").1;
    let result = genesis(db.clone(), NID, &[(&alice, 1000), (&bob, 10)]).unwrap();
    let m = manager(db);
    let g = m.create_initial_transition(Some(&result), None).unwrap();

    // nothing pending: an empty transition that leaves balances alone
    let t = next(&m, &g).await;
    assert!(t.normal_transactions().is_empty());
    assert!(t.patch_transactions().is_empty());
    let r = *t.result_hash().unwrap();
    assert_eq!(m.get_balance(&r, &alice).unwrap(), Amount::from(1000u64));
    assert_eq!(m.get_balance(&r, &bob).unwrap(), Amount::from(10u64));
    assert_eq!(t.world_snapshot().unwrap().hash(), g.world_snapshot().unwrap().hash());

    let tx = TxBuilder::new(&bob)
        .value(1)
        .timestamp(now_micros())
        .nid(NID)
        .sign_with_size(&key, 150);
    assert_eq!(tx.size(), 150);
    m.send_transaction(TxInput::Typed(tx.clone())).unwrap();

    let wc = WorldContext::new(
        t.world_snapshot().unwrap().clone(),
        block(&t),
        m.config().tx_timestamp_threshold_us,
    );
    let pool = m.tx_manager().pool(TxGroup::Normal);
    let (txs, bytes) = pool.candidate(&wc, 150, 10).unwrap();
    assert_eq!(txs.len(), 1);
    assert_eq!(txs[0].id(), tx.id());
    assert_eq!(bytes, 150);
    let (txs, bytes) = pool.candidate(&wc, 100, 10).unwrap();
    assert!(txs.is_empty());
    assert_eq!(bytes, 0);
}

#[tokio::test]
async fn test_execute_finalize_and_query() {
    init_logger();
    let db = MapDatabase::new_shared();
    let (key, alice) = key_pair("alice");
    let bob = key_pair("bob").1;
    let result = genesis(db.clone(), NID, &[(&alice, 1000)]).unwrap();
    let m = manager(db.clone());
    let g = m.create_initial_transition(Some(&result), None).unwrap();
    assert_eq!(m.get_total_supply(&result).unwrap(), Amount::from(1000u64));
    assert_eq!(m.get_network_id(&result).unwrap(), NID);

    let ok = TxBuilder::new(&bob).value(400).timestamp(now_micros()).nid(NID).sign(&key);
    let too_much = TxBuilder::new(&bob)
        .value(4000)
        .timestamp(now_micros())
        .nid(NID)
        .nonce(1)
        .sign(&key);
    m.send_transaction(TxInput::Typed(ok.clone())).unwrap();
    m.send_transaction(TxInput::Typed(too_much.clone())).unwrap();
    assert!(m.has_transaction(ok.id()));

    let t = next(&m, &g).await;
    assert_eq!(t.step(), Step::Complete);
    assert_eq!(t.normal_transactions().len(), 2);
    let r = *t.result_hash().unwrap();
    let receipts = m.receipt_list_from_result(&r, TxGroup::Normal).unwrap();
    assert_eq!(receipts.get(0).unwrap().status, ReceiptStatus::Success);
    assert_eq!(receipts.get(1).unwrap().status, ReceiptStatus::Failure);
    assert_eq!(m.get_balance(&r, &alice).unwrap(), Amount::from(600u64));
    assert_eq!(m.get_balance(&r, &bob).unwrap(), Amount::from(400u64));

    m.finalize(&t, FinalizeOptions::all()).unwrap();
    assert!(!m.has_transaction(ok.id()));
    let stored = m.transaction_list_from_hash(t.normal_transactions().hash()).unwrap();
    assert_eq!(stored.hash(), t.normal_transactions().hash());

    // a node restarting from the finalized result sees the same state
    let restarted = manager(db);
    let again = restarted.create_initial_transition(Some(&r), None).unwrap();
    assert_eq!(again.result_hash(), Some(&r));
    assert_eq!(restarted.get_balance(&r, &bob).unwrap(), Amount::from(400u64));

    // finalized transactions are not proposed again
    restarted
        .send_transaction(TxInput::Typed(ok.clone()))
        .unwrap();
    let t2 = next(&restarted, &again).await;
    assert!(t2.normal_transactions().is_empty());
}

#[tokio::test]
async fn test_finalize_is_idempotent() {
    let db = MapDatabase::new_shared();
    let (key, alice) = key_pair("alice");
    let result = genesis(db.clone(), NID, &[(&alice, 10)]).unwrap();
    let m = manager(db);
    let g = m.create_initial_transition(Some(&result), None).unwrap();
    for i in 0..3 {
        let tx = TxBuilder::new(&alice)
            .timestamp(now_micros())
            .nid(NID)
            .nonce(i)
            .sign(&key);
        m.send_transaction(TxInput::Typed(tx)).unwrap();
    }
    let t = next(&m, &g).await;
    let pool = m.tx_manager().pool(TxGroup::Normal);

    m.finalize(&t, FinalizeOptions::NORMAL_TRANSACTIONS).unwrap();
    let once = pool.metric().snapshot();
    assert_eq!((once.removed, once.finalized), (3, 3));
    m.finalize(&t, FinalizeOptions::NORMAL_TRANSACTIONS).unwrap();
    m.finalize(&t, FinalizeOptions::all()).unwrap();
    m.finalize(&t, FinalizeOptions::all()).unwrap();
    assert_eq!(pool.metric().snapshot(), once);
    assert!(pool.is_empty());
}

#[tokio::test]
async fn test_parent_guard() {
    let m = manager(MapDatabase::new_shared());
    let g = m.create_initial_transition(None, None).unwrap();
    let t = m.propose_transition(&g, block(&g)).unwrap();
    assert_eq!(t.step(), Step::Created);
    assert!(matches!(
        m.propose_transition(&t, block(&t)),
        Err(Error::IllegalArgument(_))
    ));
    assert!(matches!(
        m.create_transition(&t, TransactionList::empty(), block(&t)),
        Err(Error::IllegalArgument(_))
    ));
    assert!(matches!(
        m.wait_for_transaction(&t, block(&t), || ()),
        Err(Error::IllegalArgument(_))
    ));
    t.execute(m.executor().as_ref()).await.unwrap();
    m.propose_transition(&t, block(&t)).unwrap();
}

#[tokio::test]
async fn test_skip_transaction_patch() {
    let db = MapDatabase::new_shared();
    let (key, alice) = key_pair("alice");
    let bob = key_pair("bob").1;
    let result = genesis(db.clone(), NID, &[(&alice, 100)]).unwrap();
    let m = manager(db);
    let g = m.create_initial_transition(Some(&result), None).unwrap();
    let t1 = next(&m, &g).await;
    m.finalize(&t1, FinalizeOptions::all()).unwrap();
    let t2 = next(&m, &t1).await;
    m.finalize(&t2, FinalizeOptions::all()).unwrap();

    let tx = TxBuilder::new(&bob).value(50).timestamp(now_micros()).nid(NID).sign(&key);
    m.send_transaction(TxInput::Typed(tx.clone())).unwrap();
    let t3 = m.propose_transition(&t2, block(&t2)).unwrap();
    assert_eq!(t3.normal_transactions().len(), 1);

    // a skip patch for t2's height covers the transactions of the next block
    assert!(matches!(
        m.send_patch(PatchData::SkipTransaction { height: 0 }),
        Err(Error::InvalidPatchData(_))
    ));
    m.send_patch(PatchData::SkipTransaction {
        height: t2.block().height,
    })
    .unwrap();
    let patches = m.get_patches(&t2, *t3.block()).unwrap();
    assert_eq!(patches.len(), 1);
    let patched = m.patch_transition(&t3, patches).unwrap();
    assert_eq!(patched.normal_transactions().hash(), t3.normal_transactions().hash());
    patched.execute(m.executor().as_ref()).await.unwrap();
    let out = patched.output().unwrap();
    assert_eq!(out.normal_receipts.get(0).unwrap().status, ReceiptStatus::Skipped);
    assert_eq!(out.patch_receipts.len(), 1);
    let r = *patched.result_hash().unwrap();
    assert_eq!(m.get_balance(&r, &bob).unwrap(), Amount::default());

    // the pending patch is dropped once applied
    m.finalize(&patched, FinalizeOptions::all()).unwrap();
    assert!(m.get_patches(&t2, *t3.block()).unwrap().is_empty());
}

#[tokio::test]
async fn test_submitted_patch_is_rejected() {
    let db = MapDatabase::new_shared();
    let (key, alice) = key_pair("alice");
    let bob = key_pair("bob").1;
    let result = genesis(db.clone(), NID, &[(&alice, 100)]).unwrap();
    let m = manager(db);
    let g = m.create_initial_transition(Some(&result), None).unwrap();

    let tx = TxBuilder::new(&bob).value(30).timestamp(now_micros()).nid(NID).sign(&key);
    m.send_transaction(TxInput::Typed(tx.clone())).unwrap();
    let forged =
        Transaction::new_patch(&PatchData::SkipTransaction { height: 0 }, now_micros(), NID)
            .unwrap();
    for input in [
        TxInput::Bytes(forged.bytes().to_vec()),
        TxInput::Json(forged.to_json().to_string()),
    ] {
        assert!(matches!(
            m.send_transaction(input),
            Err(Error::InvalidTransaction(_))
        ));
    }
    assert!(!m.has_transaction(forged.id()));

    let t = next(&m, &g).await;
    assert!(t.patch_transactions().is_empty());
    let out = t.output().unwrap();
    assert_eq!(out.normal_receipts.get(0).unwrap().status, ReceiptStatus::Success);
    assert_eq!(m.get_balance(t.result_hash().unwrap(), &bob).unwrap(), Amount::from(30u64));
}

#[tokio::test]
async fn test_proposal_stays_within_byte_budget() {
    let db = MapDatabase::new_shared();
    let (key, alice) = key_pair("alice");
    let result = genesis(db.clone(), NID, &[(&alice, 100)]).unwrap();
    let config = ServiceConfig {
        max_tx_bytes_in_block: 400,
        ..config()
    };
    let m = Manager::new(config, db, Arc::new(BasicExecutor), None);
    let g = m.create_initial_transition(Some(&result), None).unwrap();
    let t1 = next(&m, &g).await;
    let t2 = next(&m, &t1).await;

    for i in 0..3 {
        let tx = TxBuilder::new(&alice)
            .timestamp(now_micros())
            .nid(NID)
            .nonce(i)
            .sign_with_size(&key, 150);
        m.send_transaction(TxInput::Typed(tx)).unwrap();
    }
    let patch =
        Transaction::new_patch(&PatchData::SkipTransaction { height: 5 }, now_micros(), NID)
            .unwrap();
    m.tx_manager().add_patch(Arc::new(patch)).unwrap();
    m.send_patch(PatchData::SkipTransaction {
        height: t2.block().height,
    })
    .unwrap();

    let t3 = m.propose_transition(&t2, block(&t2)).unwrap();
    assert!(t3.patch_transactions().is_empty());
    assert_eq!(t3.normal_transactions().len(), 2);
    let total =
        t3.patch_transactions().size_in_bytes() + t3.normal_transactions().size_in_bytes();
    assert!(total <= 400);

    // patches come only through an explicit patch step
    let patches = m.get_patches(&t2, *t3.block()).unwrap();
    assert_eq!(patches.len(), 2);
}

#[test]
fn test_round_limit() {
    let db = MapDatabase::new_shared();
    let (result, _) = GenesisBuilder::default()
        .system_var(VAR_ROUND_LIMIT_FACTOR, TypedValue::from(3u64))
        .build(db.clone())
        .unwrap();
    let m = manager(db);
    assert_eq!(m.get_round_limit(&result, 4), 4);
    assert_eq!(m.get_round_limit(&result, 0), 0);
    assert_eq!(m.get_round_limit(&result, usize::MAX), i64::MAX / 3);
}

#[tokio::test]
async fn test_queries_on_unknown_result() {
    let m = manager(MapDatabase::new_shared());
    let unknown = Hash::hash(b"unknown");
    let eoa = key_pair("alice").1;
    let score = Addr::new(true, [3; 20]);
    assert!(m.get_balance(&unknown, &eoa).unwrap_err().is_not_found());
    assert!(m.get_total_supply(&unknown).unwrap_err().is_not_found());
    assert!(m.get_network_id(&unknown).unwrap_err().is_not_found());
    assert!(m.get_api_info(&unknown, &score).unwrap_err().is_not_found());
    assert!(m.get_members(&unknown).unwrap_err().is_not_found());
    assert!(m
        .receipt_list_from_result(&unknown, TxGroup::Normal)
        .unwrap_err()
        .is_not_found());
    let call = serde_json::json!({
        "to": eoa.to_string(),
        "dataType": "call",
        "data": {"method": "balance"},
    });
    assert!(m.call(&unknown, None, &call).unwrap_err().is_not_found());
    assert_eq!(m.get_round_limit(&unknown, 4), 0);
    assert!(!m.get_minimize_block_gen(&unknown));
    assert!(m.transaction_list_from_hash(&unknown).unwrap_err().is_not_found());
    assert!(m.validator_list_from_hash(&unknown).unwrap_err().is_not_found());

    // non contract addresses are rejected before the lookup
    assert!(matches!(
        m.get_api_info(&unknown, &eoa),
        Err(Error::NotContractAddress(_))
    ));
}

#[test]
fn test_send_transaction_forms_and_propagation() {
    let propagator = Arc::new(RecordingPropagator::default());
    let m = Manager::new(
        config(),
        MapDatabase::new_shared(),
        Arc::new(BasicExecutor),
        Some(propagator.clone() as Arc<dyn TxPropagator>),
    );
    let (key, alice) = key_pair("alice");
    let build = |nonce: u64| {
        TxBuilder::new(&alice)
            .timestamp(now_micros())
            .nid(NID)
            .nonce(nonce)
            .sign(&key)
    };

    let a = build(0);
    assert_eq!(m.send_transaction(TxInput::Bytes(a.bytes().to_vec())).unwrap(), *a.id());
    let b = build(1);
    let id = m
        .send_transaction(TxInput::Json(b.to_json().to_string()))
        .unwrap();
    assert_eq!(id, *b.id());
    assert_eq!(
        propagator.sent(),
        vec![
            (PROTO_PROPAGATE_TRANSACTION, a.bytes().to_vec()),
            (PROTO_PROPAGATE_TRANSACTION, b.bytes().to_vec())
        ]
    );

    // an unreachable network does not fail the submission
    propagator.set_offline(true);
    m.send_transaction(TxInput::Typed(build(2))).unwrap();
    assert_eq!(propagator.sent().len(), 2);

    assert!(matches!(
        m.send_transaction(TxInput::Typed(a.clone())),
        Err(Error::DuplicateTransaction(_))
    ));
    assert!(matches!(
        m.send_transaction(TxInput::Bytes(vec![0xc0])),
        Err(Error::InvalidTransaction(_))
    ));
    assert!(matches!(
        m.send_transaction(TxInput::Json("{".into())),
        Err(Error::InvalidTransaction(_))
    ));
    let other_net = TxBuilder::new(&alice)
        .timestamp(now_micros())
        .nid(NID + 1)
        .sign(&key);
    assert!(matches!(
        m.send_transaction(TxInput::Typed(other_net)),
        Err(Error::InvalidTransaction(_))
    ));
    let decoded = m.transaction_from_bytes(a.bytes()).unwrap();
    assert_eq!(decoded.id(), a.id());
}

#[test]
fn test_buckets() {
    let db = MapDatabase::new_shared();
    let bk = db.get_bucket(BucketId("hello")).unwrap();
    bk.set(b"hello", b"world").unwrap();
    assert!(bk.has(b"hello").unwrap());
    assert_eq!(bk.get(b"hello").unwrap(), Some(b"world".to_vec()));
    bk.delete(b"hello").unwrap();
    assert!(!bk.has(b"hello").unwrap());
    assert_eq!(bk.get(b"hello").unwrap(), None);
}
