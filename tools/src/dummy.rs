use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::info;
use parking_lot::Mutex;
use sha3::Digest;

use chainsvc::cache::TransitionResult;
use chainsvc::codec::TypedValue;
use chainsvc::common::{Addr, Amount, Bytes, Hash, Timestamp};
use chainsvc::db::Database;
use chainsvc::error::Result;
use chainsvc::manager::{PropagateError, TxPropagator};
use chainsvc::receipt::ReceiptList;
use chainsvc::state::world::{VAR_NETWORK, VAR_TOTAL_SUPPLY};
use chainsvc::state::{system_addr, ValidatorList, WorldSnapshot, WorldState};
use chainsvc::tx::{Transaction, TxParams, DATA_TYPE_CALL, TX_VERSION};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Deterministic key pair for `seed`.
pub fn key_pair(seed: &str) -> (libsecp256k1::SecretKey, Addr) {
    let mut digest = sha3::Sha3_256::digest(seed.as_bytes());
    loop {
        if let Ok(key) = libsecp256k1::SecretKey::parse_slice(&digest) {
            let pubkey = libsecp256k1::PublicKey::from_secret_key(&key);
            return (key, Addr::from_public_key(&pubkey.serialize()))
        }
        digest = sha3::Sha3_256::digest(&digest);
    }
}

/// Builds signed normal transactions.
#[derive(Clone)]
pub struct TxBuilder {
    params: TxParams,
}

impl TxBuilder {
    pub fn new(to: &Addr) -> Self {
        Self {
            params: TxParams {
                version: TX_VERSION,
                to: to.clone(),
                data_type: DATA_TYPE_CALL.into(),
                ..Default::default()
            },
        }
    }

    pub fn value(mut self, value: u64) -> Self {
        self.params.value = value.into();
        self
    }

    pub fn timestamp(mut self, ts: Timestamp) -> Self {
        self.params.timestamp = ts.max(0) as u64;
        self
    }

    pub fn nid(mut self, nid: u64) -> Self {
        self.params.nid = nid;
        self
    }

    pub fn nonce(mut self, nonce: u64) -> Self {
        self.params.nonce = nonce.into();
        self
    }

    pub fn data(mut self, data_type: &str, data: Vec<u8>) -> Self {
        self.params.data_type = data_type.into();
        self.params.data = Bytes::from(data);
        self
    }

    pub fn sign(&self, key: &libsecp256k1::SecretKey) -> Arc<Transaction> {
        Arc::new(Transaction::sign(self.params.clone(), key))
    }

    /// Signs a transaction whose wire encoding is exactly `size` bytes, padding the call data.
    pub fn sign_with_size(&self, key: &libsecp256k1::SecretKey, size: usize) -> Arc<Transaction> {
        for pad in 0..size {
            let mut b = self.clone();
            b.params.data = Bytes::from(vec![b'x'; pad]);
            let tx = b.sign(key);
            if tx.size() == size {
                return tx
            }
            if tx.size() > size {
                break
            }
        }
        panic!("no transaction of {} bytes", size)
    }
}

/// Writes a complete genesis result (world, empty receipts, result record) to a database.
#[derive(Default)]
pub struct GenesisBuilder {
    balances: Vec<(Addr, u64)>,
    vars: Vec<(&'static str, TypedValue)>,
    validators: Vec<Addr>,
}

impl GenesisBuilder {
    pub fn balance(mut self, addr: &Addr, amount: u64) -> Self {
        self.balances.push((addr.clone(), amount));
        self
    }

    pub fn system_var(mut self, name: &'static str, value: TypedValue) -> Self {
        self.vars.push((name, value));
        self
    }

    pub fn validators(mut self, validators: Vec<Addr>) -> Self {
        self.validators = validators;
        self
    }

    /// Returns the result hash and the validator list hash (if any validator was given).
    pub fn build(self, db: Arc<dyn Database>) -> Result<(Hash, Option<Hash>)> {
        let mut ws = WorldState::new(Arc::new(WorldSnapshot::empty(db.clone())));
        let mut supply = Amount::default();
        for (addr, amount) in &self.balances {
            ws.get_account(addr).set_balance((*amount).into());
            supply = supply.checked_add(&(*amount).into()).unwrap_or_default();
        }
        let system = ws.get_account(system_addr());
        system.set_var(VAR_TOTAL_SUPPLY, &TypedValue::Int(*supply.as_ref()));
        for (name, value) in &self.vars {
            system.set_var(name, value);
        }
        let vl = ValidatorList::new(self.validators);
        let vl_hash = vl.hash();
        ws.set_validators(vl);

        let world = ws.get_snapshot();
        world.flush()?;
        let receipts = ReceiptList::new(Vec::new());
        receipts.flush(&*db)?;
        let result = TransitionResult {
            state_hash: *world.hash(),
            patch_receipts_hash: *receipts.hash(),
            normal_receipts_hash: *receipts.hash(),
        };
        result.flush(&*db)?;
        info!("genesis result {} (world {})", result.hash(), world.hash());
        Ok((result.hash(), vl_hash))
    }
}

/// Convenience for the common case of a network id plus funded accounts.
pub fn genesis(db: Arc<dyn Database>, nid: u64, funded: &[(&Addr, u64)]) -> Result<Hash> {
    let mut g = GenesisBuilder::default().system_var(VAR_NETWORK, TypedValue::from(nid));
    for (addr, amount) in funded {
        g = g.balance(addr, *amount);
    }
    Ok(g.build(db)?.0)
}

/// Records every propagated transaction; can pretend the network is down.
#[derive(Default)]
pub struct RecordingPropagator {
    sent: Mutex<Vec<(u16, Vec<u8>)>>,
    offline: AtomicBool,
}

impl RecordingPropagator {
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<(u16, Vec<u8>)> {
        self.sent.lock().clone()
    }
}

impl TxPropagator for RecordingPropagator {
    fn propagate(&self, protocol: u16, tx: &[u8]) -> std::result::Result<(), PropagateError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(PropagateError::NotAvailable)
        }
        self.sent.lock().push((protocol, tx.to_vec()));
        Ok(())
    }
}
