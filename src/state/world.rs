use std::collections::BTreeMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::codec::TypedValue;
use crate::common::{Addr, Amount, Hash, Timestamp};
use crate::db::{BucketId, Database};
use crate::error::{Error, Result};
use crate::state::account::{AccountReadOnly, AccountSnapshot, AccountState};
use crate::state::merkle::MerkleBuilder;

/// Height and timestamp of the block a transition belongs to.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct BlockInfo {
    pub height: i64,
    pub timestamp: Timestamp,
}

impl BlockInfo {
    pub fn new(height: i64, timestamp: Timestamp) -> Self {
        Self { height, timestamp }
    }
}

impl rlp::Encodable for BlockInfo {
    fn rlp_append(&self, s: &mut rlp::RlpStream) {
        s.begin_list(2)
            .append(&(self.height.max(0) as u64))
            .append(&(self.timestamp.max(0) as u64));
    }
}

impl rlp::Decodable for BlockInfo {
    fn decode(rlp: &rlp::Rlp) -> std::result::Result<Self, rlp::DecoderError> {
        let signed = |v: u64| {
            i64::try_from(v).map_err(|_| rlp::DecoderError::Custom("value out of range"))
        };
        Ok(Self {
            height: signed(rlp.val_at(0)?)?,
            timestamp: signed(rlp.val_at(1)?)?,
        })
    }
}

/// Ordered validator set, stored in the blob bucket by the hash of its encoding.
#[derive(Clone, Default, Debug)]
pub struct ValidatorList {
    validators: Vec<Addr>,
    hash: OnceCell<Hash>,
}

impl ValidatorList {
    pub fn new(validators: Vec<Addr>) -> Self {
        Self {
            validators,
            hash: OnceCell::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Addr> {
        self.validators.get(idx)
    }

    pub fn index_of(&self, addr: &Addr) -> Option<usize> {
        self.validators.iter().position(|v| v == addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Addr> {
        self.validators.iter()
    }

    pub fn encode(&self) -> Vec<u8> {
        rlp::encode_list::<Addr, _>(&self.validators).to_vec()
    }

    /// `None` for the empty list, which is never persisted.
    pub fn hash(&self) -> Option<Hash> {
        if self.validators.is_empty() {
            return None
        }
        Some(*self.hash.get_or_init(|| Hash::hash(&self.encode())))
    }

    pub fn flush(&self, db: &dyn Database) -> Result<()> {
        let hash = match self.hash() {
            Some(h) => h,
            None => return Ok(()),
        };
        let write = || -> Result<()> {
            let bk = db.get_bucket(BucketId::BYTES_BY_HASH)?;
            if !bk.has(hash.as_bytes())? {
                bk.set(hash.as_bytes(), &self.encode())?;
            }
            Ok(())
        };
        write().map_err(|e| e.critical("FailToFlushValidators"))
    }

    pub fn load(db: &dyn Database, hash: Option<&Hash>) -> Result<Self> {
        let hash = match hash {
            Some(h) => h,
            None => return Ok(Self::default()),
        };
        let raw = db
            .get_bucket(BucketId::BYTES_BY_HASH)?
            .get(hash.as_bytes())?
            .ok_or_else(|| Error::NotFound(format!("validator list {}", hash)))?;
        let list = Self::new(rlp::Rlp::new(&raw).as_list()?);
        if list.hash().as_ref() != Some(hash) {
            return Err(Error::Codec(format!("corrupted validator list {}", hash)))
        }
        Ok(list)
    }
}

impl PartialEq for ValidatorList {
    fn eq(&self, other: &Self) -> bool {
        self.validators == other.validators
    }
}

impl Eq for ValidatorList {}

/// Immutable, content-addressed world state.
///
/// Cheap to share (`Arc<WorldSnapshot>`); account records are shared by reference between
/// snapshots that did not change them.
pub struct WorldSnapshot {
    accounts: BTreeMap<Addr, Arc<AccountSnapshot>>,
    validators: Arc<ValidatorList>,
    hash: Hash,
    size: usize,
    db: Arc<dyn Database>,
}

impl WorldSnapshot {
    fn build(
        accounts: BTreeMap<Addr, Arc<AccountSnapshot>>,
        validators: Arc<ValidatorList>, db: Arc<dyn Database>,
    ) -> Self {
        let raw = Self::encode_index(&accounts);
        let size = raw.len() + accounts.values().map(|a| a.size()).sum::<usize>();
        Self {
            hash: Hash::hash(&raw),
            accounts,
            validators,
            size,
            db,
        }
    }

    pub fn empty(db: Arc<dyn Database>) -> Self {
        Self::build(BTreeMap::new(), Arc::new(ValidatorList::default()), db)
    }

    /// Hash of the empty world; a transition result referencing it needs no stored record.
    pub fn empty_hash() -> &'static Hash {
        static V: OnceCell<Hash> = OnceCell::new();
        V.get_or_init(|| Hash::hash(&Self::encode_index(&BTreeMap::new())))
    }

    fn encode_index(accounts: &BTreeMap<Addr, Arc<AccountSnapshot>>) -> Vec<u8> {
        let mut s = rlp::RlpStream::new_list(accounts.len());
        for (addr, acc) in accounts {
            s.begin_list(2).append(addr).append(acc.hash());
        }
        s.out().to_vec()
    }

    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    /// Approximate memory footprint (sum of the encoded records).
    pub fn size_in_bytes(&self) -> usize {
        self.size
    }

    pub fn database(&self) -> &Arc<dyn Database> {
        &self.db
    }

    pub fn validators(&self) -> &Arc<ValidatorList> {
        &self.validators
    }

    pub fn get_account(&self, addr: &Addr) -> Option<&Arc<AccountSnapshot>> {
        self.accounts.get(addr)
    }

    pub fn accounts(&self) -> impl Iterator<Item = (&Addr, &Arc<AccountSnapshot>)> {
        self.accounts.iter()
    }

    pub fn with_validators(&self, validators: Arc<ValidatorList>) -> Self {
        Self {
            accounts: self.accounts.clone(),
            validators,
            hash: self.hash,
            size: self.size,
            db: self.db.clone(),
        }
    }

    /// Persists new contract code first, then the account records, the index and the
    /// validator list. Already stored records are skipped.
    pub fn flush(&self) -> Result<()> {
        let trie = self
            .db
            .get_bucket(BucketId::MERKLE_TRIE)
            .map_err(|e| e.critical("FailToGetBucket"))?;
        for acc in self.accounts.values() {
            acc.flush(&*self.db)?;
        }
        let write = || -> Result<()> {
            for acc in self.accounts.values() {
                if !trie.has(acc.hash().as_bytes())? {
                    trie.set(acc.hash().as_bytes(), &acc.encode())?;
                }
            }
            if !trie.has(self.hash.as_bytes())? {
                trie.set(self.hash.as_bytes(), &Self::encode_index(&self.accounts))?;
            }
            Ok(())
        };
        write().map_err(|e| e.critical("FailToFlushWorld"))?;
        self.validators.flush(&*self.db)
    }

    pub fn load(
        db: Arc<dyn Database>, hash: &Hash, vl_hash: Option<&Hash>,
    ) -> Result<Self> {
        let validators = Arc::new(ValidatorList::load(&*db, vl_hash)?);
        if hash == Self::empty_hash() {
            return Ok(Self::build(BTreeMap::new(), validators, db))
        }
        let trie = db.get_bucket(BucketId::MERKLE_TRIE)?;
        let raw = trie
            .get(hash.as_bytes())?
            .ok_or_else(|| Error::NotFound(format!("world state {}", hash)))?;
        let mut accounts = BTreeMap::new();
        for entry in rlp::Rlp::new(&raw).iter() {
            let addr: Addr = entry.val_at(0)?;
            let acc_hash: Hash = entry.val_at(1)?;
            let acc_raw = trie.get(acc_hash.as_bytes())?.ok_or_else(|| {
                Error::NotFound(format!("account {} of {}", acc_hash, addr))
            })?;
            let mut acc = AccountSnapshot::decode(&acc_raw)?;
            acc.reset_db(&*db)?;
            accounts.insert(addr, Arc::new(acc));
        }
        let ws = Self::build(accounts, validators, db);
        if &ws.hash != hash {
            return Err(Error::Codec(format!("corrupted world state {}", hash)))
        }
        Ok(ws)
    }

    /// Registers every contract code blob that is not stored locally yet.
    pub fn resolve(&self, builder: &MerkleBuilder) -> Result<()> {
        for acc in self.accounts.values() {
            acc.resolve(builder)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for WorldSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorldSnapshot")
            .field("hash", &self.hash)
            .field("accounts", &self.accounts.len())
            .field("validators", &self.validators.hash())
            .finish()
    }
}

/// Mutable world state of one executing transition. Reads fall through to the base snapshot;
/// an account is copied out of it on first write.
pub struct WorldState {
    base: Arc<WorldSnapshot>,
    accounts: BTreeMap<Addr, AccountState>,
    validators: Option<Arc<ValidatorList>>,
    journal: Option<Journal>,
}

/// Prior content of every account opened for writing since the last checkpoint. `None` means the
/// account had no working copy yet.
struct Journal {
    accounts: BTreeMap<Addr, Option<(AccountSnapshot, bool)>>,
    validators: Option<Arc<ValidatorList>>,
}

impl WorldState {
    pub fn new(base: Arc<WorldSnapshot>) -> Self {
        Self {
            base,
            accounts: BTreeMap::new(),
            validators: None,
            journal: None,
        }
    }

    pub fn database(&self) -> &Arc<dyn Database> {
        self.base.database()
    }

    pub fn get_account(&mut self, addr: &Addr) -> &mut AccountState {
        if let Some(journal) = &mut self.journal {
            if !journal.accounts.contains_key(addr) {
                let prior = self
                    .accounts
                    .get(addr)
                    .map(|acc| (acc.get_snapshot(), acc.is_dirty()));
                journal.accounts.insert(addr.clone(), prior);
            }
        }
        let base = &self.base;
        self.accounts.entry(addr.clone()).or_insert_with(|| {
            match base.get_account(addr) {
                Some(snapshot) => AccountState::new(snapshot),
                None => AccountState::new(&AccountSnapshot::empty()),
            }
        })
    }

    pub fn get_account_snapshot(&self, addr: &Addr) -> Option<Arc<AccountSnapshot>> {
        match self.accounts.get(addr) {
            Some(acc) => Some(Arc::new(acc.get_snapshot())),
            None => self.base.get_account(addr).cloned(),
        }
    }

    pub fn balance(&self, addr: &Addr) -> Amount {
        match self.accounts.get(addr) {
            Some(acc) => acc.balance().clone(),
            None => self
                .base
                .get_account(addr)
                .map(|a| a.balance().clone())
                .unwrap_or_default(),
        }
    }

    pub fn validators(&self) -> &Arc<ValidatorList> {
        self.validators.as_ref().unwrap_or(&self.base.validators)
    }

    pub fn set_validators(&mut self, validators: ValidatorList) {
        self.validators = Some(Arc::new(validators));
    }

    /// Freezes the current content into a new snapshot. Accounts left empty are dropped.
    pub fn get_snapshot(&self) -> WorldSnapshot {
        let mut accounts = self.base.accounts.clone();
        for (addr, acc) in &self.accounts {
            if !acc.is_dirty() {
                continue
            }
            let snapshot = acc.get_snapshot();
            if snapshot.is_empty() {
                accounts.remove(addr);
            } else {
                accounts.insert(addr.clone(), Arc::new(snapshot));
            }
        }
        WorldSnapshot::build(
            accounts,
            self.validators().clone(),
            self.base.db.clone(),
        )
    }

    /// Discards every change and continues from `snapshot`.
    pub fn reset(&mut self, snapshot: Arc<WorldSnapshot>) {
        self.base = snapshot;
        self.accounts.clear();
        self.validators = None;
        self.journal = None;
    }

    /// Starts recording the accounts written from now on, replacing any previous checkpoint.
    /// Costs nothing for accounts that are only read.
    pub fn checkpoint(&mut self) {
        self.journal = Some(Journal {
            accounts: BTreeMap::new(),
            validators: self.validators.clone(),
        });
    }

    /// Keeps the changes made since the last checkpoint.
    pub fn commit(&mut self) {
        self.journal = None;
    }

    /// Undoes the changes made since the last checkpoint.
    pub fn rollback(&mut self) {
        let journal = match self.journal.take() {
            Some(journal) => journal,
            None => return,
        };
        for (addr, prior) in journal.accounts {
            match prior {
                Some((snapshot, dirty)) => {
                    self.accounts.insert(addr, AccountState::restore(&snapshot, dirty));
                }
                None => {
                    self.accounts.remove(&addr);
                }
            }
        }
        self.validators = journal.validators;
    }
}

pub const VAR_TOTAL_SUPPLY: &str = "total_supply";
pub const VAR_NETWORK: &str = "network";
pub const VAR_ROUND_LIMIT_FACTOR: &str = "round_limit_factor";
pub const VAR_MINIMIZE_BLOCK_GEN: &str = "minimize_block_gen";
pub const VAR_MEMBERS: &str = "members";

/// Account holding the chain-wide variables; also the only sender allowed to issue patches.
pub fn system_addr() -> &'static Addr {
    static V: OnceCell<Addr> = OnceCell::new();
    V.get_or_init(|| Addr::new(true, [0; 20]))
}

/// Historical world state as seen by queries.
#[derive(Clone)]
pub struct ReadOnlyWorldState(Arc<WorldSnapshot>);

impl ReadOnlyWorldState {
    pub fn new(snapshot: Arc<WorldSnapshot>) -> Self {
        Self(snapshot)
    }

    pub fn hash(&self) -> &Hash {
        self.0.hash()
    }

    pub fn get_account(&self, addr: &Addr) -> Option<AccountReadOnly> {
        self.0.get_account(addr).cloned().map(AccountReadOnly::new)
    }

    pub fn validators(&self) -> &Arc<ValidatorList> {
        self.0.validators()
    }

    pub fn get_system_var(&self, name: &str) -> Result<Option<TypedValue>> {
        match self.0.get_account(system_addr()) {
            Some(acc) => acc.get_var(name),
            None => Ok(None),
        }
    }
}

/// Everything transaction validation needs to know about the block being built.
#[derive(Clone)]
pub struct WorldContext {
    world: Arc<WorldSnapshot>,
    block: BlockInfo,
    tx_threshold: i64,
}

impl WorldContext {
    pub fn new(world: Arc<WorldSnapshot>, block: BlockInfo, tx_threshold: i64) -> Self {
        Self {
            world,
            block,
            tx_threshold,
        }
    }

    pub fn world(&self) -> &Arc<WorldSnapshot> {
        &self.world
    }

    pub fn block(&self) -> &BlockInfo {
        &self.block
    }

    pub fn tx_threshold(&self) -> i64 {
        self.tx_threshold
    }

    /// Whether the transaction is already part of a finalized transaction list.
    pub fn is_finalized_tx(&self, id: &Hash) -> Result<bool> {
        self.world
            .database()
            .get_bucket(BucketId::TRANSACTION_LOCATOR_BY_HASH)?
            .has(id.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Bytes;
    use crate::db::MapDatabase;
    use crate::state::contract::{ContractSnapshot, ContractState, EeType, CT_APP_JAVA};

    fn addr(n: u8) -> Addr {
        Addr::new(false, [n; 20])
    }

    #[test]
    fn test_copy_on_write() {
        let db = MapDatabase::new_shared();
        let s0 = Arc::new(WorldSnapshot::empty(db));
        let mut ws = WorldState::new(s0.clone());
        ws.get_account(&addr(1)).set_balance(100u64.into());
        let s1 = Arc::new(ws.get_snapshot());
        assert_ne!(s1.hash(), s0.hash());
        assert!(s0.get_account(&addr(1)).is_none());

        let mut ws = WorldState::new(s1.clone());
        ws.get_account(&addr(2)).set_balance(5u64.into());
        // reading does not copy
        assert_eq!(ws.balance(&addr(1)), Amount::from(100u64));
        let s2 = ws.get_snapshot();
        assert!(Arc::ptr_eq(
            s1.get_account(&addr(1)).unwrap(),
            s2.get_account(&addr(1)).unwrap()
        ));
        assert!(s1.get_account(&addr(2)).is_none());
    }

    #[test]
    fn test_hash_is_deterministic() {
        let db = MapDatabase::new_shared();
        let build = |order: &[u8]| {
            let mut ws = WorldState::new(Arc::new(WorldSnapshot::empty(db.clone())));
            for n in order {
                ws.get_account(&addr(*n)).set_balance((*n as u64).into());
            }
            ws.get_snapshot()
        };
        assert_eq!(build(&[1, 2, 3]).hash(), build(&[3, 1, 2]).hash());
        assert_eq!(WorldSnapshot::empty(db).hash(), WorldSnapshot::empty_hash());
    }

    #[test]
    fn test_emptied_account_is_dropped() {
        let db = MapDatabase::new_shared();
        let mut ws = WorldState::new(Arc::new(WorldSnapshot::empty(db)));
        ws.get_account(&addr(1)).set_balance(1u64.into());
        let s1 = Arc::new(ws.get_snapshot());
        let mut ws = WorldState::new(s1);
        ws.get_account(&addr(1)).set_balance(Amount::default());
        assert_eq!(ws.get_snapshot().hash(), WorldSnapshot::empty_hash());
    }

    #[test]
    fn test_flush_and_load() {
        let db = MapDatabase::new_shared();
        let mut ws = WorldState::new(Arc::new(WorldSnapshot::empty(db.clone())));
        let c = Addr::new(true, [9; 20]);
        let acc = ws.get_account(&c);
        acc.set_balance(7u64.into());
        acc.deploy_contract(ContractSnapshot::new(
            ContractState::Active,
            EeType::Java,
            CT_APP_JAVA,
            b"jar".to_vec(),
            None,
            Bytes::empty(),
        ));
        ws.get_account(system_addr())
            .set_var(VAR_TOTAL_SUPPLY, &TypedValue::from(7u64));
        ws.set_validators(ValidatorList::new(vec![addr(1), addr(2)]));
        let snap = ws.get_snapshot();
        let vl_hash = snap.validators().hash();
        snap.flush().unwrap();

        let loaded = WorldSnapshot::load(db.clone(), snap.hash(), vl_hash.as_ref()).unwrap();
        assert_eq!(loaded.hash(), snap.hash());
        assert_eq!(loaded.validators().len(), 2);
        let contract = loaded.get_account(&c).unwrap().contract().unwrap().clone();
        assert_eq!(contract.code().unwrap(), Some(&b"jar"[..]));

        let ro = ReadOnlyWorldState::new(Arc::new(loaded));
        assert_eq!(
            ro.get_system_var(VAR_TOTAL_SUPPLY).unwrap(),
            Some(TypedValue::from(7u64))
        );
        assert_eq!(ro.get_account(&c).unwrap().balance(), &Amount::from(7u64));

        let unknown = Hash::hash(b"unknown");
        assert!(WorldSnapshot::load(db, &unknown, None).unwrap_err().is_not_found());
    }

    #[test]
    fn test_reset_discards_changes() {
        let db = MapDatabase::new_shared();
        let s0 = Arc::new(WorldSnapshot::empty(db));
        let mut ws = WorldState::new(s0.clone());
        ws.get_account(&addr(1)).set_balance(3u64.into());
        ws.reset(s0.clone());
        assert_eq!(ws.get_snapshot().hash(), s0.hash());
    }

    #[test]
    fn test_rollback_restores_touched_accounts() {
        let db = MapDatabase::new_shared();
        let mut ws = WorldState::new(Arc::new(WorldSnapshot::empty(db)));
        ws.get_account(&addr(1)).set_balance(3u64.into());
        let before = *ws.get_snapshot().hash();
        ws.checkpoint();
        ws.get_account(&addr(1)).set_balance(4u64.into());
        ws.get_account(&addr(2)).set_balance(5u64.into());
        ws.set_validators(ValidatorList::new(vec![addr(1)]));
        ws.rollback();
        assert_eq!(ws.balance(&addr(1)), Amount::from(3u64));
        assert!(ws.balance(&addr(2)).is_zero());
        assert!(ws.validators().is_empty());
        assert_eq!(ws.get_snapshot().hash(), &before);

        // committed changes survive a later rollback
        ws.checkpoint();
        ws.get_account(&addr(2)).set_balance(6u64.into());
        ws.commit();
        ws.rollback();
        assert_eq!(ws.balance(&addr(2)), Amount::from(6u64));
    }
}
