use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rlp_derive::{RlpDecodable, RlpEncodable};
use serde::{Deserialize, Serialize};

use crate::codec::TypedValue;
use crate::common::{Amount, Bytes, Hash};
use crate::db::Database;
use crate::error::Result;
use crate::state::contract::{
    Contract, ContractReadOnly, ContractSnapshot, DirtyHook,
};
use crate::state::merkle::MerkleBuilder;

/// One externally callable method of a contract.
#[derive(RlpDecodable, RlpEncodable, Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct ApiMethod {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub inputs: Vec<String>,
    pub readonly: bool,
}

#[derive(RlpDecodable, RlpEncodable, Serialize, Deserialize, Clone, PartialEq, Eq, Default, Debug)]
#[serde(transparent)]
pub struct ApiInfo {
    pub methods: Vec<ApiMethod>,
}

impl ApiInfo {
    pub fn method(&self, name: &str) -> Option<&ApiMethod> {
        self.methods.iter().find(|m| m.name == name)
    }
}

/// Immutable account record. Its hash is fixed at construction and is the key under which the
/// record lives in the merkle bucket.
#[derive(Clone)]
pub struct AccountSnapshot {
    balance: Amount,
    store: BTreeMap<Bytes, Bytes>,
    contract: Option<ContractSnapshot>,
    api_info: Option<ApiInfo>,
    hash: Hash,
    size: usize,
}

impl AccountSnapshot {
    fn build(
        balance: Amount, store: BTreeMap<Bytes, Bytes>,
        contract: Option<ContractSnapshot>, api_info: Option<ApiInfo>,
    ) -> Self {
        let mut s = Self {
            balance,
            store,
            contract,
            api_info,
            hash: Hash::default(),
            size: 0,
        };
        let raw = s.encode();
        s.hash = Hash::hash(&raw);
        s.size = raw.len();
        s
    }

    pub fn empty() -> Self {
        Self::build(Amount::default(), BTreeMap::new(), None, None)
    }

    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    /// Length of the encoded record.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn balance(&self) -> &Amount {
        &self.balance
    }

    pub fn get_value(&self, key: &[u8]) -> Option<&[u8]> {
        self.store.get(key).map(|v| &v[..])
    }

    pub fn contract(&self) -> Option<&ContractSnapshot> {
        self.contract.as_ref()
    }

    pub fn api_info(&self) -> Option<&ApiInfo> {
        self.api_info.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.balance.is_zero() &&
            self.store.is_empty() &&
            self.contract.is_none() &&
            self.api_info.is_none()
    }

    /// Reads a typed variable kept in the key/value store.
    pub fn get_var(&self, name: &str) -> Result<Option<TypedValue>> {
        self.store
            .get(name.as_bytes())
            .map(|v| TypedValue::from_bytes(v))
            .transpose()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut s = rlp::RlpStream::new_list(4);
        s.append(&self.balance);
        s.begin_list(self.store.len());
        for (k, v) in &self.store {
            s.begin_list(2).append(k).append(v);
        }
        match &self.contract {
            Some(c) => s.begin_list(1).append(c),
            None => s.begin_list(0),
        };
        match &self.api_info {
            Some(a) => s.begin_list(1).append(a),
            None => s.begin_list(0),
        };
        s.out().to_vec()
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        let r = rlp::Rlp::new(raw);
        if r.item_count()? != 4 {
            return Err(rlp::DecoderError::RlpIncorrectListLen.into())
        }
        let mut store = BTreeMap::new();
        for kv in r.at(1)?.iter() {
            store.insert(kv.val_at(0)?, kv.val_at(1)?);
        }
        let contract = match optional_item(&r, 2)? {
            Some(c) => Some(c.as_val::<ContractSnapshot>()?),
            None => None,
        };
        let api_info = match optional_item(&r, 3)? {
            Some(a) => Some(a.as_val::<ApiInfo>()?),
            None => None,
        };
        let s = Self {
            balance: r.val_at(0)?,
            store,
            contract,
            api_info,
            hash: Hash::hash(raw),
            size: raw.len(),
        };
        Ok(s)
    }

    pub(crate) fn reset_db(&mut self, db: &dyn Database) -> Result<()> {
        if let Some(c) = &mut self.contract {
            c.reset_db(db)?;
        }
        Ok(())
    }

    pub(crate) fn flush(&self, db: &dyn Database) -> Result<()> {
        match &self.contract {
            Some(c) => c.flush_to(Some(db)),
            None => Ok(()),
        }
    }

    pub fn resolve(&self, builder: &MerkleBuilder) -> Result<()> {
        match &self.contract {
            Some(c) => c.resolve(builder),
            None => Ok(()),
        }
    }
}

/// Optional fields are encoded as a list of zero or one item.
fn optional_item<'a>(r: &rlp::Rlp<'a>, idx: usize) -> Result<Option<rlp::Rlp<'a>>> {
    let item = r.at(idx)?;
    Ok(match item.item_count()? {
        0 => None,
        _ => Some(item.at(0)?),
    })
}

impl PartialEq for AccountSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for AccountSnapshot {}

impl std::fmt::Debug for AccountSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountSnapshot")
            .field("hash", &self.hash)
            .field("balance", &self.balance)
            .field("contract", &self.contract)
            .finish()
    }
}

/// Mutable working copy of an account, owned by a [WorldState](crate::state::WorldState).
pub struct AccountState {
    balance: Amount,
    store: BTreeMap<Bytes, Bytes>,
    contract: Option<Contract>,
    api_info: Option<ApiInfo>,
    dirty: Arc<AtomicBool>,
}

impl AccountState {
    pub fn new(snapshot: &AccountSnapshot) -> Self {
        let dirty = Arc::new(AtomicBool::new(false));
        Self {
            balance: snapshot.balance.clone(),
            store: snapshot.store.clone(),
            contract: snapshot
                .contract
                .as_ref()
                .map(|c| Contract::new(c.clone(), Self::hook(&dirty))),
            api_info: snapshot.api_info.clone(),
            dirty,
        }
    }

    /// Rebuilds a working copy saved by a world-state checkpoint.
    pub(crate) fn restore(snapshot: &AccountSnapshot, dirty: bool) -> Self {
        let acc = Self::new(snapshot);
        acc.dirty.store(dirty, Ordering::Release);
        acc
    }

    fn hook(dirty: &Arc<AtomicBool>) -> DirtyHook {
        let dirty = dirty.clone();
        Arc::new(move || dirty.store(true, Ordering::Release))
    }

    fn touch(&self) {
        self.dirty.store(true, Ordering::Release)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn balance(&self) -> &Amount {
        &self.balance
    }

    pub fn set_balance(&mut self, balance: Amount) {
        if self.balance != balance {
            self.balance = balance;
            self.touch();
        }
    }

    pub fn get_value(&self, key: &[u8]) -> Option<&[u8]> {
        self.store.get(key).map(|v| &v[..])
    }

    pub fn set_value(&mut self, key: &[u8], value: &[u8]) {
        self.store.insert(key.into(), value.into());
        self.touch();
    }

    pub fn delete_value(&mut self, key: &[u8]) -> Option<Bytes> {
        let old = self.store.remove(key);
        if old.is_some() {
            self.touch();
        }
        old
    }

    pub fn get_var(&self, name: &str) -> Result<Option<TypedValue>> {
        self.store
            .get(name.as_bytes())
            .map(|v| TypedValue::from_bytes(v))
            .transpose()
    }

    pub fn set_var(&mut self, name: &str, value: &TypedValue) {
        self.set_value(name.as_bytes(), &value.to_bytes())
    }

    pub fn contract(&self) -> Option<&Contract> {
        self.contract.as_ref()
    }

    pub fn contract_mut(&mut self) -> Option<&mut Contract> {
        self.contract.as_mut()
    }

    /// Installs a new contract record, replacing any previous one.
    pub fn deploy_contract(&mut self, snapshot: ContractSnapshot) {
        self.contract = Some(Contract::new(snapshot, Self::hook(&self.dirty)));
        self.touch();
    }

    pub fn api_info(&self) -> Option<&ApiInfo> {
        self.api_info.as_ref()
    }

    pub fn set_api_info(&mut self, info: Option<ApiInfo>) {
        self.api_info = info;
        self.touch();
    }

    pub fn get_snapshot(&self) -> AccountSnapshot {
        AccountSnapshot::build(
            self.balance.clone(),
            self.store.clone(),
            self.contract.as_ref().map(|c| c.get_snapshot()),
            self.api_info.clone(),
        )
    }
}

/// Historical account as seen by queries.
#[derive(Clone)]
pub struct AccountReadOnly(Arc<AccountSnapshot>);

impl AccountReadOnly {
    pub fn new(snapshot: Arc<AccountSnapshot>) -> Self {
        Self(snapshot)
    }

    pub fn balance(&self) -> &Amount {
        self.0.balance()
    }

    pub fn get_value(&self, key: &[u8]) -> Option<&[u8]> {
        self.0.get_value(key)
    }

    pub fn get_var(&self, name: &str) -> Result<Option<TypedValue>> {
        self.0.get_var(name)
    }

    pub fn contract(&self) -> Option<ContractReadOnly> {
        self.0.contract().map(ContractReadOnly::new)
    }

    pub fn api_info(&self) -> Option<&ApiInfo> {
        self.0.api_info()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::contract::{ContractState, EeType, CT_APP_ZIP};

    #[test]
    fn test_snapshot_encoding_is_stable() {
        let mut acc = AccountState::new(&AccountSnapshot::empty());
        assert!(!acc.is_dirty());
        acc.set_balance(1000u64.into());
        acc.set_value(b"k", b"v");
        acc.set_var("flag", &TypedValue::Bool(true));
        acc.deploy_contract(ContractSnapshot::new(
            ContractState::Active,
            EeType::Python,
            CT_APP_ZIP,
            b"code".to_vec(),
            Some(Hash::hash(b"tx")),
            Bytes::empty(),
        ));
        acc.set_api_info(Some(ApiInfo {
            methods: vec![ApiMethod {
                kind: "function".into(),
                name: "name".into(),
                inputs: vec![],
                readonly: true,
            }],
        }));
        assert!(acc.is_dirty());

        let snap = acc.get_snapshot();
        let decoded = AccountSnapshot::decode(&snap.encode()).unwrap();
        assert_eq!(decoded, snap);
        assert_eq!(decoded.hash(), snap.hash());
        assert_eq!(decoded.balance(), &Amount::from(1000u64));
        assert_eq!(decoded.get_value(b"k"), Some(&b"v"[..]));
        assert_eq!(decoded.get_var("flag").unwrap(), Some(TypedValue::Bool(true)));
        assert_eq!(decoded.contract(), snap.contract());
        assert_eq!(decoded.api_info().unwrap().method("name").unwrap().readonly, true);
    }

    #[test]
    fn test_contract_change_marks_account_dirty() {
        let mut acc = AccountState::new(&AccountSnapshot::empty());
        acc.deploy_contract(ContractSnapshot::new(
            ContractState::Active,
            EeType::Java,
            CT_APP_ZIP,
            b"v1".to_vec(),
            None,
            Bytes::empty(),
        ));
        let mut acc = AccountState::new(&acc.get_snapshot());
        assert!(!acc.is_dirty());
        acc.contract_mut().unwrap().set_code(b"v1".to_vec());
        assert!(!acc.is_dirty());
        acc.contract_mut().unwrap().set_code(b"v2".to_vec());
        assert!(acc.is_dirty());
    }

    #[test]
    fn test_unchanged_account_keeps_hash() {
        let empty = AccountSnapshot::empty();
        let mut acc = AccountState::new(&empty);
        acc.set_balance(Amount::default());
        assert!(!acc.is_dirty());
        assert_eq!(acc.get_snapshot().hash(), empty.hash());
        assert!(empty.is_empty());
    }
}
