use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use rlp_derive::{RlpDecodable, RlpEncodable};
use serde::{Deserialize, Serialize};

use crate::common::{hex_i64, Addr, Amount, Bytes, Hash, Timestamp};
use crate::db::{BucketId, Database};
use crate::error::{Error, Result};
use crate::state::system_addr;

pub const TX_VERSION: u64 = 3;

pub const DATA_TYPE_CALL: &str = "call";
pub const DATA_TYPE_DEPLOY: &str = "deploy";
pub const DATA_TYPE_PATCH: &str = "patch";

/// The two transaction groups of a block, executed patch first.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum TxGroup {
    Patch,
    Normal,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TxKind {
    Normal,
    /// Protocol-level directive issued by the system address.
    Patch,
}

/// Contents of a patch transaction.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PatchData {
    /// The normal transactions of the block at `height + 1` are not executed.
    SkipTransaction {
        #[serde(with = "hex_i64")]
        height: i64,
    },
}

/// Everything a sender signs.
#[derive(RlpDecodable, RlpEncodable, Clone, Default, Debug)]
pub struct TxParams {
    pub version: u64,
    pub from: Addr,
    pub to: Addr,
    pub value: Amount,
    pub step_limit: Amount,
    pub timestamp: u64,
    pub nid: u64,
    pub nonce: Amount,
    pub data_type: String,
    pub data: Bytes,
}

impl TxParams {
    pub fn signing_hash(&self) -> Hash {
        Hash::hash(&rlp::encode(self))
    }
}

/// A decoded, immutable transaction. Its id is the hash of the signed parameters; its size is the
/// length of the wire encoding.
pub struct Transaction {
    params: TxParams,
    signature: Bytes,
    id: Hash,
    raw: Vec<u8>,
    verified: OnceCell<std::result::Result<(), String>>,
}

impl Transaction {
    pub fn from_parts(params: TxParams, signature: Vec<u8>) -> Self {
        let mut s = rlp::RlpStream::new_list(2);
        s.append(&params).append(&signature);
        Self {
            id: params.signing_hash(),
            raw: s.out().to_vec(),
            params,
            signature: signature.into(),
            verified: OnceCell::new(),
        }
    }

    pub fn sign(mut params: TxParams, key: &libsecp256k1::SecretKey) -> Self {
        let pubkey = libsecp256k1::PublicKey::from_secret_key(key);
        params.from = Addr::from_public_key(&pubkey.serialize());
        let msg = libsecp256k1::Message::parse(&params.signing_hash().to_fixed_bytes());
        let (sig, recid) = libsecp256k1::sign(&msg, key);
        let mut signature = sig.serialize().to_vec();
        signature.push(recid.serialize());
        Self::from_parts(params, signature)
    }

    /// Patches are unsigned; they are only accepted from the system address.
    pub fn new_patch(patch: &PatchData, timestamp: Timestamp, nid: u64) -> Result<Self> {
        let data = serde_json::to_vec(patch)
            .map_err(|e| Error::InvalidPatchData(e.to_string()))?;
        Ok(Self::from_parts(
            TxParams {
                version: TX_VERSION,
                from: system_addr().clone(),
                to: system_addr().clone(),
                timestamp: timestamp.max(0) as u64,
                nid,
                data_type: DATA_TYPE_PATCH.into(),
                data: data.into(),
                ..Default::default()
            },
            Vec::new(),
        ))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let r = rlp::Rlp::new(bytes);
        let decode = || -> std::result::Result<Self, rlp::DecoderError> {
            if r.item_count()? != 2 {
                return Err(rlp::DecoderError::RlpIncorrectListLen)
            }
            let params: TxParams = r.val_at(0)?;
            let signature: Vec<u8> = r.val_at(1)?;
            Ok(Self::from_parts(params, signature))
        };
        let tx = decode().map_err(|e| Error::InvalidTransaction(e.to_string()))?;
        if tx.raw != bytes {
            return Err(Error::InvalidTransaction("non-canonical encoding".into()))
        }
        Ok(tx)
    }

    pub fn from_json(json: &serde_json::Value) -> Result<Self> {
        let j: TxJson = serde_json::from_value(json.clone())
            .map_err(|e| Error::InvalidTransaction(e.to_string()))?;
        Ok(j.into_transaction())
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(TxJson::from(self)).unwrap_or_default()
    }

    pub fn id(&self) -> &Hash {
        &self.id
    }

    pub fn bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn size(&self) -> usize {
        self.raw.len()
    }

    pub fn params(&self) -> &TxParams {
        &self.params
    }

    pub fn from(&self) -> &Addr {
        &self.params.from
    }

    pub fn to(&self) -> &Addr {
        &self.params.to
    }

    pub fn value(&self) -> &Amount {
        &self.params.value
    }

    pub fn step_limit(&self) -> &Amount {
        &self.params.step_limit
    }

    pub fn timestamp(&self) -> Timestamp {
        self.params.timestamp as Timestamp
    }

    pub fn nid(&self) -> u64 {
        self.params.nid
    }

    pub fn data_type(&self) -> &str {
        &self.params.data_type
    }

    pub fn data(&self) -> &[u8] {
        &self.params.data
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    pub fn kind(&self) -> TxKind {
        if self.params.data_type == DATA_TYPE_PATCH {
            TxKind::Patch
        } else {
            TxKind::Normal
        }
    }

    pub fn patch_data(&self) -> Result<Option<PatchData>> {
        if self.kind() != TxKind::Patch {
            return Ok(None)
        }
        serde_json::from_slice(&self.params.data)
            .map(Some)
            .map_err(|e| Error::InvalidPatchData(e.to_string()))
    }

    /// Structural and signature checks. The outcome is memoized.
    pub fn verify(&self) -> Result<()> {
        self.verified
            .get_or_init(|| self.check().map_err(|e| e.to_string()))
            .clone()
            .map_err(Error::InvalidTransaction)
    }

    fn check(&self) -> std::result::Result<(), &'static str> {
        let p = &self.params;
        if p.version != TX_VERSION {
            return Err("unsupported version")
        }
        match self.kind() {
            TxKind::Patch => {
                if &p.from != system_addr() {
                    return Err("patch from non-system address")
                }
                if !self.signature.is_empty() {
                    return Err("signed patch")
                }
                if self.patch_data().is_err() {
                    return Err("malformed patch data")
                }
                Ok(())
            }
            TxKind::Normal => {
                if p.from.is_contract() {
                    return Err("sender is a contract")
                }
                match recover_sender(&self.id, &self.signature) {
                    Some(addr) if addr == p.from => Ok(()),
                    Some(_) => Err("signature does not match sender"),
                    None => Err("invalid signature"),
                }
            }
        }
    }

    /// Rejects transactions whose timestamp lies outside `reference ± threshold`.
    pub fn check_timestamp(&self, reference: Timestamp, threshold: i64) -> Result<()> {
        let ts = self.timestamp();
        if ts < reference.saturating_sub(threshold) {
            return Err(Error::ExpiredTransaction(self.id))
        }
        if ts > reference.saturating_add(threshold) {
            return Err(Error::FutureTransaction(self.id))
        }
        Ok(())
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("from", &self.params.from)
            .field("to", &self.params.to)
            .field("data_type", &self.params.data_type)
            .field("timestamp", &self.params.timestamp)
            .finish()
    }
}

fn recover_sender(hash: &Hash, signature: &[u8]) -> Option<Addr> {
    if signature.len() != 65 {
        return None
    }
    let sig = libsecp256k1::Signature::parse_standard_slice(&signature[..64]).ok()?;
    // malleable signatures are rejected
    if sig.s.is_high() {
        return None
    }
    let msg = libsecp256k1::Message::parse_slice(hash.as_bytes()).ok()?;
    let recover_id = libsecp256k1::RecoveryId::parse(signature[64]).ok()?;
    let pubkey = libsecp256k1::recover(&msg, &sig, &recover_id).ok()?.serialize();
    Some(Addr::from_public_key(&pubkey))
}

/// JSON form of a transaction as submitted by clients.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TxJson {
    #[serde(with = "hex_i64")]
    version: i64,
    from: Addr,
    to: Addr,
    #[serde(default)]
    value: Amount,
    #[serde(default)]
    step_limit: Amount,
    #[serde(with = "hex_i64")]
    timestamp: i64,
    #[serde(with = "hex_i64")]
    nid: i64,
    #[serde(default)]
    nonce: Amount,
    #[serde(default)]
    data_type: String,
    #[serde(default)]
    data: Bytes,
    #[serde(default)]
    signature: Bytes,
}

impl TxJson {
    fn into_transaction(self) -> Transaction {
        Transaction::from_parts(
            TxParams {
                version: self.version.max(0) as u64,
                from: self.from,
                to: self.to,
                value: self.value,
                step_limit: self.step_limit,
                timestamp: self.timestamp.max(0) as u64,
                nid: self.nid.max(0) as u64,
                nonce: self.nonce,
                data_type: self.data_type,
                data: self.data,
            },
            self.signature.into_inner(),
        )
    }
}

impl From<&Transaction> for TxJson {
    fn from(tx: &Transaction) -> Self {
        let p = tx.params.clone();
        Self {
            version: p.version as i64,
            from: p.from,
            to: p.to,
            value: p.value,
            step_limit: p.step_limit,
            timestamp: p.timestamp as i64,
            nid: p.nid as i64,
            nonce: p.nonce,
            data_type: p.data_type,
            data: p.data,
            signature: tx.signature.clone(),
        }
    }
}

/// Where a finalized transaction lives: the list it was finalized in and its index there.
#[derive(RlpDecodable, RlpEncodable, Clone, PartialEq, Eq, Debug)]
pub struct TxLocator {
    pub list: Hash,
    pub index: u64,
}

impl TxLocator {
    pub fn get(db: &dyn Database, id: &Hash) -> Result<Option<TxLocator>> {
        match db
            .get_bucket(BucketId::TRANSACTION_LOCATOR_BY_HASH)?
            .get(id.as_bytes())?
        {
            Some(raw) => Ok(Some(rlp::decode(&raw)?)),
            None => Ok(None),
        }
    }
}

/// Ordered, content-addressed list of transactions.
#[derive(Clone, Default)]
pub struct TransactionList {
    txs: Vec<Arc<Transaction>>,
    hash: OnceCell<Hash>,
}

impl TransactionList {
    pub fn new(txs: Vec<Arc<Transaction>>) -> Self {
        Self {
            txs,
            hash: OnceCell::new(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Arc<Transaction>> {
        self.txs.get(idx)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Arc<Transaction>> {
        self.txs.iter()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.txs.iter().map(|tx| tx.size()).sum()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut s = rlp::RlpStream::new_list(self.txs.len());
        for tx in &self.txs {
            s.append_raw(tx.bytes(), 1);
        }
        s.out().to_vec()
    }

    pub fn hash(&self) -> &Hash {
        self.hash.get_or_init(|| Hash::hash(&self.encode()))
    }

    pub fn empty_hash() -> &'static Hash {
        static V: OnceCell<Hash> = OnceCell::new();
        V.get_or_init(|| *TransactionList::empty().hash())
    }

    /// Stores the list and, when asked, a locator for each transaction.
    pub fn flush(&self, db: &dyn Database, with_locators: bool) -> Result<()> {
        let write = || -> Result<()> {
            let hash = self.hash();
            let bk = db.get_bucket(BucketId::BYTES_BY_HASH)?;
            if !self.is_empty() && !bk.has(hash.as_bytes())? {
                bk.set(hash.as_bytes(), &self.encode())?;
            }
            if with_locators {
                let locators = db.get_bucket(BucketId::TRANSACTION_LOCATOR_BY_HASH)?;
                for (i, tx) in self.txs.iter().enumerate() {
                    let loc = TxLocator {
                        list: *hash,
                        index: i as u64,
                    };
                    locators.set(tx.id().as_bytes(), &rlp::encode(&loc))?;
                }
            }
            Ok(())
        };
        write().map_err(|e| e.critical("FailToFlushTransactions"))
    }

    pub fn load(db: &dyn Database, hash: &Hash) -> Result<Self> {
        if hash == Self::empty_hash() {
            return Ok(Self::empty())
        }
        let raw = db
            .get_bucket(BucketId::BYTES_BY_HASH)?
            .get(hash.as_bytes())?
            .ok_or_else(|| Error::NotFound(format!("transaction list {}", hash)))?;
        let mut txs = Vec::new();
        for item in rlp::Rlp::new(&raw).iter() {
            txs.push(Arc::new(Transaction::from_bytes(item.as_raw())?));
        }
        let list = Self::new(txs);
        if list.hash() != hash {
            return Err(Error::Codec(format!("corrupted transaction list {}", hash)))
        }
        Ok(list)
    }
}

impl fmt::Debug for TransactionList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.txs.iter().map(|tx| tx.id())).finish()
    }
}
