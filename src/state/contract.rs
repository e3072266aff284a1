use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use num_traits::FromPrimitive;
use once_cell::sync::OnceCell;

use crate::common::{Bytes, Hash, NullableHash};
use crate::db::{Bucket, BucketId, Database};
use crate::error::{Error, Result};
use crate::state::merkle::{DataRequester, MerkleBuilder};

#[derive(FromPrimitive, Clone, Copy, PartialEq, Eq, Debug)]
pub enum ContractState {
    Inactive = 1,
    Active = 2,
    Pending = 4,
    Rejected = 8,
}

impl fmt::Display for ContractState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ContractState::Inactive => "inactive",
            ContractState::Active => "active",
            ContractState::Pending => "pending",
            ContractState::Rejected => "rejected",
        })
    }
}

#[derive(FromPrimitive, Clone, Copy, PartialEq, Eq, Debug)]
pub enum EeType {
    System = 0,
    Python = 1,
    Java = 2,
}

impl fmt::Display for EeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EeType::System => "system",
            EeType::Python => "python",
            EeType::Java => "java",
        })
    }
}

pub const CT_APP_ZIP: &str = "application/zip";
pub const CT_APP_JAVA: &str = "application/java";
pub const CT_APP_SYSTEM: &str = "application/x.score.system";

/// Content-addressed code slot. The bytes are written at most once: either when the code is
/// created by `set_code`, when they are first read from the blob bucket, or when a pending merkle
/// request is answered during state sync.
pub struct CodeCell {
    hash: Hash,
    code: OnceCell<Bytes>,
    /// Set for code that exists only in memory and still has to be flushed.
    new: AtomicBool,
}

impl CodeCell {
    fn resident(code: Vec<u8>) -> Self {
        Self {
            hash: Hash::hash(&code),
            code: OnceCell::with_value(code.into()),
            new: AtomicBool::new(true),
        }
    }

    fn pointer(hash: Hash) -> Self {
        Self {
            hash,
            code: OnceCell::new(),
            new: AtomicBool::new(false),
        }
    }

    pub fn is_resident(&self) -> bool {
        self.code.get().is_some()
    }
}

impl DataRequester for CodeCell {
    fn on_data(&self, bytes: &[u8]) -> Result<()> {
        // a second delivery of the same content is harmless
        let _ = self.code.set(bytes.into());
        Ok(())
    }
}

/// Immutable record of a deployed contract.
///
/// Equality is logical: two snapshots are equal when status, deploy/audit transactions and code
/// hash agree, whatever the residency of the code bytes.
#[derive(Clone)]
pub struct ContractSnapshot {
    state: ContractState,
    content_type: String,
    ee_type: EeType,
    deploy_tx_hash: Option<Hash>,
    audit_tx_hash: Option<Hash>,
    code: Option<Arc<CodeCell>>,
    params: Bytes,
    bucket: Option<Arc<dyn Bucket>>,
}

impl ContractSnapshot {
    pub fn new(
        state: ContractState, ee_type: EeType, content_type: &str,
        code: Vec<u8>, deploy_tx_hash: Option<Hash>, params: Bytes,
    ) -> Self {
        Self {
            state,
            content_type: content_type.into(),
            ee_type,
            deploy_tx_hash,
            audit_tx_hash: None,
            code: if code.is_empty() {
                None
            } else {
                Some(Arc::new(CodeCell::resident(code)))
            },
            params,
            bucket: None,
        }
    }

    pub fn status(&self) -> ContractState {
        self.state
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn ee_type(&self) -> EeType {
        self.ee_type
    }

    pub fn deploy_tx_hash(&self) -> Option<&Hash> {
        self.deploy_tx_hash.as_ref()
    }

    pub fn audit_tx_hash(&self) -> Option<&Hash> {
        self.audit_tx_hash.as_ref()
    }

    pub fn params(&self) -> &[u8] {
        &self.params
    }

    pub fn code_hash(&self) -> Option<&Hash> {
        self.code.as_ref().map(|c| &c.hash)
    }

    /// Identity of the contract code: the deploy transaction, or the hash of this record for
    /// contracts installed without one (genesis/system contracts).
    pub fn code_id(&self) -> Hash {
        match &self.deploy_tx_hash {
            Some(h) => h.clone(),
            None => Hash::hash(&self.encode()),
        }
    }

    pub fn is_code_resident(&self) -> bool {
        self.code.as_ref().map(|c| c.is_resident()).unwrap_or(true)
    }

    /// Returns the code, reading it from the blob bucket on first access. Concurrent first readers
    /// share a single load.
    pub fn code(&self) -> Result<Option<&[u8]>> {
        let cell = match &self.code {
            Some(cell) => cell,
            None => return Ok(None),
        };
        let code = cell.code.get_or_try_init(|| {
            let bucket = self.bucket.as_ref().ok_or_else(|| {
                Error::NotFound(format!(
                    "FAIL to find code by codeHash({}): no storage",
                    cell.hash
                ))
            })?;
            match bucket.get(cell.hash.as_bytes())? {
                Some(code) if !code.is_empty() => Ok(Bytes::from(code)),
                _ => Err(Error::NotFound(format!(
                    "FAIL to find code by codeHash({})",
                    cell.hash
                ))),
            }
        })?;
        Ok(Some(&code[..]))
    }

    /// Registers a deferred request for code that is not available locally yet.
    pub fn resolve(&self, builder: &MerkleBuilder) -> Result<()> {
        let cell = match &self.code {
            Some(cell) if !cell.is_resident() => cell,
            _ => return Ok(()),
        };
        let bucket = match &self.bucket {
            Some(bucket) => bucket.clone(),
            None => builder.database().get_bucket(BucketId::BYTES_BY_HASH)?,
        };
        match bucket.get(cell.hash.as_bytes())? {
            Some(code) if !code.is_empty() => cell.on_data(&code),
            _ => {
                builder.request_data(
                    BucketId::BYTES_BY_HASH,
                    cell.hash.clone(),
                    cell.clone(),
                );
                Ok(())
            }
        }
    }

    /// Writes newly created code to the blob bucket. Must happen before a snapshot referencing
    /// the code is persisted.
    pub fn flush(&self) -> Result<()> {
        self.flush_to(None)
    }

    /// Like [flush](Self::flush), falling back to `db` when no storage is attached yet.
    pub(crate) fn flush_to(&self, db: Option<&dyn Database>) -> Result<()> {
        let cell = match &self.code {
            Some(cell) => cell,
            None => return Ok(()),
        };
        if !cell.new.swap(false, Ordering::AcqRel) {
            return Ok(())
        }
        let write = || -> Result<()> {
            let bucket = match (&self.bucket, db) {
                (Some(bucket), _) => bucket.clone(),
                (None, Some(db)) => db.get_bucket(BucketId::BYTES_BY_HASH)?,
                (None, None) => {
                    return Err(Error::CriticalIo(
                        "no storage attached to contract".into(),
                    ))
                }
            };
            let code = cell.code.get().ok_or_else(|| {
                Error::CriticalIo(format!("new code {} is not resident", cell.hash))
            })?;
            bucket.set(cell.hash.as_bytes(), code)
        };
        write().map_err(|e| {
            cell.new.store(true, Ordering::Release);
            e.critical("FailToFlushCode")
        })
    }

    pub fn reset_db(&mut self, db: &dyn Database) -> Result<()> {
        self.bucket = Some(
            db.get_bucket(BucketId::BYTES_BY_HASH)
                .map_err(|e| e.critical("FailToGetBucket"))?,
        );
        Ok(())
    }

    pub fn encode(&self) -> Vec<u8> {
        rlp::encode(self).to_vec()
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        Ok(rlp::decode(raw)?)
    }
}

impl PartialEq for ContractSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.state == other.state &&
            self.deploy_tx_hash == other.deploy_tx_hash &&
            self.audit_tx_hash == other.audit_tx_hash &&
            self.code_hash() == other.code_hash()
    }
}

impl Eq for ContractSnapshot {}

impl rlp::Encodable for ContractSnapshot {
    fn rlp_append(&self, s: &mut rlp::RlpStream) {
        s.begin_list(7)
            .append(&(self.state as u8))
            .append(&self.content_type)
            .append(&(self.ee_type as u8))
            .append(&NullableHash(self.deploy_tx_hash.clone()))
            .append(&NullableHash(self.audit_tx_hash.clone()))
            .append(&NullableHash(self.code_hash().cloned()))
            .append(&self.params);
    }
}

impl rlp::Decodable for ContractSnapshot {
    fn decode(rlp: &rlp::Rlp) -> std::result::Result<Self, rlp::DecoderError> {
        if rlp.item_count()? != 7 {
            return Err(rlp::DecoderError::RlpIncorrectListLen)
        }
        let state = ContractState::from_u8(rlp.val_at(0)?)
            .ok_or(rlp::DecoderError::Custom("invalid contract state"))?;
        let ee_type = EeType::from_u8(rlp.val_at(2)?)
            .ok_or(rlp::DecoderError::Custom("invalid ee type"))?;
        let code_hash: NullableHash = rlp.val_at(5)?;
        Ok(Self {
            state,
            content_type: rlp.val_at(1)?,
            ee_type,
            deploy_tx_hash: rlp.val_at::<NullableHash>(3)?.0,
            audit_tx_hash: rlp.val_at::<NullableHash>(4)?.0,
            code: code_hash.0.map(|h| Arc::new(CodeCell::pointer(h))),
            params: rlp.val_at(6)?,
            bucket: None,
        })
    }
}

impl fmt::Display for ContractSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let opt = |h: Option<&Hash>| h.map(|h| h.to_string()).unwrap_or_default();
        write!(
            f,
            "Contract{{hash={} ee={} deploy={} audit={}}}",
            opt(self.code_hash()),
            self.ee_type,
            opt(self.deploy_tx_hash()),
            opt(self.audit_tx_hash())
        )
    }
}

impl fmt::Debug for ContractSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

pub type DirtyHook = Arc<dyn Fn() + Send + Sync>;

/// Working copy of a contract owned by a mutable account.
pub struct Contract {
    snapshot: ContractSnapshot,
    mark_dirty: DirtyHook,
}

impl Contract {
    pub fn new(snapshot: ContractSnapshot, mark_dirty: DirtyHook) -> Self {
        Self {
            snapshot,
            mark_dirty,
        }
    }

    /// Empty code deactivates the contract; identical code is a no-op.
    pub fn set_code(&mut self, code: Vec<u8>) {
        if code.is_empty() {
            self.snapshot.code = None;
            (self.mark_dirty)();
            return
        }
        if self.snapshot.code_hash() == Some(&Hash::hash(&code)) {
            return
        }
        self.snapshot.code = Some(Arc::new(CodeCell::resident(code)));
        (self.mark_dirty)();
    }

    pub fn set_status(&mut self, state: ContractState, audit_tx_hash: Option<Hash>) {
        self.snapshot.state = state;
        if audit_tx_hash.is_some() {
            self.snapshot.audit_tx_hash = audit_tx_hash;
        }
        (self.mark_dirty)();
    }

    pub fn get_snapshot(&self) -> ContractSnapshot {
        self.snapshot.clone()
    }

    pub fn reset(&mut self, snapshot: &ContractSnapshot) {
        self.snapshot = snapshot.clone();
    }
}

impl std::ops::Deref for Contract {
    type Target = ContractSnapshot;
    fn deref(&self) -> &ContractSnapshot {
        &self.snapshot
    }
}

/// Read-only view over a historical contract. There is deliberately no way to reach a mutator
/// through it.
#[derive(Clone)]
pub struct ContractReadOnly(ContractSnapshot);

impl ContractReadOnly {
    pub fn new(snapshot: &ContractSnapshot) -> Self {
        Self(snapshot.clone())
    }
}

impl std::ops::Deref for ContractReadOnly {
    type Target = ContractSnapshot;
    fn deref(&self) -> &ContractSnapshot {
        &self.0
    }
}
