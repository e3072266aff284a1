use std::fmt;

use num_traits::FromPrimitive;
use once_cell::sync::OnceCell;
use serde::Serialize;

use crate::common::{Addr, Amount, Hash};
use crate::db::{BucketId, Database};
use crate::error::{Error, Result};

#[derive(FromPrimitive, Serialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "camelCase")]
pub enum ReceiptStatus {
    Success = 0,
    Failure = 1,
    /// Not executed because a skip-transaction patch covered its block.
    Skipped = 2,
}

/// Outcome of one transaction.
#[derive(Serialize, Clone, PartialEq, Eq, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub tx_id: Hash,
    pub status: ReceiptStatus,
    pub step_used: Amount,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score_address: Option<Addr>,
}

impl Receipt {
    pub fn success(tx_id: Hash, step_used: Amount) -> Self {
        Self {
            tx_id,
            status: ReceiptStatus::Success,
            step_used,
            failure: None,
            score_address: None,
        }
    }

    pub fn failure(tx_id: Hash, reason: impl Into<String>) -> Self {
        Self {
            tx_id,
            status: ReceiptStatus::Failure,
            step_used: Amount::default(),
            failure: Some(reason.into()),
            score_address: None,
        }
    }

    pub fn skipped(tx_id: Hash) -> Self {
        Self {
            tx_id,
            status: ReceiptStatus::Skipped,
            step_used: Amount::default(),
            failure: None,
            score_address: None,
        }
    }

    pub fn with_score_address(mut self, addr: Addr) -> Self {
        self.score_address = Some(addr);
        self
    }
}

impl rlp::Encodable for Receipt {
    fn rlp_append(&self, s: &mut rlp::RlpStream) {
        s.begin_list(5)
            .append(&self.tx_id)
            .append(&(self.status as u8))
            .append(&self.step_used)
            .append(&self.failure.clone().unwrap_or_default());
        match &self.score_address {
            Some(addr) => s.append(addr),
            None => s.append_empty_data(),
        };
    }
}

impl rlp::Decodable for Receipt {
    fn decode(rlp: &rlp::Rlp) -> std::result::Result<Self, rlp::DecoderError> {
        if rlp.item_count()? != 5 {
            return Err(rlp::DecoderError::RlpIncorrectListLen)
        }
        let failure: String = rlp.val_at(3)?;
        let score = rlp.at(4)?;
        Ok(Self {
            tx_id: rlp.val_at(0)?,
            status: ReceiptStatus::from_u8(rlp.val_at(1)?)
                .ok_or(rlp::DecoderError::Custom("invalid receipt status"))?,
            step_used: rlp.val_at(2)?,
            failure: if failure.is_empty() { None } else { Some(failure) },
            score_address: if score.is_empty() {
                None
            } else {
                Some(score.as_val()?)
            },
        })
    }
}

/// Receipts of one transaction group, in execution order.
#[derive(Clone, Default)]
pub struct ReceiptList {
    receipts: Vec<Receipt>,
    hash: OnceCell<Hash>,
}

impl ReceiptList {
    pub fn new(receipts: Vec<Receipt>) -> Self {
        Self {
            receipts,
            hash: OnceCell::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.receipts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receipts.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Receipt> {
        self.receipts.get(idx)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Receipt> {
        self.receipts.iter()
    }

    pub fn encode(&self) -> Vec<u8> {
        rlp::encode_list::<Receipt, _>(&self.receipts).to_vec()
    }

    pub fn hash(&self) -> &Hash {
        self.hash.get_or_init(|| Hash::hash(&self.encode()))
    }

    pub fn size_in_bytes(&self) -> usize {
        self.encode().len()
    }

    pub fn flush(&self, db: &dyn Database) -> Result<()> {
        let write = || -> Result<()> {
            let bk = db.get_bucket(BucketId::BYTES_BY_HASH)?;
            let hash = self.hash();
            if !bk.has(hash.as_bytes())? {
                bk.set(hash.as_bytes(), &self.encode())?;
            }
            Ok(())
        };
        write().map_err(|e| e.critical("FailToFlushReceipts"))
    }

    pub fn load(db: &dyn Database, hash: &Hash) -> Result<Self> {
        let raw = db
            .get_bucket(BucketId::BYTES_BY_HASH)?
            .get(hash.as_bytes())?
            .ok_or_else(|| Error::NotFound(format!("receipt list {}", hash)))?;
        let list = Self::new(rlp::Rlp::new(&raw).as_list()?);
        if list.hash() != hash {
            return Err(Error::Codec(format!("corrupted receipt list {}", hash)))
        }
        Ok(list)
    }
}

impl PartialEq for ReceiptList {
    fn eq(&self, other: &Self) -> bool {
        self.receipts == other.receipts
    }
}

impl fmt::Debug for ReceiptList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.receipts.iter()).finish()
    }
}
