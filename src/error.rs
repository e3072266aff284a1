//! Error taxonomy of the service core.
//!
//! Recoverable conditions are returned as [Error]. Violations of the calling protocol (finalizing
//! a transition that never completed, resetting a read-only view, ...) do not belong here: they go
//! through [invariant_violation], which never returns.

use thiserror::Error;

use crate::common::Hash;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),
    #[error("duplicate transaction {0}")]
    DuplicateTransaction(Hash),
    #[error("expired transaction {0}")]
    ExpiredTransaction(Hash),
    #[error("future transaction {0}")]
    FutureTransaction(Hash),
    #[error("transaction pool overflow (size={0})")]
    PoolFull(usize),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("not a contract address: {0}")]
    NotContractAddress(String),
    #[error("no active contract: {0}")]
    NoActiveContract(String),
    #[error("invalid patch data: {0}")]
    InvalidPatchData(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("illegal argument: {0}")]
    IllegalArgument(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("critical I/O failure: {0}")]
    CriticalIo(String),
    #[error("execution failure: {0}")]
    Execution(String),
    #[error("codec failure: {0}")]
    Codec(String),
    #[error("database failure: {0}")]
    Db(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Reclassify a storage failure that happened during mandatory persistence.
    pub fn critical(self, what: &str) -> Error {
        match self {
            Error::Db(msg) | Error::CriticalIo(msg) => {
                Error::CriticalIo(format!("{}: {}", what, msg))
            }
            e => e,
        }
    }
}

impl From<rlp::DecoderError> for Error {
    fn from(e: rlp::DecoderError) -> Self {
        Error::Codec(e.to_string())
    }
}

/// The fatal path for broken internal contracts. Logged before unwinding so the supervisor sees
/// the reason even when the panic is caught further up.
#[cold]
#[track_caller]
pub fn invariant_violation(msg: impl AsRef<str>) -> ! {
    let msg = msg.as_ref();
    log::error!("invariant violation: {}", msg);
    panic!("invariant violation: {}", msg)
}

#[test]
fn test_critical_wraps_db_only() {
    assert_eq!(
        Error::Db("disk".into()).critical("flush code"),
        Error::CriticalIo("flush code: disk".into())
    );
    assert_eq!(
        Error::NotFound("x".into()).critical("flush code"),
        Error::NotFound("x".into())
    );
}
