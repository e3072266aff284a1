//! Copy-on-write, content-addressed world state.
//!
//! Committed state is a tree of immutable snapshots ([WorldSnapshot] → [AccountSnapshot] →
//! [ContractSnapshot]), each identified by the SHA3-256 hash of its RLP encoding. A transition
//! executes against a [WorldState], which copies an account out of its base snapshot on first
//! write and freezes into a new [WorldSnapshot] when execution ends. Unchanged accounts are shared
//! by reference between parent and child.
//!
//! Contract code is the only large blob in the tree. It is stored separately in the
//! `bytes-by-hash` bucket keyed by its hash and only brought into memory on first access (or, while
//! syncing from peers, when the [MerkleBuilder] receives it).

pub mod account;
pub mod contract;
pub mod merkle;
pub mod world;

pub use account::{AccountReadOnly, AccountSnapshot, AccountState, ApiInfo, ApiMethod};
pub use contract::{
    Contract, ContractReadOnly, ContractSnapshot, ContractState, EeType,
};
pub use merkle::{DataRequester, MerkleBuilder};
pub use world::{
    system_addr, BlockInfo, ReadOnlyWorldState, ValidatorList, WorldContext,
    WorldSnapshot, WorldState,
};
