//! # chainsvc: block transition pipeline and world-state snapshot engine
//!
//! - chainsvc is the execution core of a blockchain node: it turns ordered transaction lists into
//!   verifiable, content-addressed state transitions, keeps the pools of pending transactions that
//!   compete for the next block, and caches recent results so queries and re-validation do not
//!   re-execute anything.
//!
//! - Consensus, peer discovery and the instruction semantics of contracts live elsewhere. The
//!   crate only talks to them through small seams: [executor::TxExecutor] for the execution
//!   engine, [manager::TxPropagator] for the network, and [db::Database] for storage.
//!
//! # Overview
//! The crate is a handful of modules, leaf first:
//!
//! - [state]: immutable account/contract snapshots, the copy-on-write [WorldState](state::WorldState)
//!   and the lazily resolved, content-addressed contract code.
//! - [cache]: the transition result record and a bounded, single-flight cache of world snapshots
//!   and receipt lists keyed by result hash.
//! - [mempool]: one bounded [TransactionPool](mempool::TransactionPool) per transaction group,
//!   packing block candidates as a first-fit prefix of arrival order.
//! - [txmanager]: the single admission point in front of both pools, plus the blocking wait used
//!   to avoid proposing empty blocks.
//! - [transition]: the per-block state machine, executing through [processor::run_tx_list].
//! - [manager]: the orchestrator tying everything together and serving point queries.
//!
//! A node typically does the following:
//!
//! - Open a [Manager](manager::Manager) over its database and execution engine.
//! - Create the initial transition from the last finalized result
//!   ([Manager::create_initial_transition](manager::Manager::create_initial_transition)).
//! - For every block, propose (or create, when the block comes from a peer) a transition on top
//!   of the previous one, [execute](transition::Transition::execute) it, and once consensus
//!   agrees, [finalize](manager::Manager::finalize) it.
//!
//! # On Data Flow
//! Every committed piece of state is immutable and named by the SHA3-256 hash of its RLP
//! encoding. A transition reads its parent's [WorldSnapshot](state::WorldSnapshot), writes into
//! a private [WorldState](state::WorldState) that copies accounts on first write, and freezes the
//! outcome into a new snapshot. Unchanged accounts are shared by reference, so a child snapshot
//! costs only what changed.
//!
//! ```notrust
//!   [ TransactionPool ] --candidate()--> [ Transition ] --execute()--> [ WorldState ]
//!                                              |                            |
//!                                              |                      get_snapshot()
//!                                              v                            v
//!                                   [ TransitionResultCache ] <--put-- [ WorldSnapshot ]
//!                                              |
//!                             finalize() / queries via the result hash
//! ```
//!
//! Nothing is written to storage until a transition is finalized. Finalization is split into
//! three independent, idempotent parts (normal transactions, patch transactions, result), so the
//! caller can commit the transaction lists of a block before its result is agreed upon.

#[macro_use] extern crate num_derive;

#[macro_use]
pub mod common;
pub mod cache;
pub mod codec;
pub mod config;
pub mod db;
pub mod error;
pub mod executor;
pub mod manager;
pub mod mempool;
pub mod metric;
pub mod processor;
pub mod receipt;
pub mod state;
pub mod trace;
pub mod transition;
pub mod tx;
pub mod txmanager;
