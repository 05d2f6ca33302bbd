//! Consensus state machine.
//!
//! This crate provides a synchronous implementation of the round-based
//! consensus protocol that can be used for both simulation and production.
//!
//! # Architecture
//!
//! The state machine processes events synchronously:
//!
//! - `Event::ProposalReceived` → validate proposer and signature, track the
//!   incoming block parts
//! - `Event::BlockPartReceived` → assemble the proposed block, prevote once
//!   complete
//! - `Event::VoteReceived` → tally, lock on a prevote quorum, commit on a
//!   precommit quorum
//! - `Event::TimeoutElapsed` → advance past missing proposals and split
//!   votes
//!
//! All I/O is performed by the runner via returned `Action`s.
//!
//! # Terminology
//!
//! - **Height**: Position in the chain (1, 2, ...). Strictly sequential; a
//!   block at height H commits only after H-1.
//!
//! - **Round**: Attempt number for deciding one height. Multiple rounds may
//!   be needed if a proposal fails (timeout, Byzantine proposer, split
//!   votes).
//!
//! - **POL (proof of lock)**: +2/3 prevotes for one block at some round,
//!   justifying a later re-proposal of that block.
//!
//! # Protocol
//!
//! ## Safety
//!
//! - **Locking**: A validator that precommits a block locks on it and will
//!   only prevote it (or a block with a newer POL) in later rounds.
//!
//! - **Quorum intersection**: Any two +2/3 quorums overlap in an honest
//!   validator, so conflicting blocks cannot both be committed while less
//!   than a third of the power is Byzantine.
//!
//! ## Liveness
//!
//! - **Timeouts**: Each step waits `base + delta * round`, so rounds become
//!   more patient as they fail.
//!
//! - **Round skipping**: +2/3 of votes from a later round move the node to
//!   that round immediately.

mod chain;
mod config;
mod evidence_pool;
mod state;
mod vote_set;

pub use chain::{ChainError, ChainState};
pub use config::ConsensusConfig;
pub use evidence_pool::EvidencePool;
pub use state::{ConsensusState, PrivValidator, RecoveredState, RoundStep};
pub use vote_set::{AddVoteResult, HeightVoteSet, VoteSet, VoteSetError};
