//! Core types for Palisade consensus.
//!
//! This crate provides the foundational types used throughout the consensus
//! implementation:
//!
//! - **Primitives**: Hash, address, cryptographic keys and signatures
//! - **Consensus types**: Header, Block, Commit, Vote, Proposal, Evidence
//! - **Validator sets**: deterministic ordering, proposer rotation, commit
//!   verification (full, light, and trusting)
//! - **Merkle**: RFC-6962-style tree, inclusion proofs, composable proof
//!   operators
//! - **Wire**: the canonical deterministic encoding used for every hashed
//!   and signed structure
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend
//! on any other workspace crates, making it the foundation layer. Everything
//! here is deterministic: two nodes encoding or hashing the same value must
//! produce identical bytes.

mod block;
mod commit;
mod crypto;
mod evidence;
mod genesis;
mod hash;
pub mod merkle;
mod part_set;
mod proposal;
mod time;
mod validator;
mod vote;
pub mod wire;

pub use block::{Block, BlockError, BlockId, Header, SignedHeader, Tx};
pub use commit::{Commit, CommitError, CommitSig};
pub use crypto::{
    verify_batch, CryptoError, Keypair, PublicKey, Signature, SignatureCache, ED25519_KEY_TYPE,
    ED25519_PUB_KEY_SIZE, ED25519_SIGNATURE_SIZE,
};
pub use evidence::{DuplicateVoteEvidence, Evidence, EvidenceError, LightClientAttackEvidence};
pub use genesis::{
    BlockParams, ConsensusParams, EvidenceParams, FeatureParams, GenesisDoc, GenesisError,
    GenesisPubKey, GenesisValidator, ValidatorParams,
};
pub use hash::{Address, Hash, HexError, ADDRESS_SIZE, HASH_SIZE};
pub use part_set::{Part, PartSet, PartSetError, PartSetHeader, BLOCK_PART_SIZE};
pub use proposal::Proposal;
pub use time::Time;
pub use validator::{
    TrustLevel, Validator, ValidatorSet, ValidatorSetError, ValidatorUpdate, VerifyCommitError,
    MAX_TOTAL_VOTING_POWER, PRIORITY_WINDOW_SIZE_FACTOR,
};
pub use vote::{Vote, VoteType};

/// Test utilities shared across the workspace's test suites.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    use super::*;

    /// Deterministic keypair from a seed byte.
    pub fn test_keypair(seed: u8) -> Keypair {
        Keypair::from_seed([seed; 32])
    }

    /// A validator set of `n` equally-weighted validators, with their keys.
    ///
    /// Keys are seeded `0..n` so tests are reproducible.
    pub fn test_validator_set(n: u8, power: i64) -> (Vec<Keypair>, ValidatorSet) {
        let keys: Vec<Keypair> = (0..n).map(test_keypair).collect();
        let vals = keys
            .iter()
            .map(|k| Validator::new(k.public_key(), power))
            .collect();
        let set = ValidatorSet::new(vals).expect("test validator set is well-formed");
        (keys, set)
    }
}
