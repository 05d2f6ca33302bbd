//! Byzantine behavior evidence.
//!
//! Evidence is self-contained: any node can verify it with nothing but the
//! validator set of the height it accuses. Verified evidence is gossiped,
//! included in a later block within the evidence age window, and surfaced
//! to the application for slashing.

use crate::block::SignedHeader;
use crate::hash::Hash;
use crate::time::Time;
use crate::validator::{TrustLevel, ValidatorSet};
use crate::vote::Vote;
use crate::wire::{self, WireDecode, WireEncode, WireError};
use crate::SignatureCache;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvidenceError {
    #[error("votes are from different validators: {0} vs {1}")]
    DifferentValidators(crate::Address, crate::Address),

    #[error("votes do not conflict")]
    NotConflicting,

    #[error("vote heights differ: {0} vs {1}")]
    HeightMismatch(u64, u64),

    #[error("vote rounds differ: {0} vs {1}")]
    RoundMismatch(u32, u32),

    #[error("vote types differ")]
    TypeMismatch,

    #[error("validator {0} not in the validator set for the evidence height")]
    UnknownValidator(crate::Address),

    #[error("signature on vote {0} is invalid")]
    InvalidVoteSignature(usize),

    #[error("conflicting header verification failed: {0}")]
    ConflictingHeader(String),

    #[error("evidence from height {height} is older than the window ({max_age_blocks} blocks / {max_age_ms}ms)")]
    Expired {
        height: u64,
        max_age_blocks: u64,
        max_age_ms: u64,
    },
}

/// Two conflicting votes signed by the same validator at the same
/// (height, round, type).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateVoteEvidence {
    pub vote_a: Vote,
    pub vote_b: Vote,
    /// Total power of the validator set at the evidence height; recorded
    /// so the application can judge severity without replaying history.
    pub total_voting_power: i64,
    pub validator_power: i64,
    pub timestamp: Time,
}

impl DuplicateVoteEvidence {
    /// Build evidence from a conflicting pair, normalizing vote order so
    /// the same pair always hashes identically.
    pub fn new(
        vote_a: Vote,
        vote_b: Vote,
        total_voting_power: i64,
        validator_power: i64,
        timestamp: Time,
    ) -> Result<Self, EvidenceError> {
        check_conflicting(&vote_a, &vote_b)?;
        let (first, second) = if block_id_key(&vote_a) <= block_id_key(&vote_b) {
            (vote_a, vote_b)
        } else {
            (vote_b, vote_a)
        };
        Ok(DuplicateVoteEvidence {
            vote_a: first,
            vote_b: second,
            total_voting_power,
            validator_power,
            timestamp,
        })
    }

    pub fn height(&self) -> u64 {
        self.vote_a.height
    }

    pub fn validator_address(&self) -> crate::Address {
        self.vote_a.validator_address
    }

    /// Verify independently: the pair conflicts, the validator belongs to
    /// `vals`, and both signatures are genuine.
    pub fn verify(
        &self,
        chain_id: &str,
        vals: &ValidatorSet,
        cache: &SignatureCache,
    ) -> Result<(), EvidenceError> {
        check_conflicting(&self.vote_a, &self.vote_b)?;
        let address = self.vote_a.validator_address;
        let Some((_, val)) = vals.get_by_address(&address) else {
            return Err(EvidenceError::UnknownValidator(address));
        };
        for (i, vote) in [&self.vote_a, &self.vote_b].into_iter().enumerate() {
            cache
                .verify(&val.pub_key, &vote.sign_bytes(chain_id), &vote.signature)
                .map_err(|_| EvidenceError::InvalidVoteSignature(i))?;
        }
        Ok(())
    }
}

fn check_conflicting(a: &Vote, b: &Vote) -> Result<(), EvidenceError> {
    if a.validator_address != b.validator_address {
        return Err(EvidenceError::DifferentValidators(
            a.validator_address,
            b.validator_address,
        ));
    }
    if a.height != b.height {
        return Err(EvidenceError::HeightMismatch(a.height, b.height));
    }
    if a.round != b.round {
        return Err(EvidenceError::RoundMismatch(a.round, b.round));
    }
    if a.vote_type != b.vote_type {
        return Err(EvidenceError::TypeMismatch);
    }
    if a.block_id == b.block_id {
        return Err(EvidenceError::NotConflicting);
    }
    Ok(())
}

fn block_id_key(vote: &Vote) -> Hash {
    vote.block_id.map(|id| id.hash).unwrap_or(Hash::ZERO)
}

/// A conflicting header presented to a light client, signed by a fork of
/// the validator set that branched at `common_height`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LightClientAttackEvidence {
    pub conflicting_block: SignedHeader,
    /// Last height at which the attacker's chain agreed with ours.
    pub common_height: u64,
    pub total_voting_power: i64,
    pub timestamp: Time,
}

impl LightClientAttackEvidence {
    pub fn height(&self) -> u64 {
        self.conflicting_block.header.height
    }

    /// Verify that the conflicting header really was signed by at least a
    /// third of the validator set trusted at `common_height`: anything
    /// less is noise, anything more proves a punishable fork.
    pub fn verify(
        &self,
        chain_id: &str,
        common_vals: &ValidatorSet,
        cache: &SignatureCache,
    ) -> Result<(), EvidenceError> {
        self.conflicting_block
            .validate_basic(chain_id)
            .map_err(|e| EvidenceError::ConflictingHeader(e.to_string()))?;
        common_vals
            .verify_commit_light_trusting(
                chain_id,
                &self.conflicting_block.commit,
                TrustLevel::ONE_THIRD,
                cache,
            )
            .map_err(|e| EvidenceError::ConflictingHeader(e.to_string()))?;
        Ok(())
    }
}

/// All evidence kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evidence {
    DuplicateVote(DuplicateVoteEvidence),
    LightClientAttack(LightClientAttackEvidence),
}

impl Evidence {
    pub fn height(&self) -> u64 {
        match self {
            Evidence::DuplicateVote(ev) => ev.height(),
            Evidence::LightClientAttack(ev) => ev.height(),
        }
    }

    pub fn timestamp(&self) -> Time {
        match self {
            Evidence::DuplicateVote(ev) => ev.timestamp,
            Evidence::LightClientAttack(ev) => ev.timestamp,
        }
    }

    /// Content hash; evidence is stored and deduplicated by it.
    pub fn hash(&self) -> Hash {
        Hash::sum(&self.encode())
    }

    /// Is this evidence still inside the age window at the given committed
    /// height and time? Both bounds must hold.
    pub fn is_expired(
        &self,
        committed_height: u64,
        committed_time: Time,
        max_age_blocks: u64,
        max_age_ms: u64,
    ) -> bool {
        let age_blocks = committed_height.saturating_sub(self.height());
        let age_ms = committed_time
            .as_millis()
            .saturating_sub(self.timestamp().as_millis());
        age_blocks > max_age_blocks && age_ms > max_age_ms
    }
}

impl WireEncode for Evidence {
    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Evidence::DuplicateVote(ev) => {
                out.push(1);
                ev.vote_a.encode_into(out);
                ev.vote_b.encode_into(out);
                wire::write_svarint(out, ev.total_voting_power);
                wire::write_svarint(out, ev.validator_power);
                wire::write_uvarint(out, ev.timestamp.as_millis());
            }
            Evidence::LightClientAttack(ev) => {
                out.push(2);
                ev.conflicting_block.encode_into(out);
                wire::write_uvarint(out, ev.common_height);
                wire::write_svarint(out, ev.total_voting_power);
                wire::write_uvarint(out, ev.timestamp.as_millis());
            }
        }
    }
}

impl WireDecode for Evidence {
    fn decode_from(input: &mut &[u8]) -> Result<Self, WireError> {
        let tag = wire::take(input, 1)?[0];
        match tag {
            1 => Ok(Evidence::DuplicateVote(DuplicateVoteEvidence {
                vote_a: Vote::decode_from(input)?,
                vote_b: Vote::decode_from(input)?,
                total_voting_power: wire::read_svarint(input)?,
                validator_power: wire::read_svarint(input)?,
                timestamp: Time::from_millis(wire::read_uvarint(input)?),
            })),
            2 => Ok(Evidence::LightClientAttack(LightClientAttackEvidence {
                conflicting_block: SignedHeader::decode_from(input)?,
                common_height: wire::read_uvarint(input)?,
                total_voting_power: wire::read_svarint(input)?,
                timestamp: Time::from_millis(wire::read_uvarint(input)?),
            })),
            other => Err(WireError::InvalidDiscriminant(u64::from(other))),
        }
    }
}
