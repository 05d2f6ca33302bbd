//! Vote tallies for one height.

use palisade_types::{
    Address, BlockId, Commit, CommitSig, Hash, SignatureCache, ValidatorSet, Vote, VoteType,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VoteSetError {
    #[error("vote is for height {got}, set is for {want}")]
    WrongHeight { got: u64, want: u64 },

    #[error("vote is for round {got}, set is for {want}")]
    WrongRound { got: u32, want: u32 },

    #[error("vote type {got} does not match set type {want}")]
    WrongType { got: VoteType, want: VoteType },

    #[error("validator index {index} out of range")]
    IndexOutOfRange { index: u32 },

    #[error("validator index {index} belongs to {expected}, vote names {got}")]
    AddressMismatch {
        index: u32,
        expected: Address,
        got: Address,
    },

    #[error("invalid vote signature from {0}")]
    InvalidSignature(Address),

    #[error("no +2/3 majority to build a commit from")]
    NoMajority,

    #[error("commit majority is nil, not a block")]
    NilMajority,
}

/// Result of adding a vote to a set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddVoteResult {
    /// New information; the tally changed.
    Added,
    /// Byte-identical to a vote already held.
    Duplicate,
    /// The validator already voted differently at these coordinates; the
    /// previous vote is returned as the other half of an equivocation
    /// proof. The new vote is NOT counted.
    Conflicting(Box<Vote>),
}

/// Votes of one (height, round, type), indexed by validator and tallied by
/// block.
#[derive(Debug, Clone)]
pub struct VoteSet {
    chain_id: String,
    height: u64,
    round: u32,
    vote_type: VoteType,
    validators: Arc<ValidatorSet>,
    /// One slot per validator, in set order.
    votes: Vec<Option<Vote>>,
    /// Total power that has voted (any block).
    sum: i64,
    /// Power per voted-for block (`None` key is the nil vote).
    by_block: HashMap<Option<Hash>, i64>,
    /// Full block id per voted-for block hash, to hand back on majority.
    block_ids: HashMap<Hash, BlockId>,
    /// First +2/3 majority observed, if any.
    maj23: Option<Option<BlockId>>,
}

impl VoteSet {
    pub fn new(
        chain_id: String,
        height: u64,
        round: u32,
        vote_type: VoteType,
        validators: Arc<ValidatorSet>,
    ) -> Self {
        VoteSet {
            chain_id,
            height,
            round,
            vote_type,
            votes: vec![None; validators.len()],
            validators,
            sum: 0,
            by_block: HashMap::new(),
            block_ids: HashMap::new(),
            maj23: None,
        }
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn vote_type(&self) -> VoteType {
        self.vote_type
    }

    /// Add a verified-coordinate vote.
    ///
    /// The signature is checked here, through the shared cache, so no
    /// unverified vote ever enters a tally. A conflicting pair is returned
    /// (not swallowed) so the caller can build evidence.
    pub fn add_vote(
        &mut self,
        vote: Vote,
        cache: &SignatureCache,
    ) -> Result<AddVoteResult, VoteSetError> {
        if vote.height != self.height {
            return Err(VoteSetError::WrongHeight {
                got: vote.height,
                want: self.height,
            });
        }
        if vote.round != self.round {
            return Err(VoteSetError::WrongRound {
                got: vote.round,
                want: self.round,
            });
        }
        if vote.vote_type != self.vote_type {
            return Err(VoteSetError::WrongType {
                got: vote.vote_type,
                want: self.vote_type,
            });
        }

        let index = vote.validator_index;
        let Some(val) = self.validators.get_by_index(index) else {
            return Err(VoteSetError::IndexOutOfRange { index });
        };
        if val.address != vote.validator_address {
            return Err(VoteSetError::AddressMismatch {
                index,
                expected: val.address,
                got: vote.validator_address,
            });
        }

        cache
            .verify(&val.pub_key, &vote.sign_bytes(&self.chain_id), &vote.signature)
            .map_err(|_| VoteSetError::InvalidSignature(val.address))?;

        if let Some(existing) = &self.votes[index as usize] {
            if existing.block_id == vote.block_id {
                return Ok(AddVoteResult::Duplicate);
            }
            // Two valid signatures over conflicting votes: equivocation.
            warn!(
                validator = ?val.address,
                height = self.height,
                round = self.round,
                "conflicting vote detected"
            );
            return Ok(AddVoteResult::Conflicting(Box::new(existing.clone())));
        }

        let power = val.voting_power;
        let key = vote.block_id.map(|id| id.hash);
        if let Some(id) = vote.block_id {
            self.block_ids.insert(id.hash, id);
        }
        self.votes[index as usize] = Some(vote);
        self.sum += power;
        let tally = self.by_block.entry(key).or_insert(0);
        *tally += power;
        if self.maj23.is_none() && self.validators.has_two_thirds(*tally) {
            self.maj23 = Some(key.map(|h| self.block_ids[&h]));
        }
        Ok(AddVoteResult::Added)
    }

    /// The block (or nil) holding more than two thirds of the power, if
    /// any. `Some(None)` is a nil majority.
    pub fn two_thirds_majority(&self) -> Option<Option<BlockId>> {
        self.maj23
    }

    /// Has any mix of votes crossed two thirds?
    pub fn has_two_thirds_any(&self) -> bool {
        self.validators.has_two_thirds(self.sum)
    }

    pub fn has_two_thirds_nil(&self) -> bool {
        self.maj23 == Some(None)
    }

    /// Power voted so far.
    pub fn voted_power(&self) -> i64 {
        self.sum
    }

    pub fn get_by_index(&self, index: u32) -> Option<&Vote> {
        self.votes.get(index as usize)?.as_ref()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vote> {
        self.votes.iter().flatten()
    }

    /// Build the commit proving the majority block.
    ///
    /// Only meaningful for precommit sets with a +2/3 block majority.
    /// Every slot keeps the validator-set order; validators whose
    /// precommit went elsewhere are recorded as nil, missing ones absent.
    pub fn make_commit(&self) -> Result<Commit, VoteSetError> {
        let Some(maj) = self.maj23 else {
            return Err(VoteSetError::NoMajority);
        };
        let Some(block_id) = maj else {
            return Err(VoteSetError::NilMajority);
        };

        let signatures: Vec<CommitSig> = self
            .votes
            .iter()
            .map(|slot| match slot {
                None => CommitSig::Absent,
                Some(vote) => {
                    if vote.block_id == Some(block_id) {
                        CommitSig::Commit {
                            validator_address: vote.validator_address,
                            timestamp: vote.timestamp,
                            signature: vote.signature,
                        }
                    } else {
                        // A precommit for another block or for nil counts
                        // as nil in the commit; its sign bytes only match
                        // when the vote really was nil, so foreign-block
                        // precommits are dropped to absent instead.
                        match vote.block_id {
                            None => CommitSig::Nil {
                                validator_address: vote.validator_address,
                                timestamp: vote.timestamp,
                                signature: vote.signature,
                            },
                            Some(_) => CommitSig::Absent,
                        }
                    }
                }
            })
            .collect();

        Ok(Commit {
            height: self.height,
            round: self.round,
            block_id,
            signatures,
        })
    }
}

/// All vote sets of one height: a prevote and a precommit set per round.
///
/// Votes are accepted for any round of the height: current-round votes
/// drive the state machine, future-round votes let it detect that the
/// network moved on, and past-round votes can still complete a POL.
#[derive(Debug)]
pub struct HeightVoteSet {
    chain_id: String,
    height: u64,
    validators: Arc<ValidatorSet>,
    round: u32,
    rounds: BTreeMap<u32, RoundVotes>,
}

#[derive(Debug)]
struct RoundVotes {
    prevotes: VoteSet,
    precommits: VoteSet,
}

impl HeightVoteSet {
    pub fn new(chain_id: String, height: u64, validators: Arc<ValidatorSet>) -> Self {
        let mut set = HeightVoteSet {
            chain_id,
            height,
            validators,
            round: 0,
            rounds: BTreeMap::new(),
        };
        set.ensure_round(0);
        set
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    /// Advance the current round, materializing its tallies.
    pub fn set_round(&mut self, round: u32) {
        self.round = round;
        self.ensure_round(round);
    }

    fn ensure_round(&mut self, round: u32) {
        let chain_id = &self.chain_id;
        let height = self.height;
        let validators = &self.validators;
        self.rounds.entry(round).or_insert_with(|| RoundVotes {
            prevotes: VoteSet::new(
                chain_id.clone(),
                height,
                round,
                VoteType::Prevote,
                validators.clone(),
            ),
            precommits: VoteSet::new(
                chain_id.clone(),
                height,
                round,
                VoteType::Precommit,
                validators.clone(),
            ),
        });
    }

    /// Add a vote for any round of this height.
    pub fn add_vote(
        &mut self,
        vote: Vote,
        cache: &SignatureCache,
    ) -> Result<AddVoteResult, VoteSetError> {
        if vote.height != self.height {
            return Err(VoteSetError::WrongHeight {
                got: vote.height,
                want: self.height,
            });
        }
        let round = vote.round;
        self.ensure_round(round);
        let entry = self.rounds.get_mut(&round).expect("just ensured");
        match vote.vote_type {
            VoteType::Prevote => entry.prevotes.add_vote(vote, cache),
            VoteType::Precommit => entry.precommits.add_vote(vote, cache),
        }
    }

    pub fn prevotes(&self, round: u32) -> Option<&VoteSet> {
        self.rounds.get(&round).map(|r| &r.prevotes)
    }

    pub fn precommits(&self, round: u32) -> Option<&VoteSet> {
        self.rounds.get(&round).map(|r| &r.precommits)
    }

    /// The highest round with a +2/3 prevote majority for a block, with
    /// that block: the freshest proof of lock available.
    pub fn pol_info(&self) -> Option<(u32, BlockId)> {
        self.rounds
            .iter()
            .rev()
            .find_map(|(round, votes)| match votes.prevotes.two_thirds_majority() {
                Some(Some(block_id)) => Some((*round, block_id)),
                _ => None,
            })
    }
}
