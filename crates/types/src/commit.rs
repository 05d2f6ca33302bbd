//! Commits: the aggregated precommit signatures that finalize a block.

use crate::block::BlockId;
use crate::crypto::Signature;
use crate::hash::{Address, ADDRESS_SIZE};
use crate::merkle::hash_from_byte_slices;
use crate::time::Time;
use crate::validator::ValidatorSet;
use crate::vote::{canonical_vote_bytes, VoteType};
use crate::wire::{self, WireDecode, WireEncode, WireError};
use crate::Hash;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommitError {
    #[error("commit has no signatures")]
    Empty,

    #[error("commit height must be positive")]
    ZeroHeight,

    #[error(
        "commit signature count {got} does not match validator set size {want}"
    )]
    SignatureCountMismatch { got: usize, want: usize },

    #[error("commit is for height {commit_height}, header is at {header_height}")]
    WrongBlock {
        commit_height: u64,
        header_height: u64,
    },
}

/// One slot of a commit, in validator-set order for the commit's height.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitSig {
    /// The validator's precommit was not seen.
    Absent,
    /// The validator precommitted nil.
    Nil {
        validator_address: Address,
        timestamp: Time,
        signature: Signature,
    },
    /// The validator precommitted the committed block.
    Commit {
        validator_address: Address,
        timestamp: Time,
        signature: Signature,
    },
}

impl CommitSig {
    pub fn is_commit(&self) -> bool {
        matches!(self, CommitSig::Commit { .. })
    }

    pub fn validator_address(&self) -> Option<Address> {
        match self {
            CommitSig::Absent => None,
            CommitSig::Nil {
                validator_address, ..
            }
            | CommitSig::Commit {
                validator_address, ..
            } => Some(*validator_address),
        }
    }

    fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }
}

impl WireEncode for CommitSig {
    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            CommitSig::Absent => out.push(0),
            CommitSig::Nil {
                validator_address,
                timestamp,
                signature,
            } => {
                out.push(1);
                wire::write_fixed(out, validator_address.as_bytes());
                wire::write_uvarint(out, timestamp.as_millis());
                wire::write_bytes(out, signature.as_bytes());
            }
            CommitSig::Commit {
                validator_address,
                timestamp,
                signature,
            } => {
                out.push(2);
                wire::write_fixed(out, validator_address.as_bytes());
                wire::write_uvarint(out, timestamp.as_millis());
                wire::write_bytes(out, signature.as_bytes());
            }
        }
    }
}

impl WireDecode for CommitSig {
    fn decode_from(input: &mut &[u8]) -> Result<Self, WireError> {
        let tag = wire::take(input, 1)?[0];
        match tag {
            0 => Ok(CommitSig::Absent),
            1 | 2 => {
                let validator_address =
                    Address::from_bytes(wire::read_fixed::<ADDRESS_SIZE>(input)?);
                let timestamp = Time::from_millis(wire::read_uvarint(input)?);
                let signature = Signature::from_slice(&wire::read_bytes(input)?)
                    .map_err(|_| WireError::LengthOverflow)?;
                if tag == 1 {
                    Ok(CommitSig::Nil {
                        validator_address,
                        timestamp,
                        signature,
                    })
                } else {
                    Ok(CommitSig::Commit {
                        validator_address,
                        timestamp,
                        signature,
                    })
                }
            }
            other => Err(WireError::InvalidDiscriminant(u64::from(other))),
        }
    }
}

/// The +2/3 precommit evidence for one committed block.
///
/// `signatures[i]` belongs to validator `i` of the validator set at
/// `height`; order is part of the hashed content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub height: u64,
    pub round: u32,
    pub block_id: BlockId,
    pub signatures: Vec<CommitSig>,
}

impl Commit {
    /// Merkle root over the canonical signature slots; pinned by the next
    /// header's `last_commit_hash`.
    pub fn hash(&self) -> Hash {
        let items: Vec<Vec<u8>> = self.signatures.iter().map(|s| s.canonical_bytes()).collect();
        hash_from_byte_slices(&items)
    }

    /// Reconstruct the canonical vote bytes slot `index` signed.
    ///
    /// `None` for absent slots. Nil slots sign a nil block id; commit slots
    /// sign this commit's block id. Each slot keeps its own timestamp.
    pub fn vote_sign_bytes(&self, chain_id: &str, index: usize) -> Option<Vec<u8>> {
        match self.signatures.get(index)? {
            CommitSig::Absent => None,
            CommitSig::Nil { timestamp, .. } => Some(canonical_vote_bytes(
                VoteType::Precommit,
                self.height,
                self.round,
                &None,
                *timestamp,
                chain_id,
            )),
            CommitSig::Commit { timestamp, .. } => Some(canonical_vote_bytes(
                VoteType::Precommit,
                self.height,
                self.round,
                &Some(self.block_id),
                *timestamp,
                chain_id,
            )),
        }
    }

    pub fn validate_basic(&self) -> Result<(), CommitError> {
        if self.height == 0 {
            return Err(CommitError::ZeroHeight);
        }
        if self.signatures.is_empty() {
            return Err(CommitError::Empty);
        }
        Ok(())
    }

    /// The weighted median of commit timestamps, by voting power of the
    /// committing validators.
    ///
    /// This is the time carried into the next block's header: no single
    /// proposer clock can skew it beyond what a third of the power is
    /// willing to sign.
    pub fn median_time(&self, vals: &ValidatorSet) -> Time {
        let mut weighted: Vec<(u64, i64)> = Vec::with_capacity(self.signatures.len());
        let mut total_power: i64 = 0;
        for sig in &self.signatures {
            if let CommitSig::Commit {
                validator_address,
                timestamp,
                ..
            } = sig
            {
                if let Some((_, val)) = vals.get_by_address(validator_address) {
                    weighted.push((timestamp.as_millis(), val.voting_power));
                    total_power += val.voting_power;
                }
            }
        }
        if weighted.is_empty() {
            return Time::from_millis(0);
        }
        weighted.sort_by_key(|(ts, _)| *ts);
        let midpoint = (total_power + 1) / 2;
        let mut seen: i64 = 0;
        for (ts, power) in &weighted {
            seen += power;
            if seen >= midpoint {
                return Time::from_millis(*ts);
            }
        }
        // Unreachable: the loop covers the full power sum.
        Time::from_millis(weighted[weighted.len() - 1].0)
    }
}

impl WireEncode for Commit {
    fn encode_into(&self, out: &mut Vec<u8>) {
        wire::write_uvarint(out, self.height);
        wire::write_uvarint(out, u64::from(self.round));
        self.block_id.encode_into(out);
        wire::write_uvarint(out, self.signatures.len() as u64);
        for sig in &self.signatures {
            sig.encode_into(out);
        }
    }
}

impl WireDecode for Commit {
    fn decode_from(input: &mut &[u8]) -> Result<Self, WireError> {
        let height = wire::read_uvarint(input)?;
        let round = wire::read_uvarint(input)?;
        let round: u32 = round.try_into().map_err(|_| WireError::LengthOverflow)?;
        let block_id = BlockId::decode_from(input)?;
        let count = wire::read_uvarint(input)?;
        let count: usize = count.try_into().map_err(|_| WireError::LengthOverflow)?;
        if count > input.len() {
            return Err(WireError::LengthOverflow);
        }
        let mut signatures = Vec::with_capacity(count);
        for _ in 0..count {
            signatures.push(CommitSig::decode_from(input)?);
        }
        Ok(Commit {
            height,
            round,
            block_id,
            signatures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::part_set::PartSetHeader;
    use crate::test_utils::test_validator_set;
    use crate::validator::Validator;
    use crate::Keypair;

    fn test_block_id() -> BlockId {
        BlockId {
            hash: Hash::sum(b"block"),
            part_set_header: PartSetHeader {
                total: 2,
                hash: Hash::sum(b"parts"),
            },
        }
    }

    fn signed_commit_sig(kp: &Keypair, commit: &Commit, ts: Time, nil: bool) -> CommitSig {
        let block_id = if nil { None } else { Some(commit.block_id) };
        let bytes = canonical_vote_bytes(
            VoteType::Precommit,
            commit.height,
            commit.round,
            &block_id,
            ts,
            "test-chain",
        );
        let signature = kp.sign(&bytes);
        if nil {
            CommitSig::Nil {
                validator_address: kp.address(),
                timestamp: ts,
                signature,
            }
        } else {
            CommitSig::Commit {
                validator_address: kp.address(),
                timestamp: ts,
                signature,
            }
        }
    }

    #[test]
    fn hash_covers_every_slot() {
        let (keys, _) = test_validator_set(3, 10);
        let mut commit = Commit {
            height: 4,
            round: 0,
            block_id: test_block_id(),
            signatures: vec![],
        };
        commit.signatures = keys
            .iter()
            .map(|k| signed_commit_sig(k, &commit, Time::from_millis(100), false))
            .collect();

        let base = commit.hash();

        let mut absent = commit.clone();
        absent.signatures[1] = CommitSig::Absent;
        assert_ne!(base, absent.hash());

        let mut retimed = commit.clone();
        if let CommitSig::Commit { timestamp, .. } = &mut retimed.signatures[0] {
            *timestamp = Time::from_millis(101);
        }
        assert_ne!(base, retimed.hash());
    }

    #[test]
    fn vote_sign_bytes_match_live_votes() {
        let kp = Keypair::from_seed([3; 32]);
        let mut commit = Commit {
            height: 7,
            round: 1,
            block_id: test_block_id(),
            signatures: vec![],
        };
        commit.signatures = vec![
            signed_commit_sig(&kp, &commit, Time::from_millis(9), false),
            CommitSig::Absent,
        ];

        let bytes = commit.vote_sign_bytes("test-chain", 0).unwrap();
        let CommitSig::Commit { signature, .. } = &commit.signatures[0] else {
            unreachable!()
        };
        kp.public_key().verify(&bytes, signature).unwrap();

        assert!(commit.vote_sign_bytes("test-chain", 1).is_none());
        assert!(commit.vote_sign_bytes("test-chain", 2).is_none());
    }

    #[test]
    fn median_time_is_power_weighted() {
        let keys: Vec<Keypair> = (0..3u8).map(|i| Keypair::from_seed([i; 32])).collect();
        let vals = crate::ValidatorSet::new(vec![
            Validator::new(keys[0].public_key(), 10),
            Validator::new(keys[1].public_key(), 10),
            Validator::new(keys[2].public_key(), 80),
        ])
        .unwrap();

        let mut commit = Commit {
            height: 2,
            round: 0,
            block_id: test_block_id(),
            signatures: vec![],
        };
        let times = [100u64, 200, 900];
        commit.signatures = keys
            .iter()
            .zip(times)
            .map(|(k, t)| signed_commit_sig(k, &commit, Time::from_millis(t), false))
            .collect();

        // The 80-power validator's timestamp dominates the median.
        assert_eq!(commit.median_time(&vals), Time::from_millis(900));
    }

    #[test]
    fn median_time_equal_weights_picks_middle() {
        let (keys, vals) = test_validator_set(3, 10);
        let mut commit = Commit {
            height: 2,
            round: 0,
            block_id: test_block_id(),
            signatures: vec![],
        };
        let times = [50u64, 300, 100];
        commit.signatures = keys
            .iter()
            .zip(times)
            .map(|(k, t)| signed_commit_sig(k, &commit, Time::from_millis(t), false))
            .collect();
        assert_eq!(commit.median_time(&vals), Time::from_millis(100));
    }

    #[test]
    fn wire_round_trip() {
        let kp = Keypair::from_seed([5; 32]);
        let mut commit = Commit {
            height: 3,
            round: 2,
            block_id: test_block_id(),
            signatures: vec![],
        };
        commit.signatures = vec![
            CommitSig::Absent,
            signed_commit_sig(&kp, &commit, Time::from_millis(10), true),
            signed_commit_sig(&kp, &commit, Time::from_millis(11), false),
        ];
        let decoded = Commit::decode(&commit.encode()).unwrap();
        assert_eq!(commit, decoded);
        assert_eq!(commit.hash(), decoded.hash());
    }
}
