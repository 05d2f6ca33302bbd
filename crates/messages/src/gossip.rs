//! Gossip payloads.

use palisade_types::wire::{self, WireDecode, WireEncode, WireError};
use palisade_types::{Evidence, Part, Proposal, Tx, Vote, VoteType};

/// A signed proposal for the current (height, round).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposalGossip {
    pub proposal: Proposal,
}

impl WireEncode for ProposalGossip {
    fn encode_into(&self, out: &mut Vec<u8>) {
        self.proposal.encode_into(out);
    }
}

impl WireDecode for ProposalGossip {
    fn decode_from(input: &mut &[u8]) -> Result<Self, WireError> {
        Ok(ProposalGossip {
            proposal: Proposal::decode_from(input)?,
        })
    }
}

/// One chunk of the proposed block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPartGossip {
    pub height: u64,
    pub round: u32,
    pub part: Part,
}

impl WireEncode for BlockPartGossip {
    fn encode_into(&self, out: &mut Vec<u8>) {
        wire::write_uvarint(out, self.height);
        wire::write_uvarint(out, u64::from(self.round));
        self.part.encode_into(out);
    }
}

impl WireDecode for BlockPartGossip {
    fn decode_from(input: &mut &[u8]) -> Result<Self, WireError> {
        let height = wire::read_uvarint(input)?;
        let round = wire::read_uvarint(input)?;
        let round: u32 = round.try_into().map_err(|_| WireError::LengthOverflow)?;
        Ok(BlockPartGossip {
            height,
            round,
            part: Part::decode_from(input)?,
        })
    }
}

/// A prevote or precommit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteGossip {
    pub vote: Vote,
}

impl WireEncode for VoteGossip {
    fn encode_into(&self, out: &mut Vec<u8>) {
        self.vote.encode_into(out);
    }
}

impl WireDecode for VoteGossip {
    fn decode_from(input: &mut &[u8]) -> Result<Self, WireError> {
        Ok(VoteGossip {
            vote: Vote::decode_from(input)?,
        })
    }
}

/// Verified misbehavior evidence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceGossip {
    pub evidence: Evidence,
}

impl WireEncode for EvidenceGossip {
    fn encode_into(&self, out: &mut Vec<u8>) {
        self.evidence.encode_into(out);
    }
}

impl WireDecode for EvidenceGossip {
    fn decode_from(input: &mut &[u8]) -> Result<Self, WireError> {
        Ok(EvidenceGossip {
            evidence: Evidence::decode_from(input)?,
        })
    }
}

/// A transaction for the mempool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionGossip {
    pub tx: Tx,
}

impl WireEncode for TransactionGossip {
    fn encode_into(&self, out: &mut Vec<u8>) {
        wire::write_bytes(out, self.tx.as_bytes());
    }
}

impl WireDecode for TransactionGossip {
    fn decode_from(input: &mut &[u8]) -> Result<Self, WireError> {
        Ok(TransactionGossip {
            tx: Tx(wire::read_bytes(input)?),
        })
    }
}

/// Round-step announcement on the state channel, so peers know what this
/// node still needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRoundStepGossip {
    pub height: u64,
    pub round: u32,
    /// Ordinal of the sender's current step.
    pub step: u8,
}

impl WireEncode for NewRoundStepGossip {
    fn encode_into(&self, out: &mut Vec<u8>) {
        wire::write_uvarint(out, self.height);
        wire::write_uvarint(out, u64::from(self.round));
        out.push(self.step);
    }
}

impl WireDecode for NewRoundStepGossip {
    fn decode_from(input: &mut &[u8]) -> Result<Self, WireError> {
        let height = wire::read_uvarint(input)?;
        let round = wire::read_uvarint(input)?;
        let round: u32 = round.try_into().map_err(|_| WireError::LengthOverflow)?;
        let step = wire::take(input, 1)?[0];
        Ok(NewRoundStepGossip {
            height,
            round,
            step,
        })
    }
}

/// Tells peers this node already holds a given vote, so they can skip
/// re-sending it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HasVoteGossip {
    pub height: u64,
    pub round: u32,
    pub vote_type: VoteType,
    pub validator_index: u32,
}

impl WireEncode for HasVoteGossip {
    fn encode_into(&self, out: &mut Vec<u8>) {
        wire::write_uvarint(out, self.height);
        wire::write_uvarint(out, u64::from(self.round));
        out.push(self.vote_type.as_u8());
        wire::write_uvarint(out, u64::from(self.validator_index));
    }
}

impl WireDecode for HasVoteGossip {
    fn decode_from(input: &mut &[u8]) -> Result<Self, WireError> {
        let height = wire::read_uvarint(input)?;
        let round = wire::read_uvarint(input)?;
        let round: u32 = round.try_into().map_err(|_| WireError::LengthOverflow)?;
        let type_byte = wire::take(input, 1)?[0];
        let vote_type = VoteType::from_u8(type_byte)
            .ok_or(WireError::InvalidDiscriminant(u64::from(type_byte)))?;
        let index = wire::read_uvarint(input)?;
        let validator_index: u32 = index.try_into().map_err(|_| WireError::LengthOverflow)?;
        Ok(HasVoteGossip {
            height,
            round,
            vote_type,
            validator_index,
        })
    }
}
