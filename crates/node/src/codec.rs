//! Message encoding and decoding for network transport.
//!
//! # Wire Format
//!
//! ```text
//! [version: u8][type tag: u8][payload: canonical encoding]
//! ```
//!
//! Each message also belongs to a channel (a `u8` id) used by the
//! transport for per-channel flow control; [`channel_for_message`] maps
//! outbound messages to their channel.

use palisade_core::{Event, OutboundMessage};
use palisade_messages::{
    BlockPartGossip, EvidenceGossip, HasVoteGossip, NewRoundStepGossip, ProposalGossip,
    TransactionGossip, VoteGossip,
};
use palisade_types::wire::{WireDecode, WireEncode};
use thiserror::Error;

/// Current wire format version.
pub const WIRE_VERSION: u8 = 1;

/// Transport channel ids.
pub mod channel {
    /// Round-step and vote-possession announcements.
    pub const STATE: u8 = 0x20;
    /// Proposals and block parts.
    pub const DATA: u8 = 0x21;
    /// Prevotes and precommits.
    pub const VOTE: u8 = 0x22;
    /// Reserved for vote-set bit arrays.
    pub const VOTE_SET_BITS: u8 = 0x23;
    /// Transactions.
    pub const MEMPOOL: u8 = 0x30;
    /// Misbehavior evidence.
    pub const EVIDENCE: u8 = 0x38;
}

mod tag {
    pub const PROPOSAL: u8 = 1;
    pub const BLOCK_PART: u8 = 2;
    pub const VOTE: u8 = 3;
    pub const EVIDENCE: u8 = 4;
    pub const TRANSACTION: u8 = 5;
    pub const NEW_ROUND_STEP: u8 = 6;
    pub const HAS_VOTE: u8 = 7;
}

/// Errors that can occur during message encoding/decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unknown wire version: {0}")]
    UnknownVersion(u8),

    #[error("message too short")]
    MessageTooShort,

    #[error("unknown message tag: {0}")]
    UnknownTag(u8),

    #[error("payload decode error: {0}")]
    Payload(#[from] palisade_types::wire::WireError),
}

/// The transport channel an outbound message rides on.
pub fn channel_for_message(message: &OutboundMessage) -> u8 {
    match message {
        OutboundMessage::Proposal(_) | OutboundMessage::BlockPart(_) => channel::DATA,
        OutboundMessage::Vote(_) => channel::VOTE,
        OutboundMessage::NewRoundStep(_) | OutboundMessage::HasVote(_) => channel::STATE,
        OutboundMessage::Evidence(_) => channel::EVIDENCE,
        OutboundMessage::Transaction(_) => channel::MEMPOOL,
    }
}

/// Encode an outbound message to wire format.
pub fn encode_wire_message(message: &OutboundMessage) -> Vec<u8> {
    let (tag, payload) = match message {
        OutboundMessage::Proposal(g) => (tag::PROPOSAL, g.encode()),
        OutboundMessage::BlockPart(g) => (tag::BLOCK_PART, g.encode()),
        OutboundMessage::Vote(g) => (tag::VOTE, g.encode()),
        OutboundMessage::Evidence(g) => (tag::EVIDENCE, g.encode()),
        OutboundMessage::Transaction(g) => (tag::TRANSACTION, g.encode()),
        OutboundMessage::NewRoundStep(g) => (tag::NEW_ROUND_STEP, g.encode()),
        OutboundMessage::HasVote(g) => (tag::HAS_VOTE, g.encode()),
    };
    let mut bytes = Vec::with_capacity(2 + payload.len());
    bytes.push(WIRE_VERSION);
    bytes.push(tag);
    bytes.extend(payload);
    bytes
}

/// Decode a wire message into the event the state machine consumes.
///
/// State-channel announcements decode to `None`: they inform the gossip
/// layer, not consensus.
pub fn decode_wire_message(data: &[u8]) -> Result<Option<Event>, CodecError> {
    if data.len() < 2 {
        return Err(CodecError::MessageTooShort);
    }
    if data[0] != WIRE_VERSION {
        return Err(CodecError::UnknownVersion(data[0]));
    }
    let payload = &data[2..];
    match data[1] {
        tag::PROPOSAL => {
            let gossip = ProposalGossip::decode(payload)?;
            Ok(Some(Event::ProposalReceived {
                proposal: gossip.proposal,
            }))
        }
        tag::BLOCK_PART => {
            let gossip = BlockPartGossip::decode(payload)?;
            Ok(Some(Event::BlockPartReceived {
                height: gossip.height,
                round: gossip.round,
                part: gossip.part,
            }))
        }
        tag::VOTE => {
            let gossip = VoteGossip::decode(payload)?;
            Ok(Some(Event::VoteReceived { vote: gossip.vote }))
        }
        tag::EVIDENCE => {
            let gossip = EvidenceGossip::decode(payload)?;
            Ok(Some(Event::EvidenceReceived {
                evidence: gossip.evidence,
            }))
        }
        tag::TRANSACTION => {
            let gossip = TransactionGossip::decode(payload)?;
            Ok(Some(Event::TransactionReceived { tx: gossip.tx }))
        }
        tag::NEW_ROUND_STEP => {
            NewRoundStepGossip::decode(payload)?;
            Ok(None)
        }
        tag::HAS_VOTE => {
            HasVoteGossip::decode(payload)?;
            Ok(None)
        }
        other => Err(CodecError::UnknownTag(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_types::test_utils::test_keypair;
    use palisade_types::{BlockId, Hash, PartSetHeader, Proposal, Signature, Time, Tx, Vote, VoteType};

    fn test_block_id() -> BlockId {
        BlockId {
            hash: Hash::sum(b"codec-block"),
            part_set_header: PartSetHeader {
                total: 1,
                hash: Hash::sum(b"codec-parts"),
            },
        }
    }

    #[test]
    fn proposal_round_trips_to_the_data_channel() {
        let kp = test_keypair(1);
        let mut proposal = Proposal {
            height: 4,
            round: 1,
            pol_round: None,
            block_id: test_block_id(),
            timestamp: Time::from_millis(9),
            signature: Signature::zero(),
        };
        proposal.signature = kp.sign(&proposal.sign_bytes("codec-test"));
        let message = OutboundMessage::Proposal(ProposalGossip {
            proposal: proposal.clone(),
        });

        assert_eq!(channel_for_message(&message), channel::DATA);
        let bytes = encode_wire_message(&message);
        assert_eq!(bytes[0], WIRE_VERSION);

        match decode_wire_message(&bytes).unwrap() {
            Some(Event::ProposalReceived { proposal: decoded }) => {
                assert_eq!(decoded, proposal)
            }
            other => panic!("unexpected decode {other:?}"),
        }
    }

    #[test]
    fn vote_round_trips_to_the_vote_channel() {
        let kp = test_keypair(2);
        let mut vote = Vote {
            vote_type: VoteType::Precommit,
            height: 6,
            round: 0,
            block_id: Some(test_block_id()),
            timestamp: Time::from_millis(11),
            validator_address: kp.address(),
            validator_index: 2,
            signature: Signature::zero(),
            extension: Vec::new(),
            extension_signature: None,
        };
        vote.signature = kp.sign(&vote.sign_bytes("codec-test"));
        let message = OutboundMessage::Vote(VoteGossip { vote: vote.clone() });

        assert_eq!(channel_for_message(&message), channel::VOTE);
        match decode_wire_message(&encode_wire_message(&message)).unwrap() {
            Some(Event::VoteReceived { vote: decoded }) => assert_eq!(decoded, vote),
            other => panic!("unexpected decode {other:?}"),
        }
    }

    #[test]
    fn transaction_rides_the_mempool_channel() {
        let message = OutboundMessage::Transaction(TransactionGossip {
            tx: Tx(b"a=b".to_vec()),
        });
        assert_eq!(channel_for_message(&message), channel::MEMPOOL);
        assert!(matches!(
            decode_wire_message(&encode_wire_message(&message)).unwrap(),
            Some(Event::TransactionReceived { .. })
        ));
    }

    #[test]
    fn state_channel_messages_decode_to_none() {
        let message = OutboundMessage::NewRoundStep(NewRoundStepGossip {
            height: 3,
            round: 0,
            step: 2,
        });
        assert_eq!(channel_for_message(&message), channel::STATE);
        assert!(decode_wire_message(&encode_wire_message(&message))
            .unwrap()
            .is_none());
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(matches!(
            decode_wire_message(&[]),
            Err(CodecError::MessageTooShort)
        ));
        assert!(matches!(
            decode_wire_message(&[9, 1, 0, 0]),
            Err(CodecError::UnknownVersion(9))
        ));
        assert!(matches!(
            decode_wire_message(&[WIRE_VERSION, 99, 0]),
            Err(CodecError::UnknownTag(99))
        ));
        // Truncated payload.
        let message = OutboundMessage::Transaction(TransactionGossip {
            tx: Tx(b"abcdef=1".to_vec()),
        });
        let bytes = encode_wire_message(&message);
        assert!(decode_wire_message(&bytes[..bytes.len() - 2]).is_err());
    }
}
