//! Outbound message types for network communication.

use palisade_messages::{
    BlockPartGossip, EvidenceGossip, HasVoteGossip, NewRoundStepGossip, ProposalGossip,
    TransactionGossip, VoteGossip,
};

/// Outbound network messages.
///
/// These are the messages that a node can send to other nodes.
/// The runner handles the actual network I/O.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    // ═══════════════════════════════════════════════════════════════════
    // Consensus Messages
    // ═══════════════════════════════════════════════════════════════════
    /// Signed proposal for the round.
    Proposal(ProposalGossip),

    /// One chunk of the proposed block.
    BlockPart(BlockPartGossip),

    /// Prevote or precommit.
    Vote(VoteGossip),

    /// Round-step announcement on the state channel.
    NewRoundStep(NewRoundStepGossip),

    /// Vote-possession announcement on the state channel.
    HasVote(HasVoteGossip),

    // ═══════════════════════════════════════════════════════════════════
    // Evidence Messages
    // ═══════════════════════════════════════════════════════════════════
    /// Verified misbehavior evidence.
    Evidence(EvidenceGossip),

    // ═══════════════════════════════════════════════════════════════════
    // Mempool Messages
    // ═══════════════════════════════════════════════════════════════════
    /// Transaction gossip.
    Transaction(TransactionGossip),
}

impl OutboundMessage {
    /// Get a human-readable name for this message type.
    pub fn type_name(&self) -> &'static str {
        match self {
            OutboundMessage::Proposal(_) => "Proposal",
            OutboundMessage::BlockPart(_) => "BlockPart",
            OutboundMessage::Vote(_) => "Vote",
            OutboundMessage::NewRoundStep(_) => "NewRoundStep",
            OutboundMessage::HasVote(_) => "HasVote",
            OutboundMessage::Evidence(_) => "Evidence",
            OutboundMessage::Transaction(_) => "Transaction",
        }
    }
}
