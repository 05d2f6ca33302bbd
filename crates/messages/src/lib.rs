//! Network messages for the consensus protocol.
//!
//! Each struct here is one gossip payload. The transport framing (channel
//! id, type tag, length-delimited payload) lives with the runner; these
//! types only define content and its canonical encoding.

mod gossip;

pub use gossip::{
    BlockPartGossip, EvidenceGossip, HasVoteGossip, NewRoundStepGossip, ProposalGossip,
    TransactionGossip, VoteGossip,
};
