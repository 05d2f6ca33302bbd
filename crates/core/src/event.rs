//! Event types for the deterministic state machine.

use crate::TimeoutStep;
use palisade_types::{Block, Commit, Evidence, Part, Proposal, Tx, Vote};

/// Priority levels for event ordering within the same timestamp.
///
/// Events at the same simulation time are processed in priority order.
/// Lower values = higher priority (processed first).
///
/// This ensures causality is preserved: internal events (consequences of
/// processing an event) are handled before new external inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EventPriority {
    /// Internal events: consequences of prior event processing.
    /// Processed first to maintain causality.
    Internal = 0,

    /// Timer events: scheduled by the node itself.
    Timer = 1,

    /// Network events: external inputs from other nodes.
    Network = 2,

    /// Client events: external inputs from users.
    Client = 3,
}

/// All possible events a node can receive.
///
/// Events are **passive data** - they describe something that happened.
/// The state machine processes events and returns actions.
#[derive(Debug, Clone)]
pub enum Event {
    // ═══════════════════════════════════════════════════════════════════
    // Timers (priority: Timer)
    // ═══════════════════════════════════════════════════════════════════
    /// A scheduled step timeout fired. Stale coordinates are ignored by
    /// the state machine.
    TimeoutElapsed {
        height: u64,
        round: u32,
        step: TimeoutStep,
    },

    /// Periodic cleanup of stale state.
    CleanupTimer,

    // ═══════════════════════════════════════════════════════════════════
    // Network Messages (priority: Network)
    // ═══════════════════════════════════════════════════════════════════
    /// Received a proposal for the current height.
    ///
    /// Sender authenticity comes from the proposal signature, checked
    /// against the round's proposer.
    ProposalReceived { proposal: Proposal },

    /// Received one part of the proposed block.
    BlockPartReceived {
        height: u64,
        round: u32,
        part: Part,
    },

    /// Received a prevote or precommit.
    ///
    /// Sender identity comes from the vote's validator address and index;
    /// the signature is verified before the vote is counted.
    VoteReceived { vote: Vote },

    /// Received misbehavior evidence from a peer.
    EvidenceReceived { evidence: Evidence },

    /// Received a transaction via gossip.
    TransactionReceived { tx: Tx },

    // ═══════════════════════════════════════════════════════════════════
    // Internal Events (priority: Internal)
    // ═══════════════════════════════════════════════════════════════════
    /// A +2/3 precommit quorum decided this block and it has been made
    /// durable (the runner executes the preceding `PersistBlock` action
    /// before delivering this event). Applying it to the application and
    /// advancing the height happens here.
    BlockDecided { block: Box<Block>, commit: Commit },

    /// A block was committed and persisted.
    ///
    /// The full block is included so subsystems can process it: the
    /// mempool evicts committed transactions, the evidence pool marks
    /// included evidence, observers index the block.
    BlockCommitted { height: u64, block: Box<Block> },

    // ═══════════════════════════════════════════════════════════════════
    // Client Requests (priority: Client)
    // ═══════════════════════════════════════════════════════════════════
    /// Client submitted a transaction.
    SubmitTransaction { tx: Tx },
}

impl Event {
    /// Get the priority for this event type.
    ///
    /// Events at the same timestamp are processed in priority order,
    /// ensuring causality is preserved.
    pub fn priority(&self) -> EventPriority {
        match self {
            Event::BlockDecided { .. } | Event::BlockCommitted { .. } => EventPriority::Internal,

            Event::TimeoutElapsed { .. } | Event::CleanupTimer => EventPriority::Timer,

            Event::ProposalReceived { .. }
            | Event::BlockPartReceived { .. }
            | Event::VoteReceived { .. }
            | Event::EvidenceReceived { .. }
            | Event::TransactionReceived { .. } => EventPriority::Network,

            Event::SubmitTransaction { .. } => EventPriority::Client,
        }
    }

    /// Get the event type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::TimeoutElapsed { .. } => "TimeoutElapsed",
            Event::CleanupTimer => "CleanupTimer",
            Event::ProposalReceived { .. } => "ProposalReceived",
            Event::BlockPartReceived { .. } => "BlockPartReceived",
            Event::VoteReceived { .. } => "VoteReceived",
            Event::EvidenceReceived { .. } => "EvidenceReceived",
            Event::TransactionReceived { .. } => "TransactionReceived",
            Event::BlockDecided { .. } => "BlockDecided",
            Event::BlockCommitted { .. } => "BlockCommitted",
            Event::SubmitTransaction { .. } => "SubmitTransaction",
        }
    }
}
