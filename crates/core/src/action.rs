//! Action types for the deterministic state machine.

use crate::{Event, OutboundMessage, TimeoutStep};
use palisade_types::{Block, BlockId, Commit, Evidence, VoteType};
use std::time::Duration;

/// Actions the state machine wants to perform.
///
/// Actions are **commands** - they describe something to do.
/// The runner executes actions and may convert results back into events.
#[derive(Debug, Clone)]
pub enum Action {
    // ═══════════════════════════════════════════════════════════════════
    // Network
    // ═══════════════════════════════════════════════════════════════════
    /// Broadcast a message to all peers.
    ///
    /// The gossip layer is an authenticated best-effort bus; delivery
    /// order is only guaranteed per peer.
    Broadcast { message: OutboundMessage },

    // ═══════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════
    /// Schedule a step timeout. Fires as
    /// [`Event::TimeoutElapsed`](crate::Event::TimeoutElapsed) with the
    /// same coordinates.
    ScheduleTimeout {
        height: u64,
        round: u32,
        step: TimeoutStep,
        duration: Duration,
    },

    // ═══════════════════════════════════════════════════════════════════
    // Internal (fed back as events with Internal priority)
    // ═══════════════════════════════════════════════════════════════════
    /// Enqueue an internal event for immediate processing.
    ///
    /// Internal events are processed at the same timestamp with higher
    /// priority than external events, preserving causality.
    EnqueueInternal { event: Event },

    // ═══════════════════════════════════════════════════════════════════
    // Storage
    // ═══════════════════════════════════════════════════════════════════
    /// Persist a committed block and its commit.
    ///
    /// Must be durable before the state machine treats the height as
    /// committed; the runner executes actions in order before delivering
    /// the next event.
    PersistBlock { block: Box<Block>, commit: Commit },

    /// Persist our own vote before broadcasting it.
    ///
    /// After a crash/restart, we must remember what we voted for to
    /// prevent equivocation (signing a conflicting vote at the same
    /// height/round). The runner handles this action synchronously.
    PersistOwnVote {
        height: u64,
        round: u32,
        vote_type: VoteType,
        block_id: Option<BlockId>,
    },

    /// Persist verified evidence so it survives restarts until included.
    PersistEvidence { evidence: Evidence },

    /// Drop blocks below `retain_height` (the application's answer from
    /// `Commit`).
    PruneBlocks { retain_height: u64 },

    // ═══════════════════════════════════════════════════════════════════
    // External Notifications
    // ═══════════════════════════════════════════════════════════════════
    /// Emit a committed block for external observers.
    EmitCommittedBlock { block: Box<Block> },
}

impl Action {
    /// Get the action type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::Broadcast { .. } => "Broadcast",
            Action::ScheduleTimeout { .. } => "ScheduleTimeout",
            Action::EnqueueInternal { .. } => "EnqueueInternal",
            Action::PersistBlock { .. } => "PersistBlock",
            Action::PersistOwnVote { .. } => "PersistOwnVote",
            Action::PersistEvidence { .. } => "PersistEvidence",
            Action::PruneBlocks { .. } => "PruneBlocks",
            Action::EmitCommittedBlock { .. } => "EmitCommittedBlock",
        }
    }
}
