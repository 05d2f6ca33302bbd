//! Consensus timing configuration.

use std::time::Duration;

/// Timeout schedule for the round steps.
///
/// Each timeout grows linearly with the round number, so repeated failed
/// rounds wait longer and eventually outlast any bounded network delay.
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// How long to wait for the proposer's block in round 0.
    pub timeout_propose: Duration,
    /// Added per round to the propose timeout.
    pub timeout_propose_delta: Duration,
    /// How long to wait for straggler prevotes after +2/3 arrived mixed.
    pub timeout_prevote: Duration,
    pub timeout_prevote_delta: Duration,
    /// How long to wait for straggler precommits after +2/3 arrived mixed.
    pub timeout_precommit: Duration,
    pub timeout_precommit_delta: Duration,
    /// Pause after a commit before starting the next height, giving slow
    /// validators a chance to land in the next block's commit.
    pub timeout_commit: Duration,
    /// Propose blocks even when the mempool is empty.
    pub create_empty_blocks: bool,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig {
            timeout_propose: Duration::from_millis(3_000),
            timeout_propose_delta: Duration::from_millis(500),
            timeout_prevote: Duration::from_millis(1_000),
            timeout_prevote_delta: Duration::from_millis(500),
            timeout_precommit: Duration::from_millis(1_000),
            timeout_precommit_delta: Duration::from_millis(500),
            timeout_commit: Duration::from_millis(1_000),
            create_empty_blocks: true,
        }
    }
}

impl ConsensusConfig {
    /// Short timeouts for tests and simulation.
    pub fn fast() -> Self {
        ConsensusConfig {
            timeout_propose: Duration::from_millis(300),
            timeout_propose_delta: Duration::from_millis(50),
            timeout_prevote: Duration::from_millis(100),
            timeout_prevote_delta: Duration::from_millis(50),
            timeout_precommit: Duration::from_millis(100),
            timeout_precommit_delta: Duration::from_millis(50),
            timeout_commit: Duration::from_millis(50),
            create_empty_blocks: true,
        }
    }

    pub fn propose_timeout(&self, round: u32) -> Duration {
        self.timeout_propose + self.timeout_propose_delta * round
    }

    pub fn prevote_timeout(&self, round: u32) -> Duration {
        self.timeout_prevote + self.timeout_prevote_delta * round
    }

    pub fn precommit_timeout(&self, round: u32) -> Duration {
        self.timeout_precommit + self.timeout_precommit_delta * round
    }
}
