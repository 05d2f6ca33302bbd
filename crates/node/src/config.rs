//! Node configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level node configuration, loaded from `config.json` in the home
/// directory. Every field has a default so a missing file means a
/// default node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Data directory for the store.
    pub db_dir: String,
    /// Genesis file path, relative to home unless absolute.
    pub genesis_file: String,
    /// Validator key file (32-byte hex seed); absent means observer mode.
    pub validator_key_file: Option<String>,
    /// Bound of the inbound event queue.
    pub event_queue_size: usize,
    /// Consensus timeouts in milliseconds.
    pub timeout_propose_ms: u64,
    pub timeout_propose_delta_ms: u64,
    pub timeout_prevote_ms: u64,
    pub timeout_prevote_delta_ms: u64,
    pub timeout_precommit_ms: u64,
    pub timeout_precommit_delta_ms: u64,
    pub timeout_commit_ms: u64,
    /// Mempool caps.
    pub mempool_max_txs: usize,
    pub mempool_max_bytes: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            db_dir: "data".to_string(),
            genesis_file: "genesis.json".to_string(),
            validator_key_file: Some("validator_key".to_string()),
            event_queue_size: 10_000,
            timeout_propose_ms: 3_000,
            timeout_propose_delta_ms: 500,
            timeout_prevote_ms: 1_000,
            timeout_prevote_delta_ms: 500,
            timeout_precommit_ms: 1_000,
            timeout_precommit_delta_ms: 500,
            timeout_commit_ms: 1_000,
            mempool_max_txs: 5_000,
            mempool_max_bytes: 64 * 1024 * 1024,
        }
    }
}

impl NodeConfig {
    /// Load `config.json` from the home directory; defaults when absent.
    pub fn load(home: &Path) -> Result<Self, crate::NodeError> {
        let path = home.join("config.json");
        if !path.exists() {
            return Ok(NodeConfig::default());
        }
        let text = std::fs::read_to_string(&path)?;
        serde_json::from_str(&text)
            .map_err(|e| crate::NodeError::Config(format!("{}: {e}", path.display())))
    }

    pub fn db_path(&self, home: &Path) -> PathBuf {
        home.join(&self.db_dir)
    }

    pub fn genesis_path(&self, home: &Path) -> PathBuf {
        let p = PathBuf::from(&self.genesis_file);
        if p.is_absolute() {
            p
        } else {
            home.join(p)
        }
    }

    pub fn validator_key_path(&self, home: &Path) -> Option<PathBuf> {
        self.validator_key_file.as_ref().map(|f| {
            let p = PathBuf::from(f);
            if p.is_absolute() {
                p
            } else {
                home.join(p)
            }
        })
    }

    pub fn consensus_config(&self) -> palisade_consensus::ConsensusConfig {
        use std::time::Duration;
        palisade_consensus::ConsensusConfig {
            timeout_propose: Duration::from_millis(self.timeout_propose_ms),
            timeout_propose_delta: Duration::from_millis(self.timeout_propose_delta_ms),
            timeout_prevote: Duration::from_millis(self.timeout_prevote_ms),
            timeout_prevote_delta: Duration::from_millis(self.timeout_prevote_delta_ms),
            timeout_precommit: Duration::from_millis(self.timeout_precommit_ms),
            timeout_precommit_delta: Duration::from_millis(self.timeout_precommit_delta_ms),
            timeout_commit: Duration::from_millis(self.timeout_commit_ms),
            create_empty_blocks: true,
        }
    }

    pub fn mempool_config(&self) -> palisade_mempool::MempoolConfig {
        palisade_mempool::MempoolConfig {
            max_txs: self.mempool_max_txs,
            max_bytes: self.mempool_max_bytes,
            recheck: true,
        }
    }
}
