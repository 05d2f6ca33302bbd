//! Request and response types for the application interface.

use palisade_types::merkle::ProofOp;
use palisade_types::{Address, ConsensusParams, Hash, Time, Tx, ValidatorUpdate};

/// The response code meaning success; anything else is a rejection.
pub const CODE_OK: u32 = 0;

/// Why `check_tx` is being called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckTxKind {
    /// First admission of a new transaction.
    New,
    /// Re-validation of a pooled transaction after a block committed.
    Recheck,
}

#[derive(Debug, Clone)]
pub struct CheckTxResponse {
    pub code: u32,
    pub log: String,
    /// Mempool lane for this transaction; `None` means the default lane.
    pub lane: Option<String>,
}

impl CheckTxResponse {
    pub fn ok() -> Self {
        CheckTxResponse {
            code: CODE_OK,
            log: String::new(),
            lane: None,
        }
    }

    pub fn error(code: u32, log: impl Into<String>) -> Self {
        CheckTxResponse {
            code,
            log: log.into(),
            lane: None,
        }
    }

    pub fn with_lane(mut self, lane: impl Into<String>) -> Self {
        self.lane = Some(lane.into());
        self
    }

    pub fn is_ok(&self) -> bool {
        self.code == CODE_OK
    }
}

#[derive(Debug, Clone, Default)]
pub struct InfoResponse {
    pub data: String,
    pub version: String,
    /// Last height the application has durably committed.
    pub last_block_height: u64,
    pub last_block_app_hash: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct InitChainRequest {
    pub chain_id: String,
    pub initial_height: u64,
    pub time: Time,
    pub validators: Vec<ValidatorUpdate>,
    pub app_state: serde_json::Value,
    pub consensus_params: ConsensusParams,
}

#[derive(Debug, Clone, Default)]
pub struct InitChainResponse {
    /// Replacement genesis validator set; empty means accept the genesis
    /// set unchanged.
    pub validators: Vec<ValidatorUpdate>,
    pub app_hash: Vec<u8>,
    pub consensus_params: Option<ConsensusParams>,
}

/// One validator's participation in the previous commit.
#[derive(Debug, Clone)]
pub struct VoteInfo {
    pub validator_address: Address,
    pub power: i64,
    pub signed: bool,
    /// Vote extension from the precommit; empty when extensions are
    /// disabled or the validator abstained.
    pub extension: Vec<u8>,
}

/// The previous commit, as seen by this node.
#[derive(Debug, Clone)]
pub struct CommitInfo {
    pub round: u32,
    pub votes: Vec<VoteInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MisbehaviorKind {
    DuplicateVote,
    LightClientAttack,
}

/// Evidence of misbehavior, translated for the application.
#[derive(Debug, Clone)]
pub struct Misbehavior {
    pub kind: MisbehaviorKind,
    pub validator_address: Address,
    pub height: u64,
    pub time: Time,
    pub total_voting_power: i64,
}

#[derive(Debug, Clone)]
pub struct PrepareProposalRequest {
    pub height: u64,
    pub time: Time,
    /// Candidate transactions from the mempool, in reap order.
    pub txs: Vec<Tx>,
    /// Byte budget; the returned list must fit.
    pub max_tx_bytes: i64,
    pub local_last_commit: Option<CommitInfo>,
    pub misbehavior: Vec<Misbehavior>,
    pub proposer_address: Address,
}

#[derive(Debug, Clone)]
pub struct ProcessProposalRequest {
    pub height: u64,
    pub time: Time,
    pub hash: Hash,
    pub txs: Vec<Tx>,
    pub proposed_last_commit: Option<CommitInfo>,
    pub misbehavior: Vec<Misbehavior>,
    pub proposer_address: Address,
}

/// Verdict on a proposed block. `Reject` makes the validator prevote nil.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalStatus {
    Accept,
    Reject,
}

#[derive(Debug, Clone)]
pub struct ExtendVoteRequest {
    pub height: u64,
    pub round: u32,
    pub hash: Hash,
}

#[derive(Debug, Clone)]
pub struct VerifyVoteExtensionRequest {
    pub height: u64,
    pub round: u32,
    pub validator_address: Address,
    pub hash: Hash,
    pub extension: Vec<u8>,
}

/// A structured event emitted by transaction execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppEvent {
    pub kind: String,
    pub attributes: Vec<(String, String)>,
}

/// Result of executing one transaction.
#[derive(Debug, Clone)]
pub struct TxResult {
    pub code: u32,
    pub data: Vec<u8>,
    pub log: String,
    pub gas_used: i64,
    pub events: Vec<AppEvent>,
}

impl TxResult {
    pub fn ok() -> Self {
        TxResult {
            code: CODE_OK,
            data: Vec::new(),
            log: String::new(),
            gas_used: 0,
            events: Vec::new(),
        }
    }

    pub fn error(code: u32, log: impl Into<String>) -> Self {
        TxResult {
            code,
            data: Vec::new(),
            log: log.into(),
            gas_used: 0,
            events: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == CODE_OK
    }

    /// Canonical bytes hashed into the header's `last_results_hash`.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        use palisade_types::wire;
        let mut out = Vec::new();
        wire::write_uvarint(&mut out, u64::from(self.code));
        wire::write_bytes(&mut out, &self.data);
        wire::write_svarint(&mut out, self.gas_used);
        out
    }
}

#[derive(Debug, Clone)]
pub struct FinalizeBlockRequest {
    pub height: u64,
    pub time: Time,
    pub hash: Hash,
    pub txs: Vec<Tx>,
    pub decided_last_commit: Option<CommitInfo>,
    pub misbehavior: Vec<Misbehavior>,
    pub proposer_address: Address,
}

#[derive(Debug, Clone, Default)]
pub struct FinalizeBlockResponse {
    pub tx_results: Vec<TxResult>,
    /// Power diffs taking effect two heights later.
    pub validator_updates: Vec<ValidatorUpdate>,
    pub consensus_param_updates: Option<ConsensusParams>,
    pub app_hash: Vec<u8>,
    pub events: Vec<AppEvent>,
}

#[derive(Debug, Clone, Default)]
pub struct CommitResponse {
    /// Lowest height the application still needs; `0` retains everything.
    pub retain_height: u64,
}

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub path: String,
    pub data: Vec<u8>,
    pub height: u64,
    pub prove: bool,
}

#[derive(Debug, Clone, Default)]
pub struct QueryResponse {
    pub code: u32,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub height: u64,
    pub log: String,
    pub proof_ops: Vec<ProofOp>,
}
