//! The application interface.
//!
//! Consensus drives a deterministic application through an ordered set of
//! calls per block: `prepare_proposal` on the proposer, `process_proposal`
//! on every validator, then `finalize_block` and `commit` exactly once per
//! committed height. `check_tx` gates mempool admission, `query` serves
//! reads, and vote extensions ride on precommits when enabled.
//!
//! The engine guarantees at-most-once delivery of the per-height calls in
//! steady state and records a durable cursor around `finalize_block` /
//! `commit` so a restart replays from the right call, never skipping or
//! double-applying a height (see [`BlockExecutor`]).

mod application;
mod executor;
pub mod kvstore;
mod types;

pub use application::Application;
pub use executor::{AbciCursor, BlockExecutor, CursorPhase, CursorStore, ExecutorError, MemCursorStore};
pub use types::{
    AppEvent, CheckTxKind, CheckTxResponse, CommitInfo, CommitResponse, ExtendVoteRequest,
    FinalizeBlockRequest, FinalizeBlockResponse, InfoResponse, InitChainRequest,
    InitChainResponse, Misbehavior, MisbehaviorKind, PrepareProposalRequest,
    ProcessProposalRequest, ProposalStatus, QueryRequest, QueryResponse, TxResult,
    VerifyVoteExtensionRequest, VoteInfo, CODE_OK,
};

/// A shared, lockable application handle.
///
/// Consensus and the mempool's check-tx path both call into the
/// application; access is serialized through this handle, never across an
/// application call boundary.
pub type SharedApplication = std::sync::Arc<parking_lot::Mutex<dyn Application>>;

/// Wrap an application for sharing.
pub fn share<A: Application + 'static>(app: A) -> SharedApplication {
    std::sync::Arc::new(parking_lot::Mutex::new(app))
}
