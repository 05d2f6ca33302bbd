//! The application trait.

use crate::types::*;
use palisade_types::Tx;

/// A deterministic application driven by consensus.
///
/// Calls arrive in a fixed order per block lifecycle:
///
/// 1. `prepare_proposal`: proposer only; may add, drop, or reorder
///    transactions within the byte budget
/// 2. `process_proposal`: every validator; `Reject` causes a nil prevote
/// 3. `extend_vote` / `verify_vote_extension`: only at heights where
///    extensions are enabled
/// 4. `finalize_block`: exactly once per committed block
/// 5. `commit`: persist; after it returns, the height is final for the
///    application
///
/// `check_tx` runs outside the block lifecycle, on mempool admission and
/// recheck. All methods must be deterministic in their effect on consensus
/// state; `check_tx` and `query` may consult local-only state.
pub trait Application: Send {
    fn info(&self) -> InfoResponse;

    fn init_chain(&mut self, req: InitChainRequest) -> InitChainResponse;

    fn check_tx(&mut self, tx: &Tx, kind: CheckTxKind) -> CheckTxResponse;

    fn prepare_proposal(&mut self, req: PrepareProposalRequest) -> Vec<Tx>;

    fn process_proposal(&mut self, req: ProcessProposalRequest) -> ProposalStatus;

    /// Produce this node's vote extension for a precommit. Default: none.
    fn extend_vote(&mut self, _req: ExtendVoteRequest) -> Vec<u8> {
        Vec::new()
    }

    /// Validate a peer's vote extension. Default: only the empty
    /// extension is acceptable.
    fn verify_vote_extension(&mut self, req: VerifyVoteExtensionRequest) -> bool {
        req.extension.is_empty()
    }

    fn finalize_block(&mut self, req: FinalizeBlockRequest) -> FinalizeBlockResponse;

    fn commit(&mut self) -> CommitResponse;

    fn query(&self, req: QueryRequest) -> QueryResponse;
}
