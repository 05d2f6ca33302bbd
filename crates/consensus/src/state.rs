//! The consensus state machine.
//!
//! All state transitions for one height happen here, on one task,
//! consuming a serialized event stream. The flow of a round:
//!
//! 1. **Propose** → the round's proposer broadcasts a signed proposal and
//!    the block's parts; everyone else arms the propose timeout
//! 2. **Prevote** → with the full block in hand and the application's
//!    blessing, prevote it (subject to the lock rules); otherwise prevote
//!    nil
//! 3. **Precommit** → a +2/3 prevote quorum for a block locks it and
//!    precommits it; a nil quorum unlocks; anything else precommits nil
//! 4. **Commit** → a +2/3 precommit quorum for a block at *any* round
//!    decides the height: persist, run the application, advance
//!
//! Timeouts are scheduled events. A quorum arriving before its timeout
//! fires transitions immediately; the stale timeout is recognized by its
//! (height, round, step) coordinates and dropped.

use crate::chain::ChainState;
use crate::config::ConsensusConfig;
use crate::evidence_pool::EvidencePool;
use crate::vote_set::{AddVoteResult, HeightVoteSet};
use palisade_abci::{
    Application, BlockExecutor, CommitInfo, ExtendVoteRequest, FinalizeBlockRequest, Misbehavior,
    MisbehaviorKind, PrepareProposalRequest, ProcessProposalRequest, ProposalStatus,
    VerifyVoteExtensionRequest, VoteInfo,
};
use palisade_core::{Action, Event, OutboundMessage, StateMachine, TimeoutStep};
use palisade_mempool::{AddTxOutcome, MempoolState};
use palisade_messages::{
    BlockPartGossip, EvidenceGossip, ProposalGossip, TransactionGossip, VoteGossip,
};
use palisade_types::wire::{WireDecode, WireEncode};
use palisade_types::{
    Address, Block, BlockId, Commit, CommitSig, DuplicateVoteEvidence, Evidence, Hash, Keypair,
    Part, PartSet, Proposal, SignatureCache, Signature, Time, Tx, ValidatorSet, Vote, VoteType,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, trace, warn};

/// Cap on buffered events for rounds/heights we have not reached yet.
const MAX_BUFFERED_EVENTS: usize = 4_096;

/// The step within a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RoundStep {
    /// Between a commit and the first round of the next height.
    NewHeight,
    /// Transient marker while a round is being set up.
    NewRound,
    /// Waiting for the proposer's block.
    Propose,
    /// Prevote sent; collecting prevotes.
    Prevote,
    /// +2/3 prevotes seen without a winner; waiting for stragglers.
    PrevoteWait,
    /// Precommit sent; collecting precommits.
    Precommit,
    /// +2/3 precommits seen without a decision; waiting for stragglers.
    PrecommitWait,
    /// Decided; waiting for the block to be applied.
    Commit,
}

/// This node's signing identity. Absent on observer nodes.
pub struct PrivValidator {
    keypair: Keypair,
    address: Address,
}

impl PrivValidator {
    pub fn new(keypair: Keypair) -> Self {
        let address = keypair.address();
        PrivValidator { keypair, address }
    }

    pub fn address(&self) -> Address {
        self.address
    }
}

/// State restored from storage on startup.
///
/// For a fresh start from genesis, use `RecoveredState::default()`.
#[derive(Debug, Default)]
pub struct RecoveredState {
    /// Chain state as of the last committed block.
    pub chain: Option<ChainState>,
    /// The commit we observed for the last committed block; needed to
    /// build the next block's `last_commit`.
    pub last_commit: Option<Commit>,
    /// Our own signed votes, keyed by (height, round, type). Prevents
    /// equivocation after a crash between signing and delivery.
    pub own_votes: HashMap<(u64, u32, VoteType), Option<BlockId>>,
    /// Verified evidence that had not been included in a block yet.
    pub evidence: Vec<Evidence>,
}

/// Everything that resets per height, plus the per-round bookkeeping.
struct RoundState {
    height: u64,
    round: u32,
    step: RoundStep,
    /// The height's validator set advanced `round` rotation steps; its
    /// proposer is the current round's proposer.
    round_validators: ValidatorSet,
    proposal: Option<Proposal>,
    proposal_block: Option<Block>,
    proposal_block_parts: Option<PartSet>,
    /// Cached `process_proposal` verdict for the current proposal block.
    proposal_verdict: Option<bool>,
    locked_round: Option<u32>,
    locked_block: Option<Block>,
    valid_round: Option<u32>,
    valid_block: Option<Block>,
    votes: HeightVoteSet,
    commit_round: Option<u32>,
    sent_prevote: bool,
    sent_precommit: bool,
}

impl RoundState {
    fn new(height: u64, chain_id: &str, validators: Arc<ValidatorSet>) -> Self {
        RoundState {
            height,
            round: 0,
            step: RoundStep::NewHeight,
            round_validators: (*validators).clone(),
            proposal: None,
            proposal_block: None,
            proposal_block_parts: None,
            proposal_verdict: None,
            locked_round: None,
            locked_block: None,
            valid_round: None,
            valid_block: None,
            votes: HeightVoteSet::new(chain_id.to_string(), height, validators),
            commit_round: None,
            sent_prevote: false,
            sent_precommit: false,
        }
    }
}

/// The consensus state machine.
pub struct ConsensusState {
    config: ConsensusConfig,
    privval: Option<PrivValidator>,
    chain: ChainState,
    executor: BlockExecutor,
    mempool: Arc<Mutex<MempoolState>>,
    evidence: EvidencePool,
    cache: Arc<SignatureCache>,
    /// Validator set for the current height, shared with the vote sets.
    validators: Arc<ValidatorSet>,
    rs: RoundState,
    /// Commit observed for the last committed height.
    last_commit: Option<Commit>,
    /// Last height's precommit votes with extensions, for the proposer.
    last_extended_votes: Vec<VoteInfo>,
    /// Everything we ever signed, for restart equivocation protection.
    own_votes: HashMap<(u64, u32, VoteType), Option<BlockId>>,
    /// Events for rounds or the next height we have not entered yet.
    buffered: Vec<(u64, u32, Event)>,
    /// The incoming vote of a conflict being processed; paired with the
    /// stored vote to build equivocation evidence.
    pending_conflict: Option<Vote>,
    now: Duration,
}

impl std::fmt::Debug for ConsensusState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsensusState")
            .field("height", &self.rs.height)
            .field("round", &self.rs.round)
            .field("step", &self.rs.step)
            .field("validators", &self.validators.len())
            .field("locked", &self.rs.locked_round)
            .finish()
    }
}

impl ConsensusState {
    pub fn new(
        config: ConsensusConfig,
        genesis_chain: ChainState,
        privval: Option<PrivValidator>,
        executor: BlockExecutor,
        mempool: Arc<Mutex<MempoolState>>,
        cache: Arc<SignatureCache>,
        recovered: RecoveredState,
    ) -> Self {
        let chain = recovered.chain.unwrap_or(genesis_chain);
        let validators = Arc::new(chain.validators.clone());
        let height = chain.next_height();
        let rs = RoundState::new(height, &chain.chain_id, validators.clone());
        let mut evidence = EvidencePool::new();
        for ev in recovered.evidence {
            evidence.add_verified(ev);
        }
        ConsensusState {
            config,
            privval,
            chain,
            executor,
            mempool,
            evidence,
            cache,
            validators,
            rs,
            last_commit: recovered.last_commit,
            last_extended_votes: Vec::new(),
            own_votes: recovered.own_votes,
            buffered: Vec::new(),
            pending_conflict: None,
            now: Duration::ZERO,
        }
    }

    pub fn height(&self) -> u64 {
        self.rs.height
    }

    pub fn round(&self) -> u32 {
        self.rs.round
    }

    pub fn step(&self) -> RoundStep {
        self.rs.step
    }

    pub fn chain(&self) -> &ChainState {
        &self.chain
    }

    pub fn evidence_pool(&self) -> &EvidencePool {
        &self.evidence
    }

    pub fn locked_round(&self) -> Option<u32> {
        self.rs.locked_round
    }

    pub fn valid_round(&self) -> Option<u32> {
        self.rs.valid_round
    }

    /// The wall-clock reading of the runner clock.
    fn wall_time(&self) -> Time {
        Time::from_millis(self.now.as_millis() as u64)
    }

    fn our_address(&self) -> Option<Address> {
        self.privval.as_ref().map(|pv| pv.address)
    }

    /// Kick off consensus for the current height.
    pub fn start(&mut self) -> Vec<Action> {
        info!(
            height = self.rs.height,
            validators = self.validators.len(),
            "starting consensus"
        );
        self.enter_new_round(0)
    }

    // ═══════════════════════════════════════════════════════════════════
    // Round transitions
    // ═══════════════════════════════════════════════════════════════════

    #[instrument(skip(self), fields(height = self.rs.height))]
    fn enter_new_round(&mut self, round: u32) -> Vec<Action> {
        if round > self.rs.round {
            self.rs
                .round_validators
                .increment_proposer_priority(round - self.rs.round);
        }
        debug!(round, "entering new round");
        self.rs.round = round;
        self.rs.step = RoundStep::NewRound;
        self.rs.votes.set_round(round);
        self.rs.proposal = None;
        self.rs.proposal_block = None;
        self.rs.proposal_block_parts = None;
        self.rs.proposal_verdict = None;
        self.rs.sent_prevote = false;
        self.rs.sent_precommit = false;

        let mut actions = self.enter_propose();

        // Messages buffered for this round become live now.
        let height = self.rs.height;
        let mut replay = Vec::new();
        self.buffered.retain(|(h, r, event)| {
            if *h == height && *r == round {
                replay.push(event.clone());
                false
            } else {
                true
            }
        });
        for event in replay {
            actions.push(Action::EnqueueInternal { event });
        }

        // Votes for this round may already hold a quorum.
        actions.extend(self.check_round_quorums(round));
        actions
    }

    fn enter_propose(&mut self) -> Vec<Action> {
        self.rs.step = RoundStep::Propose;
        let proposer = self.rs.round_validators.proposer().address;
        trace!(round = self.rs.round, ?proposer, "entering propose");

        if self.our_address() == Some(proposer) {
            return self.decide_proposal();
        }

        vec![Action::ScheduleTimeout {
            height: self.rs.height,
            round: self.rs.round,
            step: TimeoutStep::Propose,
            duration: self.config.propose_timeout(self.rs.round),
        }]
    }

    /// We are the proposer: pick a block and broadcast it.
    fn decide_proposal(&mut self) -> Vec<Action> {
        // Re-propose the valid block if one exists; the POL round tells
        // locked validators why they may switch to it.
        let (block, pol_round) = match self.rs.valid_block.clone() {
            Some(block) => (block, self.rs.valid_round),
            None => (self.create_proposal_block(), None),
        };

        let block_bytes = block.encode();
        let parts = PartSet::from_bytes(&block_bytes);
        let block_id = BlockId {
            hash: block.hash(),
            part_set_header: *parts.header(),
        };

        let privval = self.privval.as_ref().expect("proposer has a key");
        let mut proposal = Proposal {
            height: self.rs.height,
            round: self.rs.round,
            pol_round,
            block_id,
            timestamp: self.wall_time(),
            signature: Signature::zero(),
        };
        proposal.signature = privval
            .keypair
            .sign(&proposal.sign_bytes(&self.chain.chain_id));

        info!(
            height = self.rs.height,
            round = self.rs.round,
            block = ?block_id.hash,
            txs = block.data.len(),
            re_proposal = pol_round.is_some(),
            "proposing block"
        );

        let mut actions = vec![Action::Broadcast {
            message: OutboundMessage::Proposal(ProposalGossip {
                proposal: proposal.clone(),
            }),
        }];
        for part in parts.parts() {
            actions.push(Action::Broadcast {
                message: OutboundMessage::BlockPart(BlockPartGossip {
                    height: self.rs.height,
                    round: self.rs.round,
                    part: part.clone(),
                }),
            });
        }

        self.rs.proposal = Some(proposal);
        self.rs.proposal_block = Some(block);
        self.rs.proposal_block_parts = Some(parts);

        // We hold the complete block: move straight to prevoting it.
        actions.extend(self.enter_prevote());
        actions
    }

    /// Assemble a fresh block from the mempool, evidence pool, and the
    /// last commit.
    fn create_proposal_block(&mut self) -> Block {
        let params = &self.chain.consensus_params;
        let max_bytes = params.block.max_bytes;
        // Leave room for the header, commit, and evidence.
        let max_data_bytes = max_bytes - max_bytes / 10;

        let evidence = self.evidence.pending_for_block(params.evidence.max_bytes);
        let misbehavior = self.misbehavior_from(&evidence);

        let reaped = self.mempool.lock().reap(max_data_bytes);
        let proposer_address = self.our_address().expect("proposer has a key");

        let txs = self.executor.app().lock().prepare_proposal(PrepareProposalRequest {
            height: self.rs.height,
            time: self.block_time(),
            txs: reaped,
            max_tx_bytes: max_data_bytes,
            local_last_commit: self.last_commit.as_ref().map(|commit| CommitInfo {
                round: commit.round,
                votes: self.last_extended_votes.clone(),
            }),
            misbehavior,
            proposer_address,
        });

        let last_commit_hash = Block::last_commit_hash(&self.last_commit);
        let header = palisade_types::Header {
            chain_id: self.chain.chain_id.clone(),
            height: self.rs.height,
            time: self.block_time(),
            last_block_id: self.chain.last_block_id,
            last_commit_hash,
            data_hash: Block::data_hash(&txs),
            validators_hash: self.chain.validators.hash(),
            next_validators_hash: self.chain.next_validators.hash(),
            consensus_hash: self.chain.consensus_params.hash(),
            app_hash: self.chain.app_hash.clone(),
            last_results_hash: self.chain.last_results_hash,
            evidence_hash: Block::evidence_hash(&evidence),
            proposer_address,
        };
        Block {
            header,
            data: txs,
            evidence,
            last_commit: self.last_commit.clone(),
        }
    }

    /// The header time for a block proposed now: the genesis time at the
    /// initial height, afterwards the power-weighted median of the last
    /// commit's timestamps (a single proposer clock cannot skew it).
    fn block_time(&self) -> Time {
        if self.rs.height == self.chain.initial_height {
            return self.chain.genesis_time;
        }
        let commit = self
            .last_commit
            .as_ref()
            .expect("past the initial height there is a last commit");
        let vals = self
            .chain
            .last_validators
            .as_ref()
            .expect("past the initial height there are last validators");
        let median = commit.median_time(vals);
        // Strictly increasing across heights.
        if median.is_after(self.chain.last_block_time) {
            median
        } else {
            self.chain.last_block_time.add(Duration::from_millis(1))
        }
    }

    fn misbehavior_from(&self, evidence: &[Evidence]) -> Vec<Misbehavior> {
        evidence
            .iter()
            .map(|ev| match ev {
                Evidence::DuplicateVote(dv) => Misbehavior {
                    kind: MisbehaviorKind::DuplicateVote,
                    validator_address: dv.validator_address(),
                    height: dv.height(),
                    time: dv.timestamp,
                    total_voting_power: dv.total_voting_power,
                },
                Evidence::LightClientAttack(lc) => Misbehavior {
                    kind: MisbehaviorKind::LightClientAttack,
                    validator_address: lc.conflicting_block.header.proposer_address,
                    height: lc.height(),
                    time: lc.timestamp,
                    total_voting_power: lc.total_voting_power,
                },
            })
            .collect()
    }

    // ═══════════════════════════════════════════════════════════════════
    // Prevote
    // ═══════════════════════════════════════════════════════════════════

    fn enter_prevote(&mut self) -> Vec<Action> {
        if self.rs.step >= RoundStep::Prevote {
            return vec![];
        }
        self.rs.step = RoundStep::Prevote;
        let decision = self.decide_prevote();
        debug!(
            height = self.rs.height,
            round = self.rs.round,
            vote = ?decision.map(|id| id.hash),
            "prevoting"
        );
        self.sign_and_broadcast_vote(VoteType::Prevote, decision)
    }

    /// The prevote rules:
    /// 1. No (complete) proposal → nil.
    /// 2. Unlocked → prevote the proposal iff it is valid.
    /// 3. Locked on this block → prevote it.
    /// 4. Locked elsewhere → prevote the proposal only with a proof of
    ///    lock from `pol_round >= locked_round`; otherwise nil.
    fn decide_prevote(&mut self) -> Option<BlockId> {
        let Some(proposal) = self.rs.proposal.clone() else {
            return None;
        };
        // The held block must be the proposed one; a polka may have
        // re-pointed the part-set container at a different block.
        if self
            .rs
            .proposal_block
            .as_ref()
            .map_or(true, |b| b.hash() != proposal.block_id.hash)
        {
            return None;
        }
        let proposed_id = proposal.block_id;

        if let (Some(locked_round), Some(locked_block)) =
            (self.rs.locked_round, self.rs.locked_block.as_ref())
        {
            if locked_block.hash() == proposed_id.hash {
                return Some(proposed_id);
            }
            if let Some(pol_round) = proposal.pol_round {
                let pol_is_fresh = pol_round >= locked_round && pol_round < proposal.round;
                let pol_proven = self
                    .rs
                    .votes
                    .prevotes(pol_round)
                    .and_then(|set| set.two_thirds_majority())
                    == Some(Some(proposed_id));
                if pol_is_fresh && pol_proven && self.proposal_block_valid() {
                    debug!(pol_round, "proof of lock overrides our lock");
                    return Some(proposed_id);
                }
            }
            return None;
        }

        if self.proposal_block_valid() {
            Some(proposed_id)
        } else {
            None
        }
    }

    /// Full validation of the proposal block: structure, chain linkage,
    /// and the application's `process_proposal` verdict. Cached per
    /// proposal.
    fn proposal_block_valid(&mut self) -> bool {
        if let Some(verdict) = self.rs.proposal_verdict {
            return verdict;
        }
        let Some(block) = self.rs.proposal_block.clone() else {
            return false;
        };

        let verdict = match self.validate_block(&block) {
            Err(reason) => {
                warn!(%reason, "proposal block failed validation");
                false
            }
            Ok(()) => {
                let status = self.executor.app().lock().process_proposal(ProcessProposalRequest {
                    height: block.header.height,
                    time: block.header.time,
                    hash: block.hash(),
                    txs: block.data.clone(),
                    proposed_last_commit: self.commit_info_for(&block),
                    misbehavior: self.misbehavior_from(&block.evidence),
                    proposer_address: block.header.proposer_address,
                });
                if status == ProposalStatus::Reject {
                    warn!("application rejected the proposal");
                }
                status == ProposalStatus::Accept
            }
        };
        self.rs.proposal_verdict = Some(verdict);
        verdict
    }

    /// Validate a block against our chain state. Every hash link the
    /// header claims must match what we committed.
    fn validate_block(&self, block: &Block) -> Result<(), String> {
        block
            .validate_basic(self.chain.initial_height)
            .map_err(|e| e.to_string())?;
        let header = &block.header;
        if header.chain_id != self.chain.chain_id {
            return Err(format!("wrong chain id {:?}", header.chain_id));
        }
        if header.height != self.rs.height {
            return Err(format!(
                "wrong height {} (deciding {})",
                header.height, self.rs.height
            ));
        }
        if header.last_block_id != self.chain.last_block_id {
            return Err("last block id does not match our chain".to_string());
        }
        if header.validators_hash != self.chain.validators.hash() {
            return Err("validators hash mismatch".to_string());
        }
        if header.next_validators_hash != self.chain.next_validators.hash() {
            return Err("next validators hash mismatch".to_string());
        }
        if header.consensus_hash != self.chain.consensus_params.hash() {
            return Err("consensus params hash mismatch".to_string());
        }
        if header.app_hash != self.chain.app_hash {
            return Err("app hash mismatch".to_string());
        }
        if header.last_results_hash != self.chain.last_results_hash {
            return Err("last results hash mismatch".to_string());
        }

        if header.height == self.chain.initial_height {
            if header.time != self.chain.genesis_time {
                return Err("initial block time must equal genesis time".to_string());
            }
        } else {
            let commit = block
                .last_commit
                .as_ref()
                .ok_or_else(|| "missing last commit".to_string())?;
            let last_vals = self
                .chain
                .last_validators
                .as_ref()
                .ok_or_else(|| "no last validators".to_string())?;
            let last_block_id = self
                .chain
                .last_block_id
                .ok_or_else(|| "no last block id".to_string())?;
            last_vals
                .verify_commit(
                    &self.chain.chain_id,
                    &last_block_id,
                    header.height - 1,
                    commit,
                    &self.cache,
                )
                .map_err(|e| format!("invalid last commit: {e}"))?;

            let median = commit.median_time(last_vals);
            let expected = if median.is_after(self.chain.last_block_time) {
                median
            } else {
                self.chain.last_block_time.add(Duration::from_millis(1))
            };
            if header.time != expected {
                return Err(format!(
                    "block time {} != weighted median {expected}",
                    header.time
                ));
            }
        }

        for ev in &block.evidence {
            if ev.height() >= header.height {
                return Err("evidence from the future".to_string());
            }
            if ev.is_expired(
                self.chain.last_block_height,
                self.chain.last_block_time,
                self.chain.consensus_params.evidence.max_age_num_blocks,
                self.chain.consensus_params.evidence.max_age_duration_ms,
            ) {
                return Err("expired evidence".to_string());
            }
            // Signatures are checkable while the accused set is still one
            // of the three we hold.
            if let Some(vals) = self.validator_set_at(ev.height()) {
                match ev {
                    Evidence::DuplicateVote(dv) => dv
                        .verify(&self.chain.chain_id, vals, &self.cache)
                        .map_err(|e| format!("invalid evidence: {e}"))?,
                    Evidence::LightClientAttack(lc) => lc
                        .verify(&self.chain.chain_id, vals, &self.cache)
                        .map_err(|e| format!("invalid evidence: {e}"))?,
                }
            }
        }
        Ok(())
    }

    fn validator_set_at(&self, height: u64) -> Option<&ValidatorSet> {
        if height == self.chain.next_height() {
            Some(&self.chain.validators)
        } else if height == self.chain.last_block_height {
            self.chain.last_validators.as_ref()
        } else {
            None
        }
    }

    /// The commit info handed to the application for a block's
    /// `last_commit`.
    fn commit_info_for(&self, block: &Block) -> Option<CommitInfo> {
        let commit = block.last_commit.as_ref()?;
        let last_vals = self.chain.last_validators.as_ref()?;
        let votes = last_vals
            .iter()
            .zip(&commit.signatures)
            .map(|(val, sig)| VoteInfo {
                validator_address: val.address,
                power: val.voting_power,
                signed: !matches!(sig, CommitSig::Absent),
                extension: Vec::new(),
            })
            .collect();
        Some(CommitInfo {
            round: commit.round,
            votes,
        })
    }

    // ═══════════════════════════════════════════════════════════════════
    // Precommit
    // ═══════════════════════════════════════════════════════════════════

    fn enter_prevote_wait(&mut self) -> Vec<Action> {
        if self.rs.step != RoundStep::Prevote {
            return vec![];
        }
        self.rs.step = RoundStep::PrevoteWait;
        vec![Action::ScheduleTimeout {
            height: self.rs.height,
            round: self.rs.round,
            step: TimeoutStep::Prevote,
            duration: self.config.prevote_timeout(self.rs.round),
        }]
    }

    fn enter_precommit(&mut self) -> Vec<Action> {
        if self.rs.step >= RoundStep::Precommit {
            return vec![];
        }
        self.rs.step = RoundStep::Precommit;

        let maj = self
            .rs
            .votes
            .prevotes(self.rs.round)
            .and_then(|set| set.two_thirds_majority());

        let decision = match maj {
            Some(Some(block_id)) => {
                if self
                    .rs
                    .proposal_block
                    .as_ref()
                    .is_some_and(|b| b.hash() == block_id.hash)
                {
                    // Lock and precommit the polka block.
                    info!(
                        height = self.rs.height,
                        round = self.rs.round,
                        block = ?block_id.hash,
                        "locking on polka"
                    );
                    self.rs.locked_round = Some(self.rs.round);
                    self.rs.locked_block = self.rs.proposal_block.clone();
                    self.rs.valid_round = Some(self.rs.round);
                    self.rs.valid_block = self.rs.proposal_block.clone();
                    Some(block_id)
                } else if self
                    .rs
                    .locked_block
                    .as_ref()
                    .is_some_and(|b| b.hash() == block_id.hash)
                {
                    // Already locked on it; refresh the lock round.
                    self.rs.locked_round = Some(self.rs.round);
                    Some(block_id)
                } else {
                    // The network polka'd a block we do not hold: release
                    // our lock (the polka supersedes it) and start
                    // collecting its parts. An equivocating proposer may
                    // have pointed us at a different part set; anything
                    // not matching the polka's header is dead weight.
                    warn!(
                        block = ?block_id.hash,
                        "polka for a block we don't have"
                    );
                    self.rs.locked_round = None;
                    self.rs.locked_block = None;
                    self.repoint_part_set(block_id.part_set_header);
                    None
                }
            }
            Some(None) => {
                // Nil polka: unlock.
                if self.rs.locked_round.is_some() {
                    debug!("unlocking on nil polka");
                }
                self.rs.locked_round = None;
                self.rs.locked_block = None;
                None
            }
            None => None,
        };

        debug!(
            height = self.rs.height,
            round = self.rs.round,
            vote = ?decision.map(|id| id.hash),
            "precommitting"
        );
        self.sign_and_broadcast_vote(VoteType::Precommit, decision)
    }

    /// Point the part-set container at `header`, dropping whatever was
    /// collected for a different part set. The stale proposal block (if
    /// any) goes with it; it can no longer be the block this round
    /// decides.
    fn repoint_part_set(&mut self, header: palisade_types::PartSetHeader) {
        let matches = self
            .rs
            .proposal_block_parts
            .as_ref()
            .map_or(false, |parts| *parts.header() == header);
        if matches {
            return;
        }
        self.rs.proposal_block = None;
        self.rs.proposal_verdict = None;
        self.rs.proposal_block_parts = Some(PartSet::from_header(header));
    }

    /// The hash the bytes assembling under `header` must decode to:
    /// whichever of the proposal, the decided precommit quorum, or the
    /// current prevote quorum this container was created from.
    fn expected_hash_for(&self, header: &palisade_types::PartSetHeader) -> Option<Hash> {
        if let Some(proposal) = &self.rs.proposal {
            if proposal.block_id.part_set_header == *header {
                return Some(proposal.block_id.hash);
            }
        }
        if let Some(commit_round) = self.rs.commit_round {
            if let Some(Some(id)) = self
                .rs
                .votes
                .precommits(commit_round)
                .and_then(|s| s.two_thirds_majority())
            {
                if id.part_set_header == *header {
                    return Some(id.hash);
                }
            }
        }
        if let Some(Some(id)) = self
            .rs
            .votes
            .prevotes(self.rs.round)
            .and_then(|s| s.two_thirds_majority())
        {
            if id.part_set_header == *header {
                return Some(id.hash);
            }
        }
        None
    }

    fn enter_precommit_wait(&mut self) -> Vec<Action> {
        if self.rs.step != RoundStep::Precommit {
            return vec![];
        }
        self.rs.step = RoundStep::PrecommitWait;
        vec![Action::ScheduleTimeout {
            height: self.rs.height,
            round: self.rs.round,
            step: TimeoutStep::Precommit,
            duration: self.config.precommit_timeout(self.rs.round),
        }]
    }

    // ═══════════════════════════════════════════════════════════════════
    // Voting
    // ═══════════════════════════════════════════════════════════════════

    /// Sign a vote, persist it, broadcast it, and count it ourselves.
    fn sign_and_broadcast_vote(
        &mut self,
        vote_type: VoteType,
        block_id: Option<BlockId>,
    ) -> Vec<Action> {
        let Some(privval) = self.privval.as_ref() else {
            return vec![]; // observers don't vote
        };
        let sent = match vote_type {
            VoteType::Prevote => &mut self.rs.sent_prevote,
            VoteType::Precommit => &mut self.rs.sent_precommit,
        };
        if *sent {
            return vec![];
        }
        *sent = true;

        // Restart protection: never sign conflicting votes for the same
        // coordinates, even across process lifetimes.
        let key = (self.rs.height, self.rs.round, vote_type);
        if let Some(previous) = self.own_votes.get(&key) {
            if *previous != block_id {
                warn!(
                    height = self.rs.height,
                    round = self.rs.round,
                    ?vote_type,
                    "refusing to sign a conflicting vote"
                );
                return vec![];
            }
        }

        let Some((index, _)) = self.validators.get_by_address(&privval.address) else {
            trace!("not a validator this height, not voting");
            return vec![];
        };

        let mut vote = Vote {
            vote_type,
            height: self.rs.height,
            round: self.rs.round,
            block_id,
            timestamp: self.wall_time(),
            validator_address: privval.address,
            validator_index: index,
            signature: Signature::zero(),
            extension: Vec::new(),
            extension_signature: None,
        };

        // Vote extensions ride on precommits for a block when enabled.
        if vote_type == VoteType::Precommit
            && block_id.is_some()
            && self
                .chain
                .consensus_params
                .vote_extensions_enabled(self.rs.height)
        {
            let extension = self.executor.app().lock().extend_vote(ExtendVoteRequest {
                height: self.rs.height,
                round: self.rs.round,
                hash: block_id.expect("checked above").hash,
            });
            let ext_bytes = palisade_types::Vote {
                extension: extension.clone(),
                ..vote.clone()
            }
            .extension_sign_bytes(&self.chain.chain_id);
            vote.extension = extension;
            vote.extension_signature = Some(privval.keypair.sign(&ext_bytes));
        }

        vote.signature = privval.keypair.sign(&vote.sign_bytes(&self.chain.chain_id));
        self.own_votes.insert(key, block_id);

        // Persisting before broadcasting is what makes the restart
        // protection sound; the runner executes actions in order.
        let mut actions = vec![
            Action::PersistOwnVote {
                height: self.rs.height,
                round: self.rs.round,
                vote_type,
                block_id,
            },
            Action::Broadcast {
                message: OutboundMessage::Vote(VoteGossip { vote: vote.clone() }),
            },
        ];
        actions.extend(self.add_vote(vote));
        actions
    }

    /// Count a vote (ours or a peer's) and react to what it changes.
    fn add_vote(&mut self, vote: Vote) -> Vec<Action> {
        let vote_type = vote.vote_type;
        let round = vote.round;
        let voter = vote.validator_address;

        if !self.verify_vote_extension(&vote) {
            warn!(?voter, "vote extension rejected");
            return vec![];
        }

        match self.rs.votes.add_vote(vote, &self.cache) {
            Ok(AddVoteResult::Added) => self.handle_added_vote(vote_type, round),
            Ok(AddVoteResult::Duplicate) => vec![],
            Ok(AddVoteResult::Conflicting(existing)) => {
                self.handle_equivocation(*existing, voter)
            }
            Err(e) => {
                debug!(?voter, error = %e, "vote rejected");
                vec![]
            }
        }
    }

    /// Extensions must be present, signed, and app-approved exactly when
    /// enabled; everything else is rejected before tallying.
    fn verify_vote_extension(&mut self, vote: &Vote) -> bool {
        let applies = vote.vote_type == VoteType::Precommit && vote.block_id.is_some();
        let enabled = self
            .chain
            .consensus_params
            .vote_extensions_enabled(vote.height);

        if !applies || !enabled {
            return vote.extension.is_empty() && vote.extension_signature.is_none();
        }

        let Some(ext_sig) = &vote.extension_signature else {
            return false;
        };
        let Some(val) = self
            .validators
            .get_by_address(&vote.validator_address)
            .map(|(_, v)| v)
        else {
            return false;
        };
        let ext_bytes = vote.extension_sign_bytes(&self.chain.chain_id);
        if self.cache.verify(&val.pub_key, &ext_bytes, ext_sig).is_err() {
            return false;
        }
        let block_hash = vote.block_id.expect("applies only to block votes").hash;
        self.executor
            .app()
            .lock()
            .verify_vote_extension(VerifyVoteExtensionRequest {
                height: vote.height,
                round: vote.round,
                validator_address: vote.validator_address,
                hash: block_hash,
                extension: vote.extension.clone(),
            })
    }

    fn handle_equivocation(&mut self, existing: Vote, voter: Address) -> Vec<Action> {
        // We hold two signed conflicting votes; the second one is still in
        // flight in the caller, so rebuild it from the tally's reject.
        // Both votes were signature-verified before reaching here.
        warn!(?voter, height = existing.height, "recording equivocation evidence");
        let Some((_, val)) = self.validators.get_by_address(&voter) else {
            return vec![];
        };
        let conflicting = self.pending_conflict.take();
        let Some(other) = conflicting else {
            return vec![];
        };
        match DuplicateVoteEvidence::new(
            existing,
            other,
            self.validators.total_voting_power(),
            val.voting_power,
            self.wall_time(),
        ) {
            Ok(ev) => {
                let evidence = Evidence::DuplicateVote(ev);
                if self.evidence.add_verified(evidence.clone()) {
                    return vec![
                        Action::PersistEvidence {
                            evidence: evidence.clone(),
                        },
                        Action::Broadcast {
                            message: OutboundMessage::Evidence(EvidenceGossip { evidence }),
                        },
                    ];
                }
                vec![]
            }
            Err(e) => {
                debug!(error = %e, "conflicting votes did not form evidence");
                vec![]
            }
        }
    }

    /// React to new information in the tallies.
    fn handle_added_vote(&mut self, vote_type: VoteType, round: u32) -> Vec<Action> {
        let mut actions = Vec::new();
        match vote_type {
            VoteType::Prevote => {
                // Track the freshest POL block we actually hold.
                if let Some(Some(block_id)) =
                    self.rs.votes.prevotes(round).and_then(|s| s.two_thirds_majority())
                {
                    let have_it = self
                        .rs
                        .proposal_block
                        .as_ref()
                        .is_some_and(|b| b.hash() == block_id.hash);
                    let fresher = self.rs.valid_round.map_or(true, |vr| round > vr);
                    if have_it && fresher {
                        self.rs.valid_round = Some(round);
                        self.rs.valid_block = self.rs.proposal_block.clone();
                    }
                }

                if round == self.rs.round {
                    let set = self.rs.votes.prevotes(round).expect("current round exists");
                    let maj = set.two_thirds_majority();
                    let any = set.has_two_thirds_any();
                    if maj.is_some()
                        && matches!(self.rs.step, RoundStep::Prevote | RoundStep::PrevoteWait)
                    {
                        actions.extend(self.enter_precommit());
                    } else if any && self.rs.step == RoundStep::Prevote {
                        actions.extend(self.enter_prevote_wait());
                    }
                } else if round > self.rs.round
                    && self
                        .rs
                        .votes
                        .prevotes(round)
                        .is_some_and(|s| s.has_two_thirds_any())
                {
                    // The network is ahead of us.
                    actions.extend(self.enter_new_round(round));
                }
            }
            VoteType::Precommit => {
                let set = self.rs.votes.precommits(round).expect("round exists");
                let maj = set.two_thirds_majority();
                let any = set.has_two_thirds_any();
                let nil = set.has_two_thirds_nil();
                match maj {
                    // A block quorum at ANY round decides the height.
                    Some(Some(_)) => actions.extend(self.enter_commit(round)),
                    _ if round == self.rs.round => {
                        if nil && self.rs.step < RoundStep::Commit {
                            // Nothing will commit this round.
                            actions.extend(self.enter_precommit());
                            actions.extend(self.enter_new_round(round + 1));
                        } else if any && self.rs.step == RoundStep::Precommit {
                            actions.extend(self.enter_precommit_wait());
                        }
                    }
                    _ if round > self.rs.round && any => {
                        actions.extend(self.enter_new_round(round));
                    }
                    _ => {}
                }
            }
        }
        actions
    }

    /// Votes for this round that already form quorums (possible after a
    /// round jump).
    fn check_round_quorums(&mut self, round: u32) -> Vec<Action> {
        let mut actions = Vec::new();
        let prevote_state = self.rs.votes.prevotes(round).map(|s| {
            (s.two_thirds_majority().is_some(), s.has_two_thirds_any())
        });
        if let Some((maj, any)) = prevote_state {
            if maj && matches!(self.rs.step, RoundStep::Prevote | RoundStep::PrevoteWait) {
                actions.extend(self.enter_precommit());
            } else if any && self.rs.step == RoundStep::Prevote {
                actions.extend(self.enter_prevote_wait());
            }
        }
        let precommit_block_maj = self
            .rs
            .votes
            .precommits(round)
            .and_then(|s| s.two_thirds_majority())
            .flatten()
            .is_some();
        if precommit_block_maj {
            actions.extend(self.enter_commit(round));
        }
        actions
    }

    // ═══════════════════════════════════════════════════════════════════
    // Commit
    // ═══════════════════════════════════════════════════════════════════

    fn enter_commit(&mut self, commit_round: u32) -> Vec<Action> {
        if self.rs.step == RoundStep::Commit {
            return vec![];
        }
        info!(
            height = self.rs.height,
            commit_round, "+2/3 precommits, entering commit"
        );
        self.rs.step = RoundStep::Commit;
        self.rs.commit_round = Some(commit_round);

        // If we were not following this round's proposal, start collecting
        // the decided block's parts now. A container for some other part
        // set (an equivocating proposer's, say) cannot accept them.
        let decided = self
            .rs
            .votes
            .precommits(commit_round)
            .and_then(|s| s.two_thirds_majority())
            .flatten();
        let mut actions = Vec::new();
        if let Some(block_id) = decided {
            let have_block = self
                .rs
                .proposal_block
                .as_ref()
                .is_some_and(|b| b.hash() == block_id.hash)
                || self
                    .rs
                    .locked_block
                    .as_ref()
                    .is_some_and(|b| b.hash() == block_id.hash);
            if !have_block {
                self.repoint_part_set(block_id.part_set_header);
                actions.extend(self.drain_buffered_for_round(self.rs.round));
                actions.extend(self.drain_buffered_for_round(commit_round));
            }
        }
        actions.extend(self.try_finalize());
        actions
    }

    /// Re-enqueue events parked while the round had no part-set container
    /// to receive them.
    fn drain_buffered_for_round(&mut self, round: u32) -> Vec<Action> {
        let height = self.rs.height;
        let mut actions = Vec::new();
        self.buffered.retain(|(h, r, event)| {
            if *h == height && *r == round {
                actions.push(Action::EnqueueInternal {
                    event: event.clone(),
                });
                false
            } else {
                true
            }
        });
        actions
    }

    /// Decide → persist → apply, the first half. Emits the durable write
    /// and the internal apply event; the runner guarantees the write lands
    /// first.
    fn try_finalize(&mut self) -> Vec<Action> {
        let Some(commit_round) = self.rs.commit_round else {
            return vec![];
        };
        let Some(Some(block_id)) = self
            .rs
            .votes
            .precommits(commit_round)
            .and_then(|s| s.two_thirds_majority())
        else {
            return vec![];
        };

        let block = if self
            .rs
            .proposal_block
            .as_ref()
            .is_some_and(|b| b.hash() == block_id.hash)
        {
            self.rs.proposal_block.clone()
        } else if self
            .rs
            .locked_block
            .as_ref()
            .is_some_and(|b| b.hash() == block_id.hash)
        {
            self.rs.locked_block.clone()
        } else {
            // Block parts still in flight; on_block_part retries.
            debug!(block = ?block_id.hash, "decided block not yet assembled");
            return vec![];
        };
        let block = block.expect("checked above");

        // +2/3 of the power precommitted this block. If it does not
        // validate against our state, more than a third of the network is
        // Byzantine or we have diverged; continuing would fork.
        if let Err(reason) = self.validate_block(&block) {
            panic!(
                "consensus failure: +2/3 precommitted an invalid block at height {}: {}",
                self.rs.height, reason
            );
        }

        let commit = self
            .rs
            .votes
            .precommits(commit_round)
            .expect("commit round exists")
            .make_commit()
            .expect("majority checked above");

        vec![
            Action::PersistBlock {
                block: Box::new(block.clone()),
                commit: commit.clone(),
            },
            Action::EnqueueInternal {
                event: Event::BlockDecided {
                    block: Box::new(block),
                    commit,
                },
            },
        ]
    }

    /// Decide → persist → apply, the second half: the block is durable,
    /// run it through the application and advance the height.
    #[instrument(skip(self, block, commit), fields(height = block.header.height))]
    fn apply_decided_block(&mut self, block: Block, commit: Commit) -> Vec<Action> {
        let height = block.header.height;
        let block_id = commit.block_id;

        // Collect extensions from the precommits before the vote sets are
        // dropped; the next proposer hands them to the application.
        let extended = self
            .rs
            .votes
            .precommits(commit.round)
            .map(|set| {
                self.validators
                    .iter()
                    .enumerate()
                    .map(|(i, val)| {
                        let vote = set.get_by_index(i as u32);
                        VoteInfo {
                            validator_address: val.address,
                            power: val.voting_power,
                            signed: vote.is_some(),
                            extension: vote.map(|v| v.extension.clone()).unwrap_or_default(),
                        }
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let request = FinalizeBlockRequest {
            height,
            time: block.header.time,
            hash: block.hash(),
            txs: block.data.clone(),
            decided_last_commit: self.commit_info_for(&block),
            misbehavior: self.misbehavior_from(&block.evidence),
            proposer_address: block.header.proposer_address,
        };

        // Application calls are uncancellable and their failure is fatal:
        // halting beats forking.
        let (finalize, commit_resp) = self
            .executor
            .execute_block(request)
            .unwrap_or_else(|e| panic!("application execution failed at height {height}: {e}"));

        self.chain
            .apply_block(&block, block_id, &finalize)
            .unwrap_or_else(|e| panic!("chain state update failed at height {height}: {e}"));

        self.evidence.mark_committed(&block.evidence);
        self.evidence.prune(
            self.chain.last_block_height,
            self.chain.last_block_time,
            &self.chain.consensus_params.evidence.clone(),
        );

        info!(
            height,
            block = ?block_id.hash,
            txs = block.data.len(),
            app_hash = ?Hash::sum(&finalize.app_hash),
            "block committed"
        );

        // Roll the round state over to the next height.
        self.validators = Arc::new(self.chain.validators.clone());
        self.last_commit = Some(commit);
        self.last_extended_votes = extended;
        self.rs = RoundState::new(
            self.chain.next_height(),
            &self.chain.chain_id,
            self.validators.clone(),
        );
        self.prune_own_votes();

        let mut actions = vec![
            Action::EmitCommittedBlock {
                block: Box::new(block.clone()),
            },
            Action::EnqueueInternal {
                event: Event::BlockCommitted {
                    height,
                    block: Box::new(block),
                },
            },
            // Settle before the next height so slow validators' precommits
            // make it into the commit we carry.
            Action::ScheduleTimeout {
                height: self.rs.height,
                round: 0,
                step: TimeoutStep::Commit,
                duration: self.config.timeout_commit,
            },
        ];
        if commit_resp.retain_height > 0 {
            actions.push(Action::PruneBlocks {
                retain_height: commit_resp.retain_height,
            });
        }

        // Deliver buffered events for the new height.
        let height_now = self.rs.height;
        let mut replay = Vec::new();
        self.buffered.retain(|(h, _, event)| {
            if *h == height_now {
                replay.push(event.clone());
                false
            } else {
                true
            }
        });
        for event in replay {
            actions.push(Action::EnqueueInternal { event });
        }
        actions
    }

    fn prune_own_votes(&mut self) {
        let height = self.rs.height;
        self.own_votes.retain(|(h, _, _), _| *h >= height);
    }

    // ═══════════════════════════════════════════════════════════════════
    // Event handlers
    // ═══════════════════════════════════════════════════════════════════

    fn on_proposal(&mut self, proposal: Proposal) -> Vec<Action> {
        if proposal.height != self.rs.height {
            return self.buffer_if_next_height(proposal.height, 0, Event::ProposalReceived {
                proposal,
            });
        }
        if proposal.round != self.rs.round {
            if proposal.round > self.rs.round {
                return self.buffer_for_round(proposal.round, Event::ProposalReceived { proposal });
            }
            return vec![];
        }
        if self.rs.proposal.is_some() {
            return vec![];
        }
        if !proposal.validate_basic() {
            warn!("malformed proposal");
            return vec![];
        }

        let proposer = self.rs.round_validators.proposer();
        if self
            .cache
            .verify(
                &proposer.pub_key,
                &proposal.sign_bytes(&self.chain.chain_id),
                &proposal.signature,
            )
            .is_err()
        {
            warn!(
                proposer = ?proposer.address,
                "proposal signature invalid for this round's proposer"
            );
            return vec![];
        }

        debug!(
            height = proposal.height,
            round = proposal.round,
            block = ?proposal.block_id.hash,
            "proposal accepted"
        );
        if self.rs.proposal_block_parts.is_none() {
            self.rs.proposal_block_parts =
                Some(PartSet::from_header(proposal.block_id.part_set_header));
        }
        self.rs.proposal = Some(proposal);
        // Parts that raced ahead of the proposal become deliverable.
        let mut actions = self.drain_buffered_for_round(self.rs.round);
        actions.extend(self.try_complete_block());
        actions
    }

    fn on_block_part(&mut self, height: u64, round: u32, part: Part) -> Vec<Action> {
        if height != self.rs.height {
            return self.buffer_if_next_height(height, round, Event::BlockPartReceived {
                height,
                round,
                part,
            });
        }
        // Parts for the decided round are live even when that round is
        // ahead of ours (we jumped straight to commit).
        if round > self.rs.round && self.rs.commit_round != Some(round) {
            return self.buffer_for_round(round, Event::BlockPartReceived {
                height,
                round,
                part,
            });
        }
        let Some(parts) = self.rs.proposal_block_parts.as_mut() else {
            // No proposal yet; park the part until it arrives.
            return self.buffer_for_round(self.rs.round, Event::BlockPartReceived {
                height,
                round,
                part,
            });
        };
        match parts.add_part(part) {
            Ok(true) => self.try_complete_block(),
            Ok(false) => vec![],
            Err(e) => {
                debug!(error = %e, "block part rejected");
                vec![]
            }
        }
    }

    /// Once all parts are in, decode the block and resume whatever step
    /// was waiting on it.
    fn try_complete_block(&mut self) -> Vec<Action> {
        if self.rs.proposal_block.is_some() {
            return self.after_block_complete();
        }
        let Some(parts) = self.rs.proposal_block_parts.as_ref() else {
            return vec![];
        };
        if !parts.is_complete() {
            return vec![];
        }
        let parts_header = *parts.header();
        let bytes = match parts.assemble() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "part set assembly failed");
                return vec![];
            }
        };
        let block = match Block::decode(&bytes) {
            Ok(block) => block,
            Err(e) => {
                warn!(error = %e, "proposed block bytes do not decode");
                return vec![];
            }
        };
        // The container was created from a proposal or a quorum's block
        // id; the assembled bytes must decode to that block, not merely
        // to bytes matching the parts root.
        let Some(expected) = self.expected_hash_for(&parts_header) else {
            warn!("assembled block has no proposal or quorum anchor");
            return vec![];
        };
        if block.hash() != expected {
            warn!(
                expected = ?expected,
                got = ?block.hash(),
                "assembled block does not match its anchor"
            );
            return vec![];
        }
        debug!(block = ?block.hash(), "proposal block complete");
        self.rs.proposal_block = Some(block);
        self.after_block_complete()
    }

    fn after_block_complete(&mut self) -> Vec<Action> {
        match self.rs.step {
            RoundStep::Propose => self.enter_prevote(),
            RoundStep::Commit => self.try_finalize(),
            _ => {
                // A polka may have been waiting on this block.
                let round = self.rs.round;
                self.check_round_quorums(round)
            }
        }
    }

    fn on_vote(&mut self, vote: Vote) -> Vec<Action> {
        if vote.height != self.rs.height {
            let round = vote.round;
            let height = vote.height;
            return self.buffer_if_next_height(height, round, Event::VoteReceived { vote });
        }
        // Stash the incoming side of a potential conflict for evidence
        // construction.
        self.pending_conflict = Some(vote.clone());
        let actions = self.add_vote(vote);
        self.pending_conflict = None;
        actions
    }

    fn on_timeout(&mut self, height: u64, round: u32, step: TimeoutStep) -> Vec<Action> {
        if height != self.rs.height {
            return vec![];
        }
        match step {
            TimeoutStep::Commit => {
                if self.rs.step == RoundStep::NewHeight {
                    return self.enter_new_round(0);
                }
                vec![]
            }
            TimeoutStep::Propose => {
                if round == self.rs.round && self.rs.step == RoundStep::Propose {
                    debug!(round, "propose timeout, prevoting nil");
                    return self.enter_prevote();
                }
                vec![]
            }
            TimeoutStep::Prevote => {
                if round == self.rs.round && self.rs.step == RoundStep::PrevoteWait {
                    debug!(round, "prevote timeout, precommitting");
                    return self.enter_precommit();
                }
                vec![]
            }
            TimeoutStep::Precommit => {
                if round == self.rs.round
                    && matches!(
                        self.rs.step,
                        RoundStep::Precommit | RoundStep::PrecommitWait
                    )
                {
                    debug!(round, "precommit timeout, advancing round");
                    return self.enter_new_round(round + 1);
                }
                vec![]
            }
        }
    }

    fn on_evidence(&mut self, evidence: Evidence) -> Vec<Action> {
        let Some(vals) = self.validator_set_at(evidence.height()).cloned() else {
            trace!(
                height = evidence.height(),
                "evidence for a height whose validators we no longer hold"
            );
            return vec![];
        };
        match self
            .evidence
            .add(&self.chain.chain_id, evidence.clone(), &vals, &self.cache)
        {
            Ok(true) => vec![
                Action::PersistEvidence {
                    evidence: evidence.clone(),
                },
                Action::Broadcast {
                    message: OutboundMessage::Evidence(EvidenceGossip { evidence }),
                },
            ],
            Ok(false) => vec![],
            Err(e) => {
                warn!(error = %e, "evidence rejected");
                vec![]
            }
        }
    }

    fn on_transaction(&mut self, tx: Tx, from_client: bool) -> Vec<Action> {
        let outcome = self.mempool.lock().add_tx(tx.clone());
        match outcome {
            AddTxOutcome::Added { .. } => vec![Action::Broadcast {
                message: OutboundMessage::Transaction(TransactionGossip { tx }),
            }],
            AddTxOutcome::Rejected { code, log } if from_client => {
                debug!(code, %log, "client transaction rejected");
                vec![]
            }
            _ => vec![],
        }
    }

    fn on_block_committed(&mut self, height: u64, block: &Block) -> Vec<Action> {
        self.mempool.lock().update_committed(height, &block.data);
        vec![]
    }

    fn buffer_for_round(&mut self, round: u32, event: Event) -> Vec<Action> {
        if self.buffered.len() < MAX_BUFFERED_EVENTS {
            self.buffered.push((self.rs.height, round, event));
        }
        vec![]
    }

    /// Nodes commit at slightly different times; messages for the next
    /// height are held rather than dropped.
    fn buffer_if_next_height(&mut self, height: u64, round: u32, event: Event) -> Vec<Action> {
        if height == self.rs.height + 1 && self.buffered.len() < MAX_BUFFERED_EVENTS {
            self.buffered.push((height, round, event));
        }
        vec![]
    }
}

impl StateMachine for ConsensusState {
    fn set_now(&mut self, now: Duration) {
        self.now = now;
    }

    fn handle(&mut self, event: Event) -> Vec<Action> {
        match event {
            Event::TimeoutElapsed {
                height,
                round,
                step,
            } => self.on_timeout(height, round, step),
            Event::CleanupTimer => {
                self.evidence.prune(
                    self.chain.last_block_height,
                    self.chain.last_block_time,
                    &self.chain.consensus_params.evidence.clone(),
                );
                vec![]
            }
            Event::ProposalReceived { proposal } => self.on_proposal(proposal),
            Event::BlockPartReceived {
                height,
                round,
                part,
            } => self.on_block_part(height, round, part),
            Event::VoteReceived { vote } => self.on_vote(vote),
            Event::EvidenceReceived { evidence } => self.on_evidence(evidence),
            Event::TransactionReceived { tx } => self.on_transaction(tx, false),
            Event::SubmitTransaction { tx } => self.on_transaction(tx, true),
            Event::BlockDecided { block, commit } => self.apply_decided_block(*block, commit),
            Event::BlockCommitted { height, block } => {
                self.on_block_committed(height, block.as_ref())
            }
        }
    }
}
