//! Pending evidence awaiting inclusion in a block.

use palisade_types::{
    Evidence, EvidenceError, EvidenceParams, Hash, SignatureCache, Time, ValidatorSet,
};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// Verified, not-yet-committed evidence.
///
/// Evidence enters either locally (a conflicting vote we observed) or via
/// gossip; both paths verify before pooling. Committed evidence is
/// remembered by hash so replays are dropped, and everything ages out of
/// the pool once outside the inclusion window.
#[derive(Debug, Default)]
pub struct EvidencePool {
    pending: HashMap<Hash, Evidence>,
    committed: HashSet<Hash>,
}

impl EvidencePool {
    pub fn new() -> Self {
        EvidencePool::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.pending.contains_key(hash) || self.committed.contains(hash)
    }

    /// Verify and pool a piece of evidence.
    ///
    /// `vals` must be the validator set at the evidence's height. Returns
    /// `Ok(true)` when the evidence is new.
    pub fn add(
        &mut self,
        chain_id: &str,
        evidence: Evidence,
        vals: &ValidatorSet,
        cache: &SignatureCache,
    ) -> Result<bool, EvidenceError> {
        let hash = evidence.hash();
        if self.contains(&hash) {
            return Ok(false);
        }
        match &evidence {
            Evidence::DuplicateVote(ev) => ev.verify(chain_id, vals, cache)?,
            Evidence::LightClientAttack(ev) => ev.verify(chain_id, vals, cache)?,
        }
        info!(?hash, height = evidence.height(), "evidence pooled");
        self.pending.insert(hash, evidence);
        Ok(true)
    }

    /// Pool already-verified evidence (our own observation or restart
    /// recovery).
    pub fn add_verified(&mut self, evidence: Evidence) -> bool {
        let hash = evidence.hash();
        if self.contains(&hash) {
            return false;
        }
        self.pending.insert(hash, evidence);
        true
    }

    /// Pending evidence for a block proposal, bounded by encoded size.
    /// Deterministic order: by height, then hash.
    pub fn pending_for_block(&self, max_bytes: i64) -> Vec<Evidence> {
        use palisade_types::wire::WireEncode;
        let mut items: Vec<(&Hash, &Evidence)> = self.pending.iter().collect();
        items.sort_by_key(|(hash, ev)| (ev.height(), **hash));

        let mut out = Vec::new();
        let mut total: i64 = 0;
        for (_, ev) in items {
            let size = ev.encode().len() as i64;
            if max_bytes > 0 && total + size > max_bytes {
                break;
            }
            total += size;
            out.push(ev.clone());
        }
        out
    }

    /// A block committed carrying `included`; drop them from pending and
    /// remember them so they cannot be pooled again.
    pub fn mark_committed(&mut self, included: &[Evidence]) {
        for ev in included {
            let hash = ev.hash();
            self.pending.remove(&hash);
            self.committed.insert(hash);
        }
    }

    /// Drop pending evidence that is no longer includable.
    pub fn prune(&mut self, committed_height: u64, committed_time: Time, params: &EvidenceParams) {
        let before = self.pending.len();
        self.pending.retain(|_, ev| {
            !ev.is_expired(
                committed_height,
                committed_time,
                params.max_age_num_blocks,
                params.max_age_duration_ms,
            )
        });
        let dropped = before - self.pending.len();
        if dropped > 0 {
            debug!(dropped, committed_height, "expired evidence pruned");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_types::test_utils::test_validator_set;
    use palisade_types::{
        BlockId, DuplicateVoteEvidence, Keypair, PartSetHeader, Signature, Vote, VoteType,
    };

    const CHAIN: &str = "evidence-test";

    fn block_id(seed: u8) -> Option<BlockId> {
        Some(BlockId {
            hash: Hash::sum(&[seed]),
            part_set_header: PartSetHeader {
                total: 1,
                hash: Hash::sum(&[seed, 1]),
            },
        })
    }

    fn signed_vote(kp: &Keypair, height: u64, id: Option<BlockId>) -> Vote {
        let mut vote = Vote {
            vote_type: VoteType::Precommit,
            height,
            round: 0,
            block_id: id,
            timestamp: Time::from_millis(height * 100),
            validator_address: kp.address(),
            validator_index: 0,
            signature: Signature::zero(),
            extension: Vec::new(),
            extension_signature: None,
        };
        vote.signature = kp.sign(&vote.sign_bytes(CHAIN));
        vote
    }

    fn duplicate_vote_evidence(kp: &Keypair, height: u64) -> Evidence {
        let a = signed_vote(kp, height, block_id(1));
        let b = signed_vote(kp, height, block_id(2));
        Evidence::DuplicateVote(
            DuplicateVoteEvidence::new(a, b, 40, 10, Time::from_millis(height * 100)).unwrap(),
        )
    }

    #[test]
    fn add_verify_dedupe() {
        let (keys, vals) = test_validator_set(4, 10);
        let mut pool = EvidencePool::new();
        let cache = SignatureCache::default();
        let ev = duplicate_vote_evidence(&keys[0], 5);

        assert!(pool.add(CHAIN, ev.clone(), &vals, &cache).unwrap());
        assert!(!pool.add(CHAIN, ev.clone(), &vals, &cache).unwrap());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn invalid_evidence_is_refused() {
        let (keys, vals) = test_validator_set(2, 10);
        let mut pool = EvidencePool::new();
        let cache = SignatureCache::default();

        // Votes from a validator outside the set.
        let outsider = Keypair::from_seed([99; 32]);
        let ev = duplicate_vote_evidence(&outsider, 5);
        assert!(pool.add(CHAIN, ev, &vals, &cache).is_err());
        assert!(pool.is_empty());
        let _ = keys;
    }

    #[test]
    fn committed_evidence_never_returns() {
        let (keys, _) = test_validator_set(4, 10);
        let mut pool = EvidencePool::new();
        let ev = duplicate_vote_evidence(&keys[1], 3);

        assert!(pool.add_verified(ev.clone()));
        pool.mark_committed(&[ev.clone()]);
        assert!(pool.is_empty());
        // Replay after commit is dropped.
        assert!(!pool.add_verified(ev));
        assert!(pool.is_empty());
    }

    #[test]
    fn pending_is_deterministic_and_bounded() {
        let (keys, _) = test_validator_set(4, 10);
        let mut pool = EvidencePool::new();
        for (i, kp) in keys.iter().enumerate() {
            pool.add_verified(duplicate_vote_evidence(kp, (4 - i) as u64));
        }

        let all = pool.pending_for_block(0);
        assert_eq!(all.len(), 4);
        let heights: Vec<u64> = all.iter().map(|e| e.height()).collect();
        let mut sorted = heights.clone();
        sorted.sort_unstable();
        assert_eq!(heights, sorted, "evidence ordered by height");

        use palisade_types::wire::WireEncode;
        let one_size = all[0].encode().len() as i64;
        let bounded = pool.pending_for_block(one_size * 2);
        assert_eq!(bounded.len(), 2);
    }

    #[test]
    fn prune_drops_only_fully_expired() {
        let (keys, _) = test_validator_set(2, 10);
        let mut pool = EvidencePool::new();
        pool.add_verified(duplicate_vote_evidence(&keys[0], 1));
        pool.add_verified(duplicate_vote_evidence(&keys[1], 90));

        let params = EvidenceParams {
            max_age_num_blocks: 20,
            max_age_duration_ms: 1_000,
            max_bytes: 1024 * 1024,
        };
        // At height 100 / t=1h, evidence from height 1 is out of both
        // windows; height 90 is inside the block window.
        pool.prune(100, Time::from_millis(3_600_000), &params);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.pending_for_block(0)[0].height(), 90);
    }
}
