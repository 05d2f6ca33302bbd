//! The verification rules.

use palisade_types::{
    Header, SignatureCache, SignedHeader, Time, TrustLevel, ValidatorSet, VerifyCommitError,
};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LightError {
    #[error("trusted header expired at {expired_at}, now {now}")]
    OldHeaderExpired { expired_at: Time, now: Time },

    #[error("new header height {got} is not above trusted height {old}")]
    HeightNotMonotonic { got: u64, old: u64 },

    #[error("headers must not be adjacent for skipping verification")]
    HeaderHeightAdjacent,

    #[error("headers must be adjacent, got {got} after {old}")]
    HeaderHeightNotAdjacent { got: u64, old: u64 },

    #[error("new header time {got} is not after trusted time {old}")]
    TimeNotMonotonic { got: Time, old: Time },

    #[error("new header time {got} exceeds now {now} plus drift {drift:?}")]
    TimeExceedsClockDrift { got: Time, now: Time, drift: Duration },

    #[error("header validators hash does not match the supplied validator set at height {height}")]
    ValidatorsMismatch { height: u64 },

    #[error("untrusted validators hash does not equal trusted next validators hash")]
    ValidatorHashMismatch,

    #[error("new validator set cannot be trusted: {0}")]
    NewValSetCantBeTrusted(VerifyCommitError),

    #[error("invalid trust level {numerator}/{denominator}")]
    InvalidTrustLevel { numerator: u64, denominator: u64 },

    #[error("invalid header: {0}")]
    InvalidHeader(String),
}

/// Parameters shared by every verification call.
#[derive(Debug, Clone, Copy)]
pub struct Options {
    /// How long a trusted header remains a usable anchor.
    pub trusting_period: Duration,
    /// The verifier's current wall-clock time.
    pub now: Time,
    /// How far into the future a new header's time may reach.
    pub max_clock_drift: Duration,
    /// Fraction of trusted power that must have signed a skipped-to
    /// header.
    pub trust_level: TrustLevel,
}

/// `true` once the trusting period for `header` has elapsed.
pub fn header_expired(header: &SignedHeader, trusting_period: Duration, now: Time) -> bool {
    let expiration = header.header.time.add(trusting_period);
    !now.is_before(expiration)
}

/// Trust levels must lie in [1/3, 1]; 1/3 is the minimum that keeps one
/// honest validator in every quorum intersection.
pub fn validate_trust_level(level: TrustLevel) -> Result<(), LightError> {
    level.validate().map_err(|_| LightError::InvalidTrustLevel {
        numerator: level.numerator,
        denominator: level.denominator,
    })
}

/// Verify `untrusted` against the trusted anchor, dispatching on
/// adjacency.
pub fn verify(
    trusted: &SignedHeader,
    trusted_vals: &ValidatorSet,
    untrusted: &SignedHeader,
    untrusted_vals: &ValidatorSet,
    options: &Options,
    cache: &SignatureCache,
) -> Result<(), LightError> {
    if untrusted.header.height != trusted.header.height + 1 {
        return verify_non_adjacent(trusted, trusted_vals, untrusted, untrusted_vals, options, cache);
    }
    verify_adjacent(trusted, untrusted, untrusted_vals, options, cache)
}

/// Verify the directly following header.
///
/// Ensures that:
///  a) `trusted` can still be trusted (else [`LightError::OldHeaderExpired`])
///  b) `untrusted` is valid
///  c) `untrusted.validators_hash` equals `trusted.next_validators_hash`
///  d) more than 2/3 of the new validators signed `untrusted`
pub fn verify_adjacent(
    trusted: &SignedHeader,
    untrusted: &SignedHeader,
    untrusted_vals: &ValidatorSet,
    options: &Options,
    cache: &SignatureCache,
) -> Result<(), LightError> {
    if untrusted.header.height != trusted.header.height + 1 {
        return Err(LightError::HeaderHeightNotAdjacent {
            got: untrusted.header.height,
            old: trusted.header.height,
        });
    }
    check_not_expired(trusted, options)?;
    verify_new_header_and_vals(untrusted, untrusted_vals, trusted, options)?;

    if untrusted.header.validators_hash != trusted.header.next_validators_hash {
        return Err(LightError::ValidatorHashMismatch);
    }

    untrusted_vals
        .verify_commit_light(
            &trusted.header.chain_id,
            &untrusted.commit.block_id,
            untrusted.header.height,
            &untrusted.commit,
            cache,
        )
        .map_err(|e| LightError::InvalidHeader(e.to_string()))?;

    debug!(
        height = untrusted.header.height,
        "adjacent header verified"
    );
    Ok(())
}

/// Verify a non-adjacent (skipped-to) header.
///
/// Ensures that:
///  a) `trusted` can still be trusted
///  b) `untrusted` is valid
///  c) at least `trust_level` of the *trusted* validators' power signed
///     `untrusted` (else [`LightError::NewValSetCantBeTrusted`])
///  d) more than 2/3 of the new validators signed `untrusted`
///
/// The 2/3 check over `untrusted_vals` runs last: that set is
/// attacker-supplied and can be made arbitrarily large, while the trusted
/// set is already bounded.
pub fn verify_non_adjacent(
    trusted: &SignedHeader,
    trusted_vals: &ValidatorSet,
    untrusted: &SignedHeader,
    untrusted_vals: &ValidatorSet,
    options: &Options,
    cache: &SignatureCache,
) -> Result<(), LightError> {
    if untrusted.header.height == trusted.header.height + 1 {
        return Err(LightError::HeaderHeightAdjacent);
    }
    check_not_expired(trusted, options)?;
    verify_new_header_and_vals(untrusted, untrusted_vals, trusted, options)?;
    validate_trust_level(options.trust_level)?;

    match trusted_vals.verify_commit_light_trusting(
        &trusted.header.chain_id,
        &untrusted.commit,
        options.trust_level,
        cache,
    ) {
        Ok(()) => {}
        Err(e @ VerifyCommitError::NotEnoughTrust { .. }) => {
            return Err(LightError::NewValSetCantBeTrusted(e));
        }
        Err(e) => return Err(LightError::InvalidHeader(e.to_string())),
    }

    untrusted_vals
        .verify_commit_light(
            &trusted.header.chain_id,
            &untrusted.commit.block_id,
            untrusted.header.height,
            &untrusted.commit,
            cache,
        )
        .map_err(|e| LightError::InvalidHeader(e.to_string()))?;

    debug!(
        from = trusted.header.height,
        to = untrusted.header.height,
        "skipping verification succeeded"
    );
    Ok(())
}

/// Verify a header one below an already-trusted one: time must regress and
/// the trusted header's `last_block_id` must point at it.
pub fn verify_backwards(untrusted: &Header, trusted: &Header) -> Result<(), LightError> {
    untrusted
        .validate_basic()
        .map_err(|e| LightError::InvalidHeader(e.to_string()))?;

    if untrusted.chain_id != trusted.chain_id {
        return Err(LightError::InvalidHeader(
            "header belongs to another chain".to_string(),
        ));
    }

    if !untrusted.time.is_before(trusted.time) {
        return Err(LightError::TimeNotMonotonic {
            got: untrusted.time,
            old: trusted.time,
        });
    }

    let expected = trusted.last_block_id.map(|id| id.hash);
    if expected != Some(untrusted.hash()) {
        return Err(LightError::InvalidHeader(format!(
            "older header hash {} does not match trusted header's last block id",
            untrusted.hash()
        )));
    }

    Ok(())
}

fn check_not_expired(trusted: &SignedHeader, options: &Options) -> Result<(), LightError> {
    if header_expired(trusted, options.trusting_period, options.now) {
        return Err(LightError::OldHeaderExpired {
            expired_at: trusted.header.time.add(options.trusting_period),
            now: options.now,
        });
    }
    Ok(())
}

fn verify_new_header_and_vals(
    untrusted: &SignedHeader,
    untrusted_vals: &ValidatorSet,
    trusted: &SignedHeader,
    options: &Options,
) -> Result<(), LightError> {
    untrusted
        .validate_basic(&trusted.header.chain_id)
        .map_err(|e| LightError::InvalidHeader(e.to_string()))?;

    if untrusted.header.height <= trusted.header.height {
        return Err(LightError::HeightNotMonotonic {
            got: untrusted.header.height,
            old: trusted.header.height,
        });
    }

    if !untrusted.header.time.is_after(trusted.header.time) {
        return Err(LightError::TimeNotMonotonic {
            got: untrusted.header.time,
            old: trusted.header.time,
        });
    }

    let drift_limit = options.now.add(options.max_clock_drift);
    if !untrusted.header.time.is_before(drift_limit) {
        return Err(LightError::TimeExceedsClockDrift {
            got: untrusted.header.time,
            now: options.now,
            drift: options.max_clock_drift,
        });
    }

    if untrusted.header.validators_hash != untrusted_vals.hash() {
        return Err(LightError::ValidatorsMismatch {
            height: untrusted.header.height,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_types::{
        Address, Block, BlockId, Commit, CommitSig, Hash, Keypair, PartSetHeader, Validator,
        VoteType,
    };

    const CHAIN_ID: &str = "light-test";

    /// A chain fixture: headers signed height by height, with optional
    /// validator set changes.
    struct Chain {
        keys: Vec<Keypair>,
        vals: ValidatorSet,
        headers: Vec<SignedHeader>,
    }

    fn make_vals(seeds: std::ops::Range<u8>, power: i64) -> (Vec<Keypair>, ValidatorSet) {
        let keys: Vec<Keypair> = seeds.map(|i| Keypair::from_seed([i; 32])).collect();
        let vals = ValidatorSet::new(
            keys.iter()
                .map(|k| Validator::new(k.public_key(), power))
                .collect(),
        )
        .unwrap();
        (keys, vals)
    }

    fn make_header(
        height: u64,
        time_ms: u64,
        vals: &ValidatorSet,
        next_vals: &ValidatorSet,
        last_block_id: Option<BlockId>,
    ) -> Header {
        Header {
            chain_id: CHAIN_ID.to_string(),
            height,
            time: Time::from_millis(time_ms),
            last_block_id,
            last_commit_hash: Block::last_commit_hash(&None),
            data_hash: Block::data_hash(&[]),
            validators_hash: vals.hash(),
            next_validators_hash: next_vals.hash(),
            consensus_hash: Hash::sum(b"params"),
            app_hash: Vec::new(),
            last_results_hash: Hash::sum(b"results"),
            evidence_hash: Block::evidence_hash(&[]),
            proposer_address: vals.proposer().address,
        }
    }

    fn sign_header(header: Header, keys: &[Keypair], vals: &ValidatorSet) -> SignedHeader {
        let block_id = BlockId {
            hash: header.hash(),
            part_set_header: PartSetHeader {
                total: 1,
                hash: Hash::sum(b"parts"),
            },
        };
        let by_address: std::collections::HashMap<Address, &Keypair> =
            keys.iter().map(|k| (k.address(), k)).collect();
        let mut commit = Commit {
            height: header.height,
            round: 0,
            block_id,
            signatures: Vec::new(),
        };
        commit.signatures = vals
            .iter()
            .map(|val| match by_address.get(&val.address) {
                None => CommitSig::Absent,
                Some(kp) => {
                    let ts = Time::from_millis(header.time.as_millis() + 10);
                    let vote = palisade_types::Vote {
                        vote_type: VoteType::Precommit,
                        height: header.height,
                        round: 0,
                        block_id: Some(block_id),
                        timestamp: ts,
                        validator_address: val.address,
                        validator_index: 0,
                        signature: palisade_types::Signature::zero(),
                        extension: Vec::new(),
                        extension_signature: None,
                    };
                    CommitSig::Commit {
                        validator_address: val.address,
                        timestamp: ts,
                        signature: kp.sign(&vote.sign_bytes(CHAIN_ID)),
                    }
                }
            })
            .collect();
        SignedHeader { header, commit }
    }

    impl Chain {
        fn new() -> Chain {
            let (keys, vals) = make_vals(0..4, 10);
            Chain {
                keys,
                vals,
                headers: Vec::new(),
            }
        }

        /// Extend to `height` with an unchanged validator set.
        fn extend_to(&mut self, height: u64) {
            let start = self
                .headers
                .last()
                .map(|h| h.header.height + 1)
                .unwrap_or(1);
            for h in start..=height {
                let last_block_id = self.headers.last().map(|prev| BlockId {
                    hash: prev.header.hash(),
                    part_set_header: PartSetHeader {
                        total: 1,
                        hash: Hash::sum(b"parts"),
                    },
                });
                let header = make_header(h, h * 1_000, &self.vals, &self.vals, last_block_id);
                self.headers
                    .push(sign_header(header, &self.keys, &self.vals));
            }
        }

        fn at(&self, height: u64) -> &SignedHeader {
            self.headers
                .iter()
                .find(|h| h.header.height == height)
                .expect("height exists")
        }
    }

    fn options(now_ms: u64) -> Options {
        Options {
            trusting_period: Duration::from_secs(3600),
            now: Time::from_millis(now_ms),
            max_clock_drift: Duration::from_secs(10),
            trust_level: TrustLevel::ONE_THIRD,
        }
    }

    #[test]
    fn adjacent_verification_succeeds() {
        let mut chain = Chain::new();
        chain.extend_to(2);
        let cache = SignatureCache::default();
        verify(
            chain.at(1),
            &chain.vals,
            chain.at(2),
            &chain.vals,
            &options(10_000),
            &cache,
        )
        .unwrap();
    }

    #[test]
    fn skipping_verification_succeeds_for_every_distance() {
        let mut chain = Chain::new();
        chain.extend_to(12);
        let cache = SignatureCache::default();
        for target in 3..=12u64 {
            verify(
                chain.at(1),
                &chain.vals,
                chain.at(target),
                &chain.vals,
                &options(20_000),
                &cache,
            )
            .unwrap_or_else(|e| panic!("verify 1 -> {target}: {e}"));
        }
    }

    #[test]
    fn expired_anchor_is_rejected() {
        let mut chain = Chain::new();
        chain.extend_to(2);
        let cache = SignatureCache::default();
        let mut opts = options(10_000);
        // Header time is 1s; an hour-long trusting period expires at
        // 3_601_000ms.
        opts.now = Time::from_millis(4_000_000);
        assert!(matches!(
            verify(chain.at(1), &chain.vals, chain.at(2), &chain.vals, &opts, &cache),
            Err(LightError::OldHeaderExpired { .. })
        ));
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let mut chain = Chain::new();
        chain.extend_to(2);
        let cache = SignatureCache::default();
        let mut target = chain.at(2).clone();
        // Flip one bit in one signature.
        if let CommitSig::Commit { signature, .. } = &mut target.commit.signatures[0] {
            let mut bytes: [u8; 64] = signature.as_bytes().try_into().unwrap();
            bytes[10] ^= 0x40;
            *signature = palisade_types::Signature::Ed25519(bytes);
        }
        assert!(verify(
            chain.at(1),
            &chain.vals,
            &target,
            &chain.vals,
            &options(10_000),
            &cache
        )
        .is_err());
    }

    #[test]
    fn future_header_time_is_rejected() {
        let mut chain = Chain::new();
        chain.extend_to(5);
        let cache = SignatureCache::default();
        // now = 2s; header 5 is at 5s, more than 10s drift would allow...
        let mut opts = options(2_000);
        opts.max_clock_drift = Duration::from_secs(1);
        assert!(matches!(
            verify(chain.at(1), &chain.vals, chain.at(5), &chain.vals, &opts, &cache),
            Err(LightError::TimeExceedsClockDrift { .. })
        ));
    }

    #[test]
    fn adjacent_requires_next_validators_hash_chain() {
        let mut chain = Chain::new();
        chain.extend_to(2);
        let cache = SignatureCache::default();

        // Re-sign header 2 with a different validator set: the
        // next-validators link from header 1 must break.
        let (other_keys, other_vals) = make_vals(10..14, 10);
        let header = make_header(2, 2_000, &other_vals, &other_vals, None);
        let forged = sign_header(header, &other_keys, &other_vals);

        assert!(matches!(
            verify_adjacent(chain.at(1), &forged, &other_vals, &options(10_000), &cache),
            Err(LightError::ValidatorHashMismatch)
        ));
    }

    #[test]
    fn skipping_rejects_untrustable_new_set() {
        // Trusted set at height 1; by height 100 the validators rotated
        // out entirely, so no trusted power signs the new commit.
        let (old_keys, old_vals) = make_vals(0..4, 10);
        let (new_keys, new_vals) = make_vals(10..14, 10);

        let header1 = make_header(1, 1_000, &old_vals, &old_vals, None);
        let trusted = sign_header(header1, &old_keys, &old_vals);

        let header100 = make_header(100, 100_000, &new_vals, &new_vals, None);
        let untrusted = sign_header(header100, &new_keys, &new_vals);

        let cache = SignatureCache::default();
        assert!(matches!(
            verify_non_adjacent(
                &trusted,
                &old_vals,
                &untrusted,
                &new_vals,
                &options(200_000),
                &cache
            ),
            Err(LightError::NewValSetCantBeTrusted(_))
        ));
    }

    #[test]
    fn skipping_accepts_one_third_overlap() {
        // 2 of 6 old validators (one third of power) survive into the new
        // set and sign the new header.
        let (old_keys, old_vals) = make_vals(0..6, 10);
        let mut new_keys: Vec<Keypair> = old_keys[..2].to_vec();
        let (fresh_keys, _) = make_vals(20..24, 10);
        new_keys.extend(fresh_keys);
        let new_vals = ValidatorSet::new(
            new_keys
                .iter()
                .map(|k| Validator::new(k.public_key(), 10))
                .collect(),
        )
        .unwrap();

        let header1 = make_header(1, 1_000, &old_vals, &old_vals, None);
        let trusted = sign_header(header1, &old_keys, &old_vals);
        let header50 = make_header(50, 50_000, &new_vals, &new_vals, None);
        let untrusted = sign_header(header50, &new_keys, &new_vals);

        let cache = SignatureCache::default();
        verify_non_adjacent(
            &trusted,
            &old_vals,
            &untrusted,
            &new_vals,
            &options(60_000),
            &cache,
        )
        .unwrap();

        // Demanding more trust than the overlap provides fails.
        let mut strict = options(60_000);
        strict.trust_level = TrustLevel {
            numerator: 2,
            denominator: 3,
        };
        assert!(matches!(
            verify_non_adjacent(
                &trusted,
                &old_vals,
                &untrusted,
                &new_vals,
                &strict,
                &cache
            ),
            Err(LightError::NewValSetCantBeTrusted(_))
        ));
    }

    #[test]
    fn trust_level_bounds() {
        for (n, d, ok) in [
            (1u64, 3u64, true),
            (1, 1, true),
            (2, 3, true),
            (1, 4, false),
            (0, 1, false),
            (1, 0, false),
            (3, 2, false),
        ] {
            let level = TrustLevel {
                numerator: n,
                denominator: d,
            };
            assert_eq!(validate_trust_level(level).is_ok(), ok, "{n}/{d}");
        }
    }

    #[test]
    fn backwards_verification() {
        let mut chain = Chain::new();
        chain.extend_to(3);

        verify_backwards(&chain.at(2).header, &chain.at(3).header).unwrap();

        // Chain id mismatch.
        let mut foreign = chain.at(2).header.clone();
        foreign.chain_id = "other-chain".to_string();
        assert!(verify_backwards(&foreign, &chain.at(3).header).is_err());

        // Hash mismatch: header 1 is not header 3's parent.
        assert!(verify_backwards(&chain.at(1).header, &chain.at(3).header).is_err());
    }
}
