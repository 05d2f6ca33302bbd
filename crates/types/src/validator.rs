//! Validators, validator sets, proposer rotation, and commit verification.

use crate::block::BlockId;
use crate::commit::{Commit, CommitSig};
use crate::crypto::{PublicKey, SignatureCache};
use crate::hash::{Address, Hash};
use crate::merkle::hash_from_byte_slices;
use crate::wire;
use std::cmp::Ordering;
use std::collections::HashSet;
use thiserror::Error;

/// Cap on a set's total power, leaving headroom so priority arithmetic
/// cannot overflow i64.
pub const MAX_TOTAL_VOTING_POWER: i64 = i64::MAX / 8;

/// Proposer priorities are clipped to ±(this factor × total power).
pub const PRIORITY_WINDOW_SIZE_FACTOR: i64 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidatorSetError {
    #[error("validator set is empty")]
    Empty,

    #[error("validator {0} has non-positive voting power")]
    NonPositivePower(Address),

    #[error("duplicate validator address {0}")]
    DuplicateAddress(Address),

    #[error("total voting power {0} exceeds maximum {MAX_TOTAL_VOTING_POWER}")]
    TotalPowerOverflow(i128),

    #[error("update removes unknown validator {0}")]
    RemoveNonExistent(Address),

    #[error("update power {power} for {address} is negative")]
    NegativeUpdatePower { address: Address, power: i64 },

    #[error("duplicate update for {0}")]
    DuplicateUpdate(Address),

    #[error("validator set would be empty after update")]
    EmptyAfterUpdate,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyCommitError {
    #[error("commit is for height {got}, want {want}")]
    HeightMismatch { got: u64, want: u64 },

    #[error("commit is for a different block")]
    BlockIdMismatch,

    #[error("commit has {got} signature slots, validator set has {want}")]
    SignatureCountMismatch { got: usize, want: usize },

    #[error("invalid signature in slot {slot}")]
    InvalidSignature { slot: usize },

    #[error("signature slot {slot} names {got}, validator set has {want} there")]
    WrongValidatorInSlot { slot: usize, got: Address, want: Address },

    #[error("insufficient voting power: have {have}, need more than {need}")]
    NotEnoughPower { have: i64, need: i64 },

    #[error("insufficient trusted power: have {have}, need more than {need}")]
    NotEnoughTrust { have: i64, need: i64 },

    #[error("invalid trust level {numerator}/{denominator}, must be in [1/3, 1]")]
    InvalidTrustLevel { numerator: u64, denominator: u64 },
}

/// The fraction of a trusted validator set that must have signed a new
/// commit for skipping verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrustLevel {
    pub numerator: u64,
    pub denominator: u64,
}

impl TrustLevel {
    /// One third: a single honest signer in the overlap suffices.
    pub const ONE_THIRD: TrustLevel = TrustLevel {
        numerator: 1,
        denominator: 3,
    };

    /// Valid levels lie in [1/3, 1] with a non-zero denominator.
    pub fn validate(&self) -> Result<(), VerifyCommitError> {
        if self.denominator == 0
            || self.numerator * 3 < self.denominator
            || self.numerator > self.denominator
        {
            return Err(VerifyCommitError::InvalidTrustLevel {
                numerator: self.numerator,
                denominator: self.denominator,
            });
        }
        Ok(())
    }
}

/// One voting member of the network.
///
/// Everything but `proposer_priority` is immutable after construction; the
/// priority is bookkeeping for the weighted round-robin and never hashed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validator {
    pub address: Address,
    pub pub_key: PublicKey,
    pub voting_power: i64,
    pub proposer_priority: i64,
}

impl Validator {
    pub fn new(pub_key: PublicKey, voting_power: i64) -> Self {
        Validator {
            address: pub_key.address(),
            pub_key,
            voting_power,
            proposer_priority: 0,
        }
    }

    /// Canonical bytes hashed into the set's Merkle root: key tag, key
    /// bytes, power. Priorities are excluded so rotation does not change
    /// the hash.
    fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        wire::write_string(&mut out, self.pub_key.type_tag());
        wire::write_bytes(&mut out, self.pub_key.as_bytes());
        wire::write_svarint(&mut out, self.voting_power);
        out
    }

    /// Higher priority wins; ties break toward the lower address.
    fn compare_proposer_priority(&self, other: &Validator) -> Ordering {
        other
            .proposer_priority
            .cmp(&self.proposer_priority)
            .then_with(|| self.address.cmp(&other.address))
    }
}

/// A power-change instruction emitted by the application.
///
/// `power == 0` removes the validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorUpdate {
    pub pub_key: PublicKey,
    pub power: i64,
}

/// An ordered validator set for one height.
///
/// Validators are kept sorted by (descending power, ascending address); the
/// hash, commit signature slots, and vote indices all refer to this order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorSet {
    validators: Vec<Validator>,
    total_voting_power: i64,
}

impl ValidatorSet {
    pub fn new(validators: Vec<Validator>) -> Result<Self, ValidatorSetError> {
        if validators.is_empty() {
            return Err(ValidatorSetError::Empty);
        }
        let mut set = ValidatorSet {
            validators,
            total_voting_power: 0,
        };
        set.sort_and_recompute()?;
        Ok(set)
    }

    fn sort_and_recompute(&mut self) -> Result<(), ValidatorSetError> {
        let mut seen = HashSet::with_capacity(self.validators.len());
        let mut total: i128 = 0;
        for val in &self.validators {
            if val.voting_power <= 0 {
                return Err(ValidatorSetError::NonPositivePower(val.address));
            }
            if !seen.insert(val.address) {
                return Err(ValidatorSetError::DuplicateAddress(val.address));
            }
            total += i128::from(val.voting_power);
        }
        if total > i128::from(MAX_TOTAL_VOTING_POWER) {
            return Err(ValidatorSetError::TotalPowerOverflow(total));
        }
        self.validators.sort_by(|a, b| {
            b.voting_power
                .cmp(&a.voting_power)
                .then_with(|| a.address.cmp(&b.address))
        });
        self.total_voting_power = total as i64;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Validator> {
        self.validators.iter()
    }

    pub fn total_voting_power(&self) -> i64 {
        self.total_voting_power
    }

    pub fn get_by_index(&self, index: u32) -> Option<&Validator> {
        self.validators.get(index as usize)
    }

    pub fn get_by_address(&self, address: &Address) -> Option<(u32, &Validator)> {
        self.validators
            .iter()
            .enumerate()
            .find(|(_, v)| v.address == *address)
            .map(|(i, v)| (i as u32, v))
    }

    pub fn has_address(&self, address: &Address) -> bool {
        self.get_by_address(address).is_some()
    }

    /// Does `power` exceed two thirds of the set's total?
    pub fn has_two_thirds(&self, power: i64) -> bool {
        i128::from(power) * 3 > i128::from(self.total_voting_power) * 2
    }

    /// Does `power` reach at least one third of the set's total?
    pub fn has_one_third(&self, power: i64) -> bool {
        i128::from(power) * 3 >= i128::from(self.total_voting_power)
    }

    /// Merkle root over canonical validator encodings, in set order.
    pub fn hash(&self) -> Hash {
        let items: Vec<Vec<u8>> = self.validators.iter().map(|v| v.canonical_bytes()).collect();
        hash_from_byte_slices(&items)
    }

    /// The current proposer: highest priority, ties toward lower address.
    pub fn proposer(&self) -> &Validator {
        self.validators
            .iter()
            .min_by(|a, b| a.compare_proposer_priority(b))
            .expect("validator set is never empty")
    }

    /// Advance the weighted round-robin `times` steps.
    ///
    /// Each step adds every validator's power to its priority, selects the
    /// maximum as proposer, and subtracts the total power from the winner.
    /// Before stepping, priorities are clipped to a window of
    /// ±[`PRIORITY_WINDOW_SIZE_FACTOR`]·total and centred on their average,
    /// which bounds the state without changing rotation order.
    pub fn increment_proposer_priority(&mut self, times: u32) {
        let diff_max = PRIORITY_WINDOW_SIZE_FACTOR.saturating_mul(self.total_voting_power);
        self.rescale_priorities(diff_max);
        self.shift_by_avg_proposer_priority();
        for _ in 0..times {
            self.increment_once();
        }
    }

    /// Clone-and-advance; the receiver stays at its current position.
    pub fn copy_increment_proposer_priority(&self, times: u32) -> ValidatorSet {
        let mut copy = self.clone();
        copy.increment_proposer_priority(times);
        copy
    }

    fn increment_once(&mut self) {
        for val in &mut self.validators {
            val.proposer_priority = val
                .proposer_priority
                .checked_add(val.voting_power)
                .expect("priorities are clipped before incrementing");
        }
        let winner = self
            .validators
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.compare_proposer_priority(b))
            .map(|(i, _)| i)
            .expect("validator set is never empty");
        self.validators[winner].proposer_priority -= self.total_voting_power;
    }

    /// Scale all priorities down so max-min fits in `diff_max`.
    fn rescale_priorities(&mut self, diff_max: i64) {
        if diff_max == 0 {
            return;
        }
        let max = self
            .validators
            .iter()
            .map(|v| v.proposer_priority)
            .max()
            .unwrap_or(0);
        let min = self
            .validators
            .iter()
            .map(|v| v.proposer_priority)
            .min()
            .unwrap_or(0);
        let diff = (i128::from(max) - i128::from(min)).unsigned_abs();
        let diff_max_u = diff_max.unsigned_abs() as u128;
        if diff > diff_max_u {
            let ratio = (diff + diff_max_u - 1) / diff_max_u;
            let ratio = ratio as i64;
            for val in &mut self.validators {
                val.proposer_priority /= ratio;
            }
        }
    }

    /// Centre priorities on zero so they cannot drift in one direction.
    fn shift_by_avg_proposer_priority(&mut self) {
        let sum: i128 = self
            .validators
            .iter()
            .map(|v| i128::from(v.proposer_priority))
            .sum();
        let avg = (sum / self.validators.len() as i128) as i64;
        for val in &mut self.validators {
            val.proposer_priority -= avg;
        }
    }

    /// Apply power diffs from the application.
    ///
    /// `power == 0` removes; removing an unknown validator is an error.
    /// Surviving validators keep their priorities, new validators start
    /// low enough that they cannot immediately propose, and the whole set
    /// is re-centred and clipped afterwards.
    pub fn update_with(&mut self, updates: &[ValidatorUpdate]) -> Result<(), ValidatorSetError> {
        let mut seen = HashSet::with_capacity(updates.len());
        for update in updates {
            let address = update.pub_key.address();
            if update.power < 0 {
                return Err(ValidatorSetError::NegativeUpdatePower {
                    address,
                    power: update.power,
                });
            }
            if !seen.insert(address) {
                return Err(ValidatorSetError::DuplicateUpdate(address));
            }
            if update.power == 0 && !self.has_address(&address) {
                return Err(ValidatorSetError::RemoveNonExistent(address));
            }
        }

        // Work on a copy so a failed update leaves the set untouched.
        let mut validators = self.validators.clone();
        for update in updates {
            let address = update.pub_key.address();
            if update.power == 0 {
                validators.retain(|v| v.address != address);
            } else if let Some(existing) = validators.iter_mut().find(|v| v.address == address) {
                existing.voting_power = update.power;
            } else {
                // New validators enter with a priority debt so an adversary
                // cannot grind keys to become the very next proposer.
                let mut val = Validator::new(update.pub_key, update.power);
                val.proposer_priority =
                    -(self.total_voting_power + (self.total_voting_power >> 3));
                validators.push(val);
            }
        }
        if validators.is_empty() {
            return Err(ValidatorSetError::EmptyAfterUpdate);
        }

        let mut updated = ValidatorSet {
            validators,
            total_voting_power: 0,
        };
        updated.sort_and_recompute()?;
        let diff_max = PRIORITY_WINDOW_SIZE_FACTOR.saturating_mul(updated.total_voting_power);
        updated.rescale_priorities(diff_max);
        updated.shift_by_avg_proposer_priority();
        *self = updated;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════
    // Commit verification
    // ═══════════════════════════════════════════════════════════════════

    /// Full verification used when committing a block: the commit must be
    /// for the expected block and height, every present signature must be
    /// valid and sit in its own validator's slot, and the block signatures
    /// must sum to more than two thirds of the set.
    pub fn verify_commit(
        &self,
        chain_id: &str,
        block_id: &BlockId,
        height: u64,
        commit: &Commit,
        cache: &SignatureCache,
    ) -> Result<(), VerifyCommitError> {
        self.check_commit_shape(block_id, height, commit)?;
        let mut tallied: i64 = 0;
        for (slot, sig) in commit.signatures.iter().enumerate() {
            let Some(val) = self.check_slot(commit, slot, sig, chain_id, cache)? else {
                continue;
            };
            if sig.is_commit() {
                tallied += val.voting_power;
            }
        }
        if !self.has_two_thirds(tallied) {
            return Err(VerifyCommitError::NotEnoughPower {
                have: tallied,
                need: self.total_voting_power * 2 / 3,
            });
        }
        Ok(())
    }

    /// Light verification: only signatures *for the block* are checked, and
    /// checking stops as soon as two thirds is exceeded. Nil and absent
    /// slots never count, so skipping them cannot inflate the tally.
    pub fn verify_commit_light(
        &self,
        chain_id: &str,
        block_id: &BlockId,
        height: u64,
        commit: &Commit,
        cache: &SignatureCache,
    ) -> Result<(), VerifyCommitError> {
        self.check_commit_shape(block_id, height, commit)?;
        let mut tallied: i64 = 0;
        for (slot, sig) in commit.signatures.iter().enumerate() {
            if !sig.is_commit() {
                continue;
            }
            let Some(val) = self.check_slot(commit, slot, sig, chain_id, cache)? else {
                continue;
            };
            tallied += val.voting_power;
            if self.has_two_thirds(tallied) {
                return Ok(());
            }
        }
        Err(VerifyCommitError::NotEnoughPower {
            have: tallied,
            need: self.total_voting_power * 2 / 3,
        })
    }

    /// Trusting verification for light-client skipping: sum the power of
    /// *this* (trusted) set's validators whose commit signatures check out,
    /// and require at least `trust_level` of this set's total.
    ///
    /// The commit belongs to a different (newer) height, so slots are
    /// matched by address rather than index.
    pub fn verify_commit_light_trusting(
        &self,
        chain_id: &str,
        commit: &Commit,
        trust_level: TrustLevel,
        cache: &SignatureCache,
    ) -> Result<(), VerifyCommitError> {
        trust_level.validate()?;

        // ceil(total * num / den): "at least" the fraction.
        let total = i128::from(self.total_voting_power);
        let needed =
            (total * i128::from(trust_level.numerator) + i128::from(trust_level.denominator) - 1)
                / i128::from(trust_level.denominator);
        let needed = needed as i64;

        let mut tallied: i64 = 0;
        let mut seen = HashSet::new();
        for (slot, sig) in commit.signatures.iter().enumerate() {
            if !sig.is_commit() {
                continue;
            }
            let address = sig.validator_address().expect("commit sig has an address");
            // A Byzantine commit could name the same validator twice.
            if !seen.insert(address) {
                continue;
            }
            let Some((_, val)) = self.get_by_address(&address) else {
                continue;
            };
            let sign_bytes = commit
                .vote_sign_bytes(chain_id, slot)
                .expect("commit slot is present");
            let CommitSig::Commit { signature, .. } = sig else {
                unreachable!("filtered to commit sigs");
            };
            cache
                .verify(&val.pub_key, &sign_bytes, signature)
                .map_err(|_| VerifyCommitError::InvalidSignature { slot })?;
            tallied += val.voting_power;
            if tallied >= needed {
                return Ok(());
            }
        }
        Err(VerifyCommitError::NotEnoughTrust {
            have: tallied,
            need: needed,
        })
    }

    fn check_commit_shape(
        &self,
        block_id: &BlockId,
        height: u64,
        commit: &Commit,
    ) -> Result<(), VerifyCommitError> {
        if commit.height != height {
            return Err(VerifyCommitError::HeightMismatch {
                got: commit.height,
                want: height,
            });
        }
        if commit.block_id != *block_id {
            return Err(VerifyCommitError::BlockIdMismatch);
        }
        if commit.signatures.len() != self.validators.len() {
            return Err(VerifyCommitError::SignatureCountMismatch {
                got: commit.signatures.len(),
                want: self.validators.len(),
            });
        }
        Ok(())
    }

    /// Verify one commit slot against the validator at the same index.
    /// Returns the validator for present slots, `None` for absent ones.
    fn check_slot<'a>(
        &'a self,
        commit: &Commit,
        slot: usize,
        sig: &CommitSig,
        chain_id: &str,
        cache: &SignatureCache,
    ) -> Result<Option<&'a Validator>, VerifyCommitError> {
        let (address, signature) = match sig {
            CommitSig::Absent => return Ok(None),
            CommitSig::Nil {
                validator_address,
                signature,
                ..
            }
            | CommitSig::Commit {
                validator_address,
                signature,
                ..
            } => (*validator_address, signature),
        };
        let val = &self.validators[slot];
        if val.address != address {
            return Err(VerifyCommitError::WrongValidatorInSlot {
                slot,
                got: address,
                want: val.address,
            });
        }
        let sign_bytes = commit
            .vote_sign_bytes(chain_id, slot)
            .expect("slot is present");
        cache
            .verify(&val.pub_key, &sign_bytes, signature)
            .map_err(|_| VerifyCommitError::InvalidSignature { slot })?;
        Ok(Some(val))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::part_set::PartSetHeader;
    use crate::time::Time;
    use crate::vote::{canonical_vote_bytes, VoteType};
    use crate::Keypair;
    use std::collections::HashMap;

    fn keypairs(n: u8) -> Vec<Keypair> {
        (0..n).map(|i| Keypair::from_seed([i; 32])).collect()
    }

    fn set_with_powers(keys: &[Keypair], powers: &[i64]) -> ValidatorSet {
        ValidatorSet::new(
            keys.iter()
                .zip(powers)
                .map(|(k, p)| Validator::new(k.public_key(), *p))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn construction_sorts_and_validates() {
        let keys = keypairs(3);
        let set = set_with_powers(&keys, &[5, 50, 20]);
        let powers: Vec<i64> = set.iter().map(|v| v.voting_power).collect();
        assert_eq!(powers, vec![50, 20, 5]);
        assert_eq!(set.total_voting_power(), 75);
    }

    #[test]
    fn construction_rejects_bad_sets() {
        assert_eq!(ValidatorSet::new(vec![]), Err(ValidatorSetError::Empty));

        let keys = keypairs(1);
        assert!(matches!(
            ValidatorSet::new(vec![Validator::new(keys[0].public_key(), 0)]),
            Err(ValidatorSetError::NonPositivePower(_))
        ));

        assert!(matches!(
            ValidatorSet::new(vec![
                Validator::new(keys[0].public_key(), 5),
                Validator::new(keys[0].public_key(), 7),
            ]),
            Err(ValidatorSetError::DuplicateAddress(_))
        ));
    }

    #[test]
    fn hash_is_order_stable_and_priority_free() {
        let keys = keypairs(3);
        let a = set_with_powers(&keys, &[10, 20, 30]);
        let mut b = a.clone();
        b.increment_proposer_priority(5);
        // Rotation must not change the hash.
        assert_eq!(a.hash(), b.hash());

        let c = set_with_powers(&keys, &[10, 20, 31]);
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn two_thirds_threshold_is_strict() {
        let keys = keypairs(3);
        let set = set_with_powers(&keys, &[1, 1, 1]);
        assert!(!set.has_two_thirds(2));
        assert!(set.has_two_thirds(3));

        let set = set_with_powers(&keys, &[2, 2, 2]);
        assert!(!set.has_two_thirds(4));
        assert!(set.has_two_thirds(5));
    }

    #[test]
    fn equal_stake_rotation_is_round_robin() {
        let keys = keypairs(4);
        let mut set = set_with_powers(&keys, &[10, 10, 10, 10]);
        let mut seen = Vec::new();
        for _ in 0..4 {
            set.increment_proposer_priority(1);
            seen.push(set.proposer().address);
        }
        // Every validator proposes exactly once per cycle.
        let unique: HashSet<Address> = seen.iter().copied().collect();
        assert_eq!(unique.len(), 4);

        // And the next cycle repeats the same order.
        let mut second = Vec::new();
        for _ in 0..4 {
            set.increment_proposer_priority(1);
            second.push(set.proposer().address);
        }
        assert_eq!(seen, second);
    }

    #[test]
    fn proposer_frequency_converges_to_stake() {
        let keys = keypairs(3);
        let powers = [1i64, 2, 5];
        let mut set = set_with_powers(&keys, &powers);
        let total: i64 = powers.iter().sum();

        let mut counts: HashMap<Address, u32> = HashMap::new();
        let rounds = 8_000u32;
        for _ in 0..rounds {
            set.increment_proposer_priority(1);
            *counts.entry(set.proposer().address).or_default() += 1;
        }
        for (key, power) in keys.iter().zip(powers) {
            let got = f64::from(*counts.get(&key.address()).unwrap_or(&0));
            let expected = f64::from(rounds) * power as f64 / total as f64;
            let deviation = (got - expected).abs() / expected;
            assert!(
                deviation < 0.01,
                "validator with power {power} proposed {got} times, expected ~{expected}"
            );
        }
    }

    #[test]
    fn priorities_stay_clipped() {
        let keys = keypairs(3);
        let mut set = set_with_powers(&keys, &[1, 10, 100]);
        let bound = PRIORITY_WINDOW_SIZE_FACTOR * set.total_voting_power();
        for _ in 0..1_000 {
            set.increment_proposer_priority(1);
            for val in set.iter() {
                assert!(
                    val.proposer_priority.abs() <= bound + set.total_voting_power(),
                    "priority {} escaped the window",
                    val.proposer_priority
                );
            }
        }
    }

    #[test]
    fn copy_increment_leaves_original_alone() {
        let keys = keypairs(3);
        let set = set_with_powers(&keys, &[10, 10, 10]);
        let advanced = set.copy_increment_proposer_priority(2);
        assert_eq!(set.hash(), advanced.hash());
        assert_ne!(
            set.iter().map(|v| v.proposer_priority).collect::<Vec<_>>(),
            advanced
                .iter()
                .map(|v| v.proposer_priority)
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn update_add_remove_change() {
        let keys = keypairs(6);
        let mut set = set_with_powers(&keys[..3], &[10, 10, 10]);

        // Add two.
        set.update_with(&[
            ValidatorUpdate {
                pub_key: keys[3].public_key(),
                power: 15,
            },
            ValidatorUpdate {
                pub_key: keys[4].public_key(),
                power: 5,
            },
        ])
        .unwrap();
        assert_eq!(set.len(), 5);
        assert_eq!(set.total_voting_power(), 50);

        // Change one.
        set.update_with(&[ValidatorUpdate {
            pub_key: keys[0].public_key(),
            power: 30,
        }])
        .unwrap();
        assert_eq!(set.len(), 5);
        assert_eq!(set.total_voting_power(), 70);
        let (_, changed) = set.get_by_address(&keys[0].address()).unwrap();
        assert_eq!(changed.voting_power, 30);

        // Remove two.
        set.update_with(&[
            ValidatorUpdate {
                pub_key: keys[1].public_key(),
                power: 0,
            },
            ValidatorUpdate {
                pub_key: keys[4].public_key(),
                power: 0,
            },
        ])
        .unwrap();
        assert_eq!(set.len(), 3);
        assert!(!set.has_address(&keys[1].address()));
    }

    #[test]
    fn update_rejections_leave_set_untouched() {
        let keys = keypairs(4);
        let mut set = set_with_powers(&keys[..2], &[10, 10]);
        let before = set.clone();

        // Removing an unknown validator.
        assert!(matches!(
            set.update_with(&[ValidatorUpdate {
                pub_key: keys[3].public_key(),
                power: 0,
            }]),
            Err(ValidatorSetError::RemoveNonExistent(_))
        ));
        assert_eq!(set, before);

        // Emptying the set.
        assert_eq!(
            set.update_with(&[
                ValidatorUpdate {
                    pub_key: keys[0].public_key(),
                    power: 0,
                },
                ValidatorUpdate {
                    pub_key: keys[1].public_key(),
                    power: 0,
                },
            ]),
            Err(ValidatorSetError::EmptyAfterUpdate)
        );
        assert_eq!(set, before);

        // Negative power.
        assert!(matches!(
            set.update_with(&[ValidatorUpdate {
                pub_key: keys[0].public_key(),
                power: -1,
            }]),
            Err(ValidatorSetError::NegativeUpdatePower { .. })
        ));
    }

    #[test]
    fn update_preserves_surviving_priorities_order() {
        let keys = keypairs(3);
        let mut set = set_with_powers(&keys, &[10, 10, 10]);
        set.increment_proposer_priority(2);

        let ordered_before: Vec<Address> = {
            let mut vals: Vec<&Validator> = set.iter().collect();
            vals.sort_by(|a, b| a.compare_proposer_priority(b));
            vals.iter().map(|v| v.address).collect()
        };

        set.update_with(&[ValidatorUpdate {
            pub_key: keys[0].public_key(),
            power: 11,
        }])
        .unwrap();

        let ordered_after: Vec<Address> = {
            let mut vals: Vec<&Validator> = set.iter().collect();
            vals.sort_by(|a, b| a.compare_proposer_priority(b));
            vals.iter().map(|v| v.address).collect()
        };
        // Centring shifts values but not relative order.
        assert_eq!(ordered_before, ordered_after);
    }

    #[test]
    fn trust_level_validation() {
        for (n, d, ok) in [
            (1u64, 3u64, true),
            (2, 3, true),
            (1, 1, true),
            (3, 3, true),
            (1, 4, false),
            (0, 3, false),
            (2, 1, false),
            (1, 0, false),
        ] {
            let level = TrustLevel {
                numerator: n,
                denominator: d,
            };
            assert_eq!(level.validate().is_ok(), ok, "{n}/{d}");
        }
    }

    // ─── Commit verification ────────────────────────────────────────────

    fn make_commit(
        keys: &[Keypair],
        set: &ValidatorSet,
        height: u64,
        block_id: BlockId,
        signers: impl Fn(u32) -> bool,
    ) -> Commit {
        let by_address: HashMap<Address, &Keypair> =
            keys.iter().map(|k| (k.address(), k)).collect();
        let mut commit = Commit {
            height,
            round: 0,
            block_id,
            signatures: vec![],
        };
        commit.signatures = set
            .iter()
            .enumerate()
            .map(|(slot, val)| {
                if !signers(slot as u32) {
                    return CommitSig::Absent;
                }
                let kp = by_address[&val.address];
                let ts = Time::from_millis(1_000 + slot as u64);
                let bytes = canonical_vote_bytes(
                    VoteType::Precommit,
                    height,
                    0,
                    &Some(block_id),
                    ts,
                    "test-chain",
                );
                CommitSig::Commit {
                    validator_address: val.address,
                    timestamp: ts,
                    signature: kp.sign(&bytes),
                }
            })
            .collect();
        commit
    }

    fn test_block_id() -> BlockId {
        BlockId {
            hash: Hash::sum(b"committed-block"),
            part_set_header: PartSetHeader {
                total: 1,
                hash: Hash::sum(b"parts"),
            },
        }
    }

    #[test]
    fn verify_commit_accepts_full_quorum() {
        let keys = keypairs(4);
        let set = set_with_powers(&keys, &[10, 10, 10, 10]);
        let commit = make_commit(&keys, &set, 5, test_block_id(), |_| true);
        let cache = SignatureCache::default();
        set.verify_commit("test-chain", &test_block_id(), 5, &commit, &cache)
            .unwrap();
        set.verify_commit_light("test-chain", &test_block_id(), 5, &commit, &cache)
            .unwrap();
    }

    #[test]
    fn verify_commit_rejects_exactly_two_thirds() {
        let keys = keypairs(3);
        let set = set_with_powers(&keys, &[10, 10, 10]);
        // Two of three signers: exactly 2/3, not more.
        let commit = make_commit(&keys, &set, 5, test_block_id(), |slot| slot < 2);
        let cache = SignatureCache::default();
        assert!(matches!(
            set.verify_commit("test-chain", &test_block_id(), 5, &commit, &cache),
            Err(VerifyCommitError::NotEnoughPower { .. })
        ));
    }

    #[test]
    fn verify_commit_rejects_tampered_signature() {
        let keys = keypairs(4);
        let set = set_with_powers(&keys, &[10, 10, 10, 10]);
        let mut commit = make_commit(&keys, &set, 5, test_block_id(), |_| true);
        if let CommitSig::Commit { signature, .. } = &mut commit.signatures[2] {
            let mut bytes: [u8; 64] = signature.as_bytes().try_into().unwrap();
            bytes[0] ^= 0x01;
            *signature = crate::Signature::Ed25519(bytes);
        }
        let cache = SignatureCache::default();
        assert_eq!(
            set.verify_commit("test-chain", &test_block_id(), 5, &commit, &cache),
            Err(VerifyCommitError::InvalidSignature { slot: 2 })
        );
    }

    #[test]
    fn verify_commit_rejects_shape_mismatches() {
        let keys = keypairs(4);
        let set = set_with_powers(&keys, &[10, 10, 10, 10]);
        let commit = make_commit(&keys, &set, 5, test_block_id(), |_| true);
        let cache = SignatureCache::default();

        assert!(matches!(
            set.verify_commit("test-chain", &test_block_id(), 6, &commit, &cache),
            Err(VerifyCommitError::HeightMismatch { .. })
        ));

        let other_id = BlockId {
            hash: Hash::sum(b"other"),
            part_set_header: test_block_id().part_set_header,
        };
        assert_eq!(
            set.verify_commit("test-chain", &other_id, 5, &commit, &cache),
            Err(VerifyCommitError::BlockIdMismatch)
        );

        let mut short = commit.clone();
        short.signatures.pop();
        assert!(matches!(
            set.verify_commit("test-chain", &test_block_id(), 5, &short, &cache),
            Err(VerifyCommitError::SignatureCountMismatch { .. })
        ));
    }

    #[test]
    fn light_trusting_counts_overlap_only() {
        // Trusted set: 4 validators. New commit signed by a set sharing
        // only two of them.
        let keys = keypairs(6);
        let trusted = set_with_powers(&keys[..4], &[10, 10, 10, 10]);
        let newer = set_with_powers(&keys[2..6], &[10, 10, 10, 10]);
        let commit = make_commit(&keys[2..6], &newer, 50, test_block_id(), |_| true);
        let cache = SignatureCache::default();

        // Overlap is 20 of 40 trusted power: 1/3 is satisfied...
        trusted
            .verify_commit_light_trusting("test-chain", &commit, TrustLevel::ONE_THIRD, &cache)
            .unwrap();

        // ...but 2/3 is not.
        assert!(matches!(
            trusted.verify_commit_light_trusting(
                "test-chain",
                &commit,
                TrustLevel {
                    numerator: 2,
                    denominator: 3
                },
                &cache
            ),
            Err(VerifyCommitError::NotEnoughTrust { .. })
        ));
    }

    #[test]
    fn light_trusting_with_no_overlap_fails() {
        let keys = keypairs(8);
        let trusted = set_with_powers(&keys[..4], &[10, 10, 10, 10]);
        let newer = set_with_powers(&keys[4..8], &[10, 10, 10, 10]);
        let commit = make_commit(&keys[4..8], &newer, 50, test_block_id(), |_| true);
        let cache = SignatureCache::default();
        assert!(matches!(
            trusted.verify_commit_light_trusting(
                "test-chain",
                &commit,
                TrustLevel::ONE_THIRD,
                &cache
            ),
            Err(VerifyCommitError::NotEnoughTrust { .. })
        ));
    }
}
