//! Merkle inclusion proofs.

use crate::hash::Hash;
use crate::wire::{self, WireDecode, WireEncode, WireError};
use thiserror::Error;

use super::tree::{inner_hash, leaf_hash};

/// Cap on the aunt trail length; bounds proof size and recursion depth.
pub const MAX_AUNTS: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProofError {
    #[error("proof total must be positive")]
    ZeroTotal,

    #[error("proof index {index} out of range for total {total}")]
    IndexOutOfRange { index: u64, total: u64 },

    #[error("maximum aunts length, {MAX_AUNTS}, exceeded: {0}")]
    TooManyAunts(usize),

    #[error("leaf hash mismatch: want {want}, got {got}")]
    LeafMismatch { want: Hash, got: Hash },

    #[error("invalid root: want {want}, got {got}")]
    RootMismatch { want: Hash, got: Hash },

    #[error("proof shape inconsistent with total/index")]
    MalformedTrail,

    #[error("empty root can never be proven against")]
    EmptyRoot,

    #[error("operator input mismatch: {0}")]
    OperatorInput(String),

    #[error("no proof operators")]
    NoOperators,

    #[error("key path malformed: {0}")]
    MalformedKeyPath(String),

    #[error("key mismatch at segment {segment:?}")]
    KeyMismatch { segment: Vec<u8> },

    #[error("key path has {0} unconsumed segment(s)")]
    UnconsumedKeys(usize),

    #[error("unknown proof op type {0:?}")]
    UnknownOpType(String),

    #[error("proof op decode failed: {0}")]
    OpDecode(WireError),
}

/// An inclusion proof for leaf `index` of a tree over `total` items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proof {
    pub total: u64,
    pub index: u64,
    pub leaf_hash: Hash,
    /// Sibling hashes from the leaf up to (excluding) the root.
    pub aunts: Vec<Hash>,
}

impl Proof {
    /// Verify that `leaf` is the item at `self.index` of the tree with the
    /// given root.
    pub fn verify(&self, root: &Hash, leaf: &[u8]) -> Result<(), ProofError> {
        self.validate_basic()?;
        let computed_leaf = leaf_hash(leaf);
        if computed_leaf != self.leaf_hash {
            return Err(ProofError::LeafMismatch {
                want: self.leaf_hash,
                got: computed_leaf,
            });
        }
        let computed_root = self.compute_root()?;
        if computed_root != *root {
            return Err(ProofError::RootMismatch {
                want: *root,
                got: computed_root,
            });
        }
        Ok(())
    }

    /// Structural validation independent of any root.
    pub fn validate_basic(&self) -> Result<(), ProofError> {
        if self.total == 0 {
            return Err(ProofError::ZeroTotal);
        }
        if self.index >= self.total {
            return Err(ProofError::IndexOutOfRange {
                index: self.index,
                total: self.total,
            });
        }
        if self.aunts.len() > MAX_AUNTS {
            return Err(ProofError::TooManyAunts(self.aunts.len()));
        }
        Ok(())
    }

    /// Recompute the root implied by this proof.
    pub fn compute_root(&self) -> Result<Hash, ProofError> {
        compute_hash_from_aunts(self.index, self.total, self.leaf_hash, &self.aunts)
            .ok_or(ProofError::MalformedTrail)
    }
}

/// Recursively reduce the aunt trail to a root.
///
/// Mirrors the tree construction: the trail is consumed from the far end,
/// splitting the index range at the largest power of two below `total`.
fn compute_hash_from_aunts(index: u64, total: u64, leaf: Hash, aunts: &[Hash]) -> Option<Hash> {
    if index >= total || total == 0 {
        return None;
    }
    match total {
        1 => {
            if aunts.is_empty() {
                Some(leaf)
            } else {
                None
            }
        }
        _ => {
            let (last, rest) = aunts.split_last()?;
            let bits = u64::BITS - total.leading_zeros();
            let mut split = 1u64 << (bits - 1);
            if split == total {
                split >>= 1;
            }
            if index < split {
                let left = compute_hash_from_aunts(index, split, leaf, rest)?;
                Some(inner_hash(&left, last))
            } else {
                let right = compute_hash_from_aunts(index - split, total - split, leaf, rest)?;
                Some(inner_hash(last, &right))
            }
        }
    }
}

impl WireEncode for Proof {
    fn encode_into(&self, out: &mut Vec<u8>) {
        wire::write_uvarint(out, self.total);
        wire::write_uvarint(out, self.index);
        wire::write_fixed(out, self.leaf_hash.as_bytes());
        wire::write_uvarint(out, self.aunts.len() as u64);
        for aunt in &self.aunts {
            wire::write_fixed(out, aunt.as_bytes());
        }
    }
}

impl WireDecode for Proof {
    fn decode_from(input: &mut &[u8]) -> Result<Self, WireError> {
        let total = wire::read_uvarint(input)?;
        let index = wire::read_uvarint(input)?;
        let leaf_hash = Hash::from_bytes(wire::read_fixed(input)?);
        let count = wire::read_uvarint(input)?;
        if count > MAX_AUNTS as u64 {
            return Err(WireError::LengthOverflow);
        }
        let mut aunts = Vec::with_capacity(count as usize);
        for _ in 0..count {
            aunts.push(Hash::from_bytes(wire::read_fixed(input)?));
        }
        Ok(Proof {
            total,
            index,
            leaf_hash,
            aunts,
        })
    }
}
