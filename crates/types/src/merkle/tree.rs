//! The RFC-6962-style binary Merkle tree.

use crate::hash::Hash;
use sha2::{Digest, Sha256};

use super::proof::Proof;

const LEAF_PREFIX: u8 = 0x00;
const INNER_PREFIX: u8 = 0x01;

/// `H(0x00 || leaf)`.
pub fn leaf_hash(leaf: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(leaf);
    Hash::from_bytes(hasher.finalize().into())
}

/// `H(0x01 || left || right)`.
pub fn inner_hash(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([INNER_PREFIX]);
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    Hash::from_bytes(hasher.finalize().into())
}

/// Largest power of two strictly less than `n`. `n` must be > 1.
fn split_point(n: usize) -> usize {
    debug_assert!(n > 1);
    let bits = usize::BITS - n.leading_zeros();
    let mut split = 1usize << (bits - 1);
    if split == n {
        split >>= 1;
    }
    split
}

/// Root hash of the tree over `items`.
///
/// The empty tree hashes to the digest of the empty string, distinct from
/// every single-leaf tree.
pub fn hash_from_byte_slices<T: AsRef<[u8]>>(items: &[T]) -> Hash {
    match items.len() {
        0 => Hash::sum(&[]),
        1 => leaf_hash(items[0].as_ref()),
        n => {
            let k = split_point(n);
            let left = hash_from_byte_slices(&items[..k]);
            let right = hash_from_byte_slices(&items[k..]);
            inner_hash(&left, &right)
        }
    }
}

/// Root hash plus one inclusion proof per item.
pub fn proofs_from_byte_slices<T: AsRef<[u8]>>(items: &[T]) -> (Hash, Vec<Proof>) {
    let total = items.len() as u64;
    let (root, trails) = trails_from_byte_slices(items);
    let proofs = trails
        .into_iter()
        .enumerate()
        .map(|(index, (leaf, aunts))| Proof {
            total,
            index: index as u64,
            leaf_hash: leaf,
            aunts,
        })
        .collect();
    (root, proofs)
}

/// For each leaf: its hash and the aunt trail from leaf to root.
fn trails_from_byte_slices<T: AsRef<[u8]>>(items: &[T]) -> (Hash, Vec<(Hash, Vec<Hash>)>) {
    match items.len() {
        0 => (Hash::sum(&[]), Vec::new()),
        1 => {
            let leaf = leaf_hash(items[0].as_ref());
            (leaf, vec![(leaf, Vec::new())])
        }
        n => {
            let k = split_point(n);
            let (left_root, mut left_trails) = trails_from_byte_slices(&items[..k]);
            let (right_root, mut right_trails) = trails_from_byte_slices(&items[k..]);
            for (_, aunts) in &mut left_trails {
                aunts.push(right_root);
            }
            for (_, aunts) in &mut right_trails {
                aunts.push(left_root);
            }
            let root = inner_hash(&left_root, &right_root);
            left_trails.extend(right_trails);
            (root, left_trails)
        }
    }
}
