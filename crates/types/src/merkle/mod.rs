//! Merkle trees and composable membership proofs.
//!
//! The tree is the RFC-6962 form over arbitrary byte slices: leaves are
//! hashed with a `0x00` prefix, inner nodes as `0x01 || left || right`, and
//! an unbalanced tree splits at the largest power of two smaller than the
//! item count. The same construction hashes transaction lists, validator
//! sets, commits, evidence lists, header fields, and block parts.
//!
//! Membership proofs compose: a [`ProofOperators`] chain maps a value up
//! through nested stores (e.g. value → store root → app hash), with each
//! operator consuming a segment of a `/`-separated key path.

mod keypath;
mod ops;
mod proof;
mod tree;

pub use keypath::{parse_key_path, KeyPath};
pub use ops::{ProofOp, ProofOperator, ProofOperators, ProofRuntime, ValueOp, PROOF_OP_VALUE};
pub use proof::{Proof, ProofError, MAX_AUNTS};
pub use tree::{hash_from_byte_slices, inner_hash, leaf_hash, proofs_from_byte_slices};
