//! Composable proof operators.
//!
//! A proof over nested stores is an ordered chain of typed operators. Each
//! operator maps a list of input byte strings to a list of outputs; running
//! the chain from the value up must land exactly on the trusted root.
//! Operator types are identified by registry tag strings so a proof can be
//! shipped on the wire and reconstructed by a [`ProofRuntime`].

use crate::hash::{Hash, HASH_SIZE};
use crate::wire::{self, WireDecode, WireEncode, WireError};
use std::collections::HashMap;
use std::fmt;

use super::keypath::parse_key_path;
use super::proof::{Proof, ProofError};
use super::tree::leaf_hash;

/// Registry tag for [`ValueOp`].
pub const PROOF_OP_VALUE: &str = "palisade:v";

/// Wire form of a single proof operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofOp {
    pub type_tag: String,
    pub key: Vec<u8>,
    pub data: Vec<u8>,
}

impl WireEncode for ProofOp {
    fn encode_into(&self, out: &mut Vec<u8>) {
        wire::write_string(out, &self.type_tag);
        wire::write_bytes(out, &self.key);
        wire::write_bytes(out, &self.data);
    }
}

impl WireDecode for ProofOp {
    fn decode_from(input: &mut &[u8]) -> Result<Self, WireError> {
        Ok(ProofOp {
            type_tag: wire::read_string(input)?,
            key: wire::read_bytes(input)?,
            data: wire::read_bytes(input)?,
        })
    }
}

/// One layer of a composable proof.
pub trait ProofOperator: fmt::Debug {
    /// Map inputs to outputs, or fail the proof.
    fn run(&self, input: &[Vec<u8>]) -> Result<Vec<Vec<u8>>, ProofError>;

    /// The key segment this operator consumes; empty for pass-through
    /// operators.
    fn key(&self) -> &[u8];

    /// Serialize for the wire.
    fn proof_op(&self) -> ProofOp;
}

/// An ordered chain of proof operators, value-side first.
pub struct ProofOperators(pub Vec<Box<dyn ProofOperator>>);

impl ProofOperators {
    /// Verify that `value` under `keypath` proves up to `root`.
    pub fn verify_value(&self, root: &[u8], keypath: &str, value: &[u8]) -> Result<(), ProofError> {
        self.verify(root, keypath, &[value.to_vec()])
    }

    /// Run the chain over `args`, matching key segments from the last path
    /// segment backwards, and require the final output to equal `root`.
    pub fn verify(&self, root: &[u8], keypath: &str, args: &[Vec<u8>]) -> Result<(), ProofError> {
        // A zero-length root can never anchor a proof (VSA-2022-100).
        if root.is_empty() {
            return Err(ProofError::EmptyRoot);
        }
        if self.0.is_empty() {
            return Err(ProofError::NoOperators);
        }

        let mut keys = parse_key_path(keypath)?;
        let mut args = args.to_vec();

        for op in &self.0 {
            let key = op.key();
            if !key.is_empty() {
                let Some(last) = keys.pop() else {
                    return Err(ProofError::UnconsumedKeys(0));
                };
                if last != key {
                    return Err(ProofError::KeyMismatch {
                        segment: key.to_vec(),
                    });
                }
            }
            args = op.run(&args)?;
        }

        match args.first() {
            Some(output) if !output.is_empty() && output.as_slice() == root => {}
            Some(output) => {
                return Err(ProofError::RootMismatch {
                    want: Hash::from_slice(root).unwrap_or(Hash::ZERO),
                    got: Hash::from_slice(output).unwrap_or(Hash::ZERO),
                })
            }
            None => return Err(ProofError::OperatorInput("no output produced".to_string())),
        }

        if !keys.is_empty() {
            return Err(ProofError::UnconsumedKeys(keys.len()));
        }
        Ok(())
    }
}

impl fmt::Debug for ProofOperators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.iter()).finish()
    }
}

/// Proves that `H(0x00 || len(key) || key || len(H(value)) || H(value))` is
/// a leaf of the tree with the operator's embedded [`Proof`].
///
/// Input: the raw value. Output: the recomputed tree root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueOp {
    key: Vec<u8>,
    proof: Proof,
}

impl ValueOp {
    pub fn new(key: &[u8], proof: Proof) -> Self {
        ValueOp {
            key: key.to_vec(),
            proof,
        }
    }
}

impl ProofOperator for ValueOp {
    fn run(&self, input: &[Vec<u8>]) -> Result<Vec<Vec<u8>>, ProofError> {
        let [value] = input else {
            return Err(ProofError::OperatorInput(format!(
                "expected 1 input, got {}",
                input.len()
            )));
        };
        let value_hash = Hash::sum(value);

        let mut kv_bytes = Vec::with_capacity(self.key.len() + HASH_SIZE + 4);
        wire::write_bytes(&mut kv_bytes, &self.key);
        wire::write_bytes(&mut kv_bytes, value_hash.as_bytes());

        let computed = leaf_hash(&kv_bytes);
        if computed != self.proof.leaf_hash {
            return Err(ProofError::LeafMismatch {
                want: self.proof.leaf_hash,
                got: computed,
            });
        }

        // validate_basic here is what defeats a forged proof that carries
        // only a leaf hash: total == 0 can never pass.
        self.proof.validate_basic()?;
        let root = self.proof.compute_root()?;
        Ok(vec![root.as_bytes().to_vec()])
    }

    fn key(&self) -> &[u8] {
        &self.key
    }

    fn proof_op(&self) -> ProofOp {
        ProofOp {
            type_tag: PROOF_OP_VALUE.to_string(),
            key: self.key.clone(),
            data: self.proof.encode(),
        }
    }
}

type OpDecoder = fn(&ProofOp) -> Result<Box<dyn ProofOperator>, ProofError>;

/// Registry mapping operator type tags to decoders.
#[derive(Default)]
pub struct ProofRuntime {
    decoders: HashMap<String, OpDecoder>,
}

impl ProofRuntime {
    pub fn new() -> Self {
        ProofRuntime::default()
    }

    /// The runtime knowing the built-in operator types.
    pub fn with_defaults() -> Self {
        let mut rt = ProofRuntime::new();
        rt.register(PROOF_OP_VALUE, decode_value_op);
        rt
    }

    pub fn register(&mut self, type_tag: &str, decoder: OpDecoder) {
        self.decoders.insert(type_tag.to_string(), decoder);
    }

    /// Decode wire operators into a runnable chain.
    pub fn decode(&self, ops: &[ProofOp]) -> Result<ProofOperators, ProofError> {
        let mut decoded: Vec<Box<dyn ProofOperator>> = Vec::with_capacity(ops.len());
        for op in ops {
            let decoder = self
                .decoders
                .get(&op.type_tag)
                .ok_or_else(|| ProofError::UnknownOpType(op.type_tag.clone()))?;
            decoded.push(decoder(op)?);
        }
        Ok(ProofOperators(decoded))
    }

    /// Decode and verify in one step.
    pub fn verify_value(
        &self,
        ops: &[ProofOp],
        root: &[u8],
        keypath: &str,
        value: &[u8],
    ) -> Result<(), ProofError> {
        self.decode(ops)?.verify_value(root, keypath, value)
    }
}

fn decode_value_op(op: &ProofOp) -> Result<Box<dyn ProofOperator>, ProofError> {
    let proof = Proof::decode(&op.data).map_err(ProofError::OpDecode)?;
    Ok(Box::new(ValueOp::new(&op.key, proof)))
}
