//! Blocks, headers, and block identifiers.

use crate::commit::Commit;
use crate::evidence::Evidence;
use crate::hash::{Address, Hash, ADDRESS_SIZE};
use crate::merkle::hash_from_byte_slices;
use crate::part_set::PartSetHeader;
use crate::time::Time;
use crate::wire::{self, WireDecode, WireEncode, WireError};
use thiserror::Error;

/// Chain identifiers are 1..=50 characters.
pub const MAX_CHAIN_ID_LEN: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlockError {
    #[error("chain id length {0} outside 1..={MAX_CHAIN_ID_LEN}")]
    InvalidChainIdLength(usize),

    #[error("chain id mismatch: expected {expected:?}, got {got:?}")]
    ChainIdMismatch { expected: String, got: String },

    #[error("height must be positive")]
    ZeroHeight,

    #[error("block at initial height carries a last block id")]
    UnexpectedLastBlockId,

    #[error("block above initial height missing last block id")]
    MissingLastBlockId,

    #[error("data hash mismatch: header {header}, computed {computed}")]
    DataHashMismatch { header: Hash, computed: Hash },

    #[error("evidence hash mismatch: header {header}, computed {computed}")]
    EvidenceHashMismatch { header: Hash, computed: Hash },

    #[error("last commit hash mismatch: header {header}, computed {computed}")]
    LastCommitHashMismatch { header: Hash, computed: Hash },

    #[error("block above initial height missing last commit")]
    MissingLastCommit,

    #[error("commit error: {0}")]
    Commit(#[from] crate::commit::CommitError),
}

/// An opaque transaction.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Tx(pub Vec<u8>);

impl Tx {
    pub fn hash(&self) -> Hash {
        Hash::sum(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Tx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tx({} bytes, {:?})", self.0.len(), self.hash())
    }
}

impl From<Vec<u8>> for Tx {
    fn from(bytes: Vec<u8>) -> Self {
        Tx(bytes)
    }
}

/// Identifies a block by its header hash and the root of its part set.
///
/// Consensus votes on `BlockId`s, never on object references: the part-set
/// root pins the exact serialized bytes being gossiped, the header hash pins
/// the semantic content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId {
    pub hash: Hash,
    pub part_set_header: PartSetHeader,
}

impl WireEncode for BlockId {
    fn encode_into(&self, out: &mut Vec<u8>) {
        wire::write_fixed(out, self.hash.as_bytes());
        wire::write_uvarint(out, u64::from(self.part_set_header.total));
        wire::write_fixed(out, self.part_set_header.hash.as_bytes());
    }
}

impl WireDecode for BlockId {
    fn decode_from(input: &mut &[u8]) -> Result<Self, WireError> {
        let hash = Hash::from_bytes(wire::read_fixed(input)?);
        let total = wire::read_uvarint(input)?;
        let total: u32 = total.try_into().map_err(|_| WireError::LengthOverflow)?;
        let parts_hash = Hash::from_bytes(wire::read_fixed(input)?);
        Ok(BlockId {
            hash,
            part_set_header: PartSetHeader {
                total,
                hash: parts_hash,
            },
        })
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}:{}", self.hash, self.part_set_header.total)
    }
}

/// A block header.
///
/// `hash()` is the Merkle root over the canonical encodings of the fields in
/// declaration order, so a light client can be handed any single field plus
/// a Merkle path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub chain_id: String,
    pub height: u64,
    pub time: Time,
    /// `None` only at the chain's initial height.
    pub last_block_id: Option<BlockId>,
    pub last_commit_hash: Hash,
    pub data_hash: Hash,
    pub validators_hash: Hash,
    pub next_validators_hash: Hash,
    pub consensus_hash: Hash,
    pub app_hash: Vec<u8>,
    pub last_results_hash: Hash,
    pub evidence_hash: Hash,
    pub proposer_address: Address,
}

impl Header {
    pub fn hash(&self) -> Hash {
        let mut chain_id = Vec::new();
        wire::write_string(&mut chain_id, &self.chain_id);
        let mut height = Vec::new();
        wire::write_uvarint(&mut height, self.height);
        let mut time = Vec::new();
        wire::write_uvarint(&mut time, self.time.as_millis());
        let mut last_block_id = Vec::new();
        wire::write_option(&mut last_block_id, &self.last_block_id, |o, v| {
            v.encode_into(o)
        });
        let mut app_hash = Vec::new();
        wire::write_bytes(&mut app_hash, &self.app_hash);

        let fields: [&[u8]; 13] = [
            &chain_id,
            &height,
            &time,
            &last_block_id,
            self.last_commit_hash.as_bytes(),
            self.data_hash.as_bytes(),
            self.validators_hash.as_bytes(),
            self.next_validators_hash.as_bytes(),
            self.consensus_hash.as_bytes(),
            &app_hash,
            self.last_results_hash.as_bytes(),
            self.evidence_hash.as_bytes(),
            self.proposer_address.as_bytes(),
        ];
        hash_from_byte_slices(&fields)
    }

    /// Structural checks that need no chain state.
    pub fn validate_basic(&self) -> Result<(), BlockError> {
        if self.chain_id.is_empty() || self.chain_id.len() > MAX_CHAIN_ID_LEN {
            return Err(BlockError::InvalidChainIdLength(self.chain_id.len()));
        }
        if self.height == 0 {
            return Err(BlockError::ZeroHeight);
        }
        Ok(())
    }
}

impl WireEncode for Header {
    fn encode_into(&self, out: &mut Vec<u8>) {
        wire::write_string(out, &self.chain_id);
        wire::write_uvarint(out, self.height);
        wire::write_uvarint(out, self.time.as_millis());
        wire::write_option(out, &self.last_block_id, |o, v| v.encode_into(o));
        wire::write_fixed(out, self.last_commit_hash.as_bytes());
        wire::write_fixed(out, self.data_hash.as_bytes());
        wire::write_fixed(out, self.validators_hash.as_bytes());
        wire::write_fixed(out, self.next_validators_hash.as_bytes());
        wire::write_fixed(out, self.consensus_hash.as_bytes());
        wire::write_bytes(out, &self.app_hash);
        wire::write_fixed(out, self.last_results_hash.as_bytes());
        wire::write_fixed(out, self.evidence_hash.as_bytes());
        wire::write_fixed(out, self.proposer_address.as_bytes());
    }
}

impl WireDecode for Header {
    fn decode_from(input: &mut &[u8]) -> Result<Self, WireError> {
        Ok(Header {
            chain_id: wire::read_string(input)?,
            height: wire::read_uvarint(input)?,
            time: Time::from_millis(wire::read_uvarint(input)?),
            last_block_id: wire::read_option(input, BlockId::decode_from)?,
            last_commit_hash: Hash::from_bytes(wire::read_fixed(input)?),
            data_hash: Hash::from_bytes(wire::read_fixed(input)?),
            validators_hash: Hash::from_bytes(wire::read_fixed(input)?),
            next_validators_hash: Hash::from_bytes(wire::read_fixed(input)?),
            consensus_hash: Hash::from_bytes(wire::read_fixed(input)?),
            app_hash: wire::read_bytes(input)?,
            last_results_hash: Hash::from_bytes(wire::read_fixed(input)?),
            evidence_hash: Hash::from_bytes(wire::read_fixed(input)?),
            proposer_address: Address::from_bytes(wire::read_fixed::<ADDRESS_SIZE>(input)?),
        })
    }
}

/// A header together with the commit that finalized it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeader {
    pub header: Header,
    pub commit: Commit,
}

impl SignedHeader {
    /// Structural checks: well-formed header, commit at the header's height
    /// committing the header's hash.
    pub fn validate_basic(&self, chain_id: &str) -> Result<(), BlockError> {
        self.header.validate_basic()?;
        if self.header.chain_id != chain_id {
            return Err(BlockError::ChainIdMismatch {
                expected: chain_id.to_string(),
                got: self.header.chain_id.clone(),
            });
        }
        self.commit.validate_basic()?;
        if self.commit.height != self.header.height
            || self.commit.block_id.hash != self.header.hash()
        {
            return Err(crate::commit::CommitError::WrongBlock {
                commit_height: self.commit.height,
                header_height: self.header.height,
            }
            .into());
        }
        Ok(())
    }
}

impl WireEncode for SignedHeader {
    fn encode_into(&self, out: &mut Vec<u8>) {
        self.header.encode_into(out);
        self.commit.encode_into(out);
    }
}

impl WireDecode for SignedHeader {
    fn decode_from(input: &mut &[u8]) -> Result<Self, WireError> {
        Ok(SignedHeader {
            header: Header::decode_from(input)?,
            commit: Commit::decode_from(input)?,
        })
    }
}

/// A block: header, transactions, evidence, and the commit for the previous
/// height. Immutable once committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: Header,
    pub data: Vec<Tx>,
    pub evidence: Vec<Evidence>,
    /// Commit for `height - 1`; `None` only at the initial height.
    pub last_commit: Option<Commit>,
}

impl Block {
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    /// Merkle root over the raw transactions.
    pub fn data_hash(txs: &[Tx]) -> Hash {
        let items: Vec<&[u8]> = txs.iter().map(|tx| tx.as_bytes()).collect();
        hash_from_byte_slices(&items)
    }

    /// Merkle root over canonical evidence encodings.
    pub fn evidence_hash(evidence: &[Evidence]) -> Hash {
        let items: Vec<Vec<u8>> = evidence.iter().map(|ev| ev.encode()).collect();
        hash_from_byte_slices(&items)
    }

    /// Merkle root over the last commit, empty-tree root when absent.
    pub fn last_commit_hash(last_commit: &Option<Commit>) -> Hash {
        match last_commit {
            Some(commit) => commit.hash(),
            None => hash_from_byte_slices::<&[u8]>(&[]),
        }
    }

    /// Structural validation: header well-formed, payload hashes match the
    /// header, last commit present above the initial height.
    pub fn validate_basic(&self, initial_height: u64) -> Result<(), BlockError> {
        self.header.validate_basic()?;

        let data_hash = Self::data_hash(&self.data);
        if data_hash != self.header.data_hash {
            return Err(BlockError::DataHashMismatch {
                header: self.header.data_hash,
                computed: data_hash,
            });
        }

        let evidence_hash = Self::evidence_hash(&self.evidence);
        if evidence_hash != self.header.evidence_hash {
            return Err(BlockError::EvidenceHashMismatch {
                header: self.header.evidence_hash,
                computed: evidence_hash,
            });
        }

        let last_commit_hash = Self::last_commit_hash(&self.last_commit);
        if last_commit_hash != self.header.last_commit_hash {
            return Err(BlockError::LastCommitHashMismatch {
                header: self.header.last_commit_hash,
                computed: last_commit_hash,
            });
        }

        if self.header.height == initial_height {
            if self.last_commit.is_some() || self.header.last_block_id.is_some() {
                return Err(BlockError::UnexpectedLastBlockId);
            }
        } else {
            if self.last_commit.is_none() {
                return Err(BlockError::MissingLastCommit);
            }
            if self.header.last_block_id.is_none() {
                return Err(BlockError::MissingLastBlockId);
            }
        }

        Ok(())
    }
}

impl WireEncode for Block {
    fn encode_into(&self, out: &mut Vec<u8>) {
        self.header.encode_into(out);
        wire::write_uvarint(out, self.data.len() as u64);
        for tx in &self.data {
            wire::write_bytes(out, tx.as_bytes());
        }
        wire::write_uvarint(out, self.evidence.len() as u64);
        for ev in &self.evidence {
            ev.encode_into(out);
        }
        wire::write_option(out, &self.last_commit, |o, c| c.encode_into(o));
    }
}

impl WireDecode for Block {
    fn decode_from(input: &mut &[u8]) -> Result<Self, WireError> {
        let header = Header::decode_from(input)?;
        let tx_count = wire::read_uvarint(input)?;
        let tx_count: usize = tx_count.try_into().map_err(|_| WireError::LengthOverflow)?;
        if tx_count > input.len() {
            // Each tx consumes at least one byte of input; anything larger
            // is a hostile length prefix.
            return Err(WireError::LengthOverflow);
        }
        let mut data = Vec::with_capacity(tx_count);
        for _ in 0..tx_count {
            data.push(Tx(wire::read_bytes(input)?));
        }
        let ev_count = wire::read_uvarint(input)?;
        let ev_count: usize = ev_count.try_into().map_err(|_| WireError::LengthOverflow)?;
        if ev_count > input.len() {
            return Err(WireError::LengthOverflow);
        }
        let mut evidence = Vec::with_capacity(ev_count);
        for _ in 0..ev_count {
            evidence.push(Evidence::decode_from(input)?);
        }
        let last_commit = wire::read_option(input, Commit::decode_from)?;
        Ok(Block {
            header,
            data,
            evidence,
            last_commit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn test_header(height: u64) -> Header {
        Header {
            chain_id: "test-chain".to_string(),
            height,
            time: Time::from_millis(height * 1_000),
            last_block_id: (height > 1).then(|| BlockId {
                hash: Hash::sum(&height.to_le_bytes()),
                part_set_header: PartSetHeader {
                    total: 1,
                    hash: Hash::sum(b"parts"),
                },
            }),
            last_commit_hash: Block::last_commit_hash(&None),
            data_hash: Block::data_hash(&[]),
            validators_hash: Hash::sum(b"vals"),
            next_validators_hash: Hash::sum(b"next-vals"),
            consensus_hash: Hash::sum(b"params"),
            app_hash: vec![0xaa; 8],
            last_results_hash: Hash::sum(b"results"),
            evidence_hash: Block::evidence_hash(&[]),
            proposer_address: Address::from_bytes([1u8; ADDRESS_SIZE]),
        }
    }

    #[test]
    fn header_hash_is_field_sensitive() {
        let base = test_header(5);
        let base_hash = base.hash();

        let mut changed = base.clone();
        changed.app_hash = vec![0xbb; 8];
        assert_ne!(base_hash, changed.hash());

        let mut changed = base.clone();
        changed.height += 1;
        assert_ne!(base_hash, changed.hash());

        let mut changed = base.clone();
        changed.time = base.time.add(std::time::Duration::from_millis(1));
        assert_ne!(base_hash, changed.hash());
    }

    #[test]
    fn header_wire_round_trip() {
        for height in [1u64, 2, 1000] {
            let header = test_header(height);
            let decoded = Header::decode(&header.encode()).unwrap();
            assert_eq!(header, decoded);
            assert_eq!(header.hash(), decoded.hash());
        }
    }

    #[test]
    fn header_validate_basic() {
        let mut header = test_header(1);
        header.validate_basic().unwrap();

        header.chain_id = String::new();
        assert!(header.validate_basic().is_err());

        header.chain_id = "x".repeat(51);
        assert!(header.validate_basic().is_err());

        let mut header = test_header(1);
        header.height = 0;
        assert_eq!(header.validate_basic(), Err(BlockError::ZeroHeight));
    }

    #[test]
    fn block_validate_checks_payload_hashes() {
        let txs = vec![Tx(b"a=1".to_vec()), Tx(b"b=2".to_vec())];
        let mut header = test_header(1);
        header.data_hash = Block::data_hash(&txs);
        let block = Block {
            header,
            data: txs,
            evidence: vec![],
            last_commit: None,
        };
        block.validate_basic(1).unwrap();

        let mut tampered = block.clone();
        tampered.data.push(Tx(b"c=3".to_vec()));
        assert!(matches!(
            tampered.validate_basic(1),
            Err(BlockError::DataHashMismatch { .. })
        ));
    }

    #[test]
    fn block_above_initial_height_needs_last_commit() {
        let mut header = test_header(2);
        header.data_hash = Block::data_hash(&[]);
        let block = Block {
            header,
            data: vec![],
            evidence: vec![],
            last_commit: None,
        };
        assert_eq!(block.validate_basic(1), Err(BlockError::MissingLastCommit));
    }

    #[test]
    fn block_wire_round_trip() {
        let txs = vec![Tx(b"k=v".to_vec())];
        let mut header = test_header(1);
        header.data_hash = Block::data_hash(&txs);
        let block = Block {
            header,
            data: txs,
            evidence: vec![],
            last_commit: None,
        };
        let decoded = Block::decode(&block.encode()).unwrap();
        assert_eq!(block, decoded);
    }
}
