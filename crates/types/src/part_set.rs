//! Block parts.
//!
//! A serialized block is chunked into fixed-size parts for gossip. The
//! Merkle root over the parts is the network's identifier for the exact
//! byte serialization; votes carry it inside the [`BlockId`](crate::BlockId)
//! so validators agree on bytes, not just on header hashes.

use crate::hash::Hash;
use crate::merkle::{proofs_from_byte_slices, Proof, ProofError};
use crate::wire::{self, WireDecode, WireEncode, WireError};
use thiserror::Error;

/// Size of a block part (64 KiB).
pub const BLOCK_PART_SIZE: usize = 65536;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PartSetError {
    #[error("part index {index} out of range for total {total}")]
    IndexOutOfRange { index: u32, total: u32 },

    #[error("part {index} proof invalid: {source}")]
    InvalidProof { index: u32, source: ProofError },

    #[error("part {index} larger than {BLOCK_PART_SIZE} bytes")]
    OversizedPart { index: u32 },

    #[error("part set incomplete: {have}/{total}")]
    Incomplete { have: u32, total: u32 },
}

/// The agreed shape of a part set: part count and Merkle root over parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PartSetHeader {
    pub total: u32,
    pub hash: Hash,
}

impl PartSetHeader {
    pub fn is_zero(&self) -> bool {
        self.total == 0 && self.hash.is_zero()
    }
}

/// One chunk of a serialized block, with its inclusion proof.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub index: u32,
    pub bytes: Vec<u8>,
    pub proof: Proof,
}

impl WireEncode for Part {
    fn encode_into(&self, out: &mut Vec<u8>) {
        wire::write_uvarint(out, u64::from(self.index));
        wire::write_bytes(out, &self.bytes);
        self.proof.encode_into(out);
    }
}

impl WireDecode for Part {
    fn decode_from(input: &mut &[u8]) -> Result<Self, WireError> {
        let index = wire::read_uvarint(input)?;
        let index: u32 = index.try_into().map_err(|_| WireError::LengthOverflow)?;
        Ok(Part {
            index,
            bytes: wire::read_bytes(input)?,
            proof: Proof::decode_from(input)?,
        })
    }
}

/// A (possibly partial) set of block parts.
pub struct PartSet {
    header: PartSetHeader,
    parts: Vec<Option<Part>>,
    count: u32,
    byte_size: usize,
}

impl PartSet {
    /// Chunk serialized block bytes into proven parts.
    pub fn from_bytes(bytes: &[u8]) -> PartSet {
        let chunks: Vec<&[u8]> = if bytes.is_empty() {
            vec![&[]]
        } else {
            bytes.chunks(BLOCK_PART_SIZE).collect()
        };
        let (root, proofs) = proofs_from_byte_slices(&chunks);
        let total = chunks.len() as u32;
        let parts: Vec<Option<Part>> = chunks
            .iter()
            .zip(proofs)
            .enumerate()
            .map(|(index, (chunk, proof))| {
                Some(Part {
                    index: index as u32,
                    bytes: chunk.to_vec(),
                    proof,
                })
            })
            .collect();
        PartSet {
            header: PartSetHeader { total, hash: root },
            byte_size: bytes.len(),
            count: total,
            parts,
        }
    }

    /// An empty set awaiting parts matching `header`.
    pub fn from_header(header: PartSetHeader) -> PartSet {
        PartSet {
            parts: vec![None; header.total as usize],
            header,
            count: 0,
            byte_size: 0,
        }
    }

    pub fn header(&self) -> &PartSetHeader {
        &self.header
    }

    /// Add a part, verifying its proof against the set's root.
    ///
    /// Returns `Ok(false)` for an already-present index.
    pub fn add_part(&mut self, part: Part) -> Result<bool, PartSetError> {
        let index = part.index;
        if index >= self.header.total {
            return Err(PartSetError::IndexOutOfRange {
                index,
                total: self.header.total,
            });
        }
        if part.bytes.len() > BLOCK_PART_SIZE {
            return Err(PartSetError::OversizedPart { index });
        }
        if self.parts[index as usize].is_some() {
            return Ok(false);
        }
        if part.proof.index != u64::from(index) || part.proof.total != u64::from(self.header.total)
        {
            return Err(PartSetError::InvalidProof {
                index,
                source: ProofError::MalformedTrail,
            });
        }
        part.proof
            .verify(&self.header.hash, &part.bytes)
            .map_err(|source| PartSetError::InvalidProof { index, source })?;

        self.byte_size += part.bytes.len();
        self.parts[index as usize] = Some(part);
        self.count += 1;
        Ok(true)
    }

    pub fn is_complete(&self) -> bool {
        self.count == self.header.total
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    pub fn get(&self, index: u32) -> Option<&Part> {
        self.parts.get(index as usize)?.as_ref()
    }

    /// Concatenate all parts back into the serialized block bytes.
    pub fn assemble(&self) -> Result<Vec<u8>, PartSetError> {
        if !self.is_complete() {
            return Err(PartSetError::Incomplete {
                have: self.count,
                total: self.header.total,
            });
        }
        let mut out = Vec::with_capacity(self.byte_size);
        for part in self.parts.iter().flatten() {
            out.extend_from_slice(&part.bytes);
        }
        Ok(out)
    }

    /// Iterate over the parts currently held.
    pub fn parts(&self) -> impl Iterator<Item = &Part> {
        self.parts.iter().flatten()
    }
}

impl std::fmt::Debug for PartSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartSet")
            .field("total", &self.header.total)
            .field("count", &self.count)
            .field("byte_size", &self.byte_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_part_round_trip() {
        let bytes = vec![7u8; 100];
        let set = PartSet::from_bytes(&bytes);
        assert_eq!(set.header().total, 1);
        assert!(set.is_complete());
        assert_eq!(set.assemble().unwrap(), bytes);
    }

    #[test]
    fn multi_part_reassembly_via_gossip() {
        // Three full parts plus a remainder.
        let bytes: Vec<u8> = (0..(BLOCK_PART_SIZE * 3 + 123))
            .map(|i| (i % 251) as u8)
            .collect();
        let source = PartSet::from_bytes(&bytes);
        assert_eq!(source.header().total, 4);

        // Receiver only knows the header, receives parts out of order.
        let mut receiver = PartSet::from_header(*source.header());
        let mut parts: Vec<Part> = source.parts().cloned().collect();
        parts.reverse();
        for part in parts {
            assert!(receiver.add_part(part).unwrap());
        }
        assert!(receiver.is_complete());
        assert_eq!(receiver.assemble().unwrap(), bytes);
    }

    #[test]
    fn duplicate_part_is_ignored() {
        let bytes = vec![1u8; 10];
        let source = PartSet::from_bytes(&bytes);
        let part = source.get(0).unwrap().clone();
        let mut receiver = PartSet::from_header(*source.header());
        assert!(receiver.add_part(part.clone()).unwrap());
        assert!(!receiver.add_part(part).unwrap());
        assert_eq!(receiver.count(), 1);
    }

    #[test]
    fn tampered_part_rejected() {
        let bytes: Vec<u8> = (0..(BLOCK_PART_SIZE + 5)).map(|i| i as u8).collect();
        let source = PartSet::from_bytes(&bytes);
        let mut receiver = PartSet::from_header(*source.header());

        let mut bad = source.get(0).unwrap().clone();
        bad.bytes[0] ^= 0xff;
        assert!(matches!(
            receiver.add_part(bad),
            Err(PartSetError::InvalidProof { index: 0, .. })
        ));

        // Part presented under the wrong index fails too.
        let mut moved = source.get(0).unwrap().clone();
        moved.index = 1;
        assert!(receiver.add_part(moved).is_err());
    }

    #[test]
    fn out_of_range_index_rejected() {
        let source = PartSet::from_bytes(&[1, 2, 3]);
        let mut receiver = PartSet::from_header(*source.header());
        let mut part = source.get(0).unwrap().clone();
        part.index = 9;
        assert!(matches!(
            receiver.add_part(part),
            Err(PartSetError::IndexOutOfRange { index: 9, total: 1 })
        ));
    }

    #[test]
    fn empty_bytes_still_make_one_part() {
        let set = PartSet::from_bytes(&[]);
        assert_eq!(set.header().total, 1);
        assert_eq!(set.assemble().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn part_wire_round_trip() {
        let source = PartSet::from_bytes(&[9u8; 50]);
        let part = source.get(0).unwrap().clone();
        let decoded = Part::decode(&part.encode()).unwrap();
        assert_eq!(part, decoded);
    }
}
