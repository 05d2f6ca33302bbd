//! Votes and their canonical sign bytes.

use crate::block::BlockId;
use crate::crypto::Signature;
use crate::hash::{Address, ADDRESS_SIZE};
use crate::time::Time;
use crate::wire::{self, WireDecode, WireEncode, WireError};

/// The two voting phases of a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VoteType {
    Prevote,
    Precommit,
}

impl VoteType {
    pub fn as_u8(self) -> u8 {
        match self {
            VoteType::Prevote => 1,
            VoteType::Precommit => 2,
        }
    }

    pub fn from_u8(v: u8) -> Option<VoteType> {
        match v {
            1 => Some(VoteType::Prevote),
            2 => Some(VoteType::Precommit),
            _ => None,
        }
    }
}

impl std::fmt::Display for VoteType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VoteType::Prevote => write!(f, "prevote"),
            VoteType::Precommit => write!(f, "precommit"),
        }
    }
}

/// A prevote or precommit for a block (or nil) at one (height, round).
///
/// The signature covers the canonical encoding, which excludes
/// `validator_address` and `validator_index` and appends the chain id:
/// signatures are therefore independent of validator-set ordering and
/// cannot be replayed across chains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vote {
    pub vote_type: VoteType,
    pub height: u64,
    pub round: u32,
    /// `None` is the nil vote.
    pub block_id: Option<BlockId>,
    pub timestamp: Time,
    pub validator_address: Address,
    pub validator_index: u32,
    pub signature: Signature,
    /// Application vote extension; only ever non-empty on precommits for a
    /// block, and only at heights where extensions are enabled.
    pub extension: Vec<u8>,
    pub extension_signature: Option<Signature>,
}

/// Canonical sign bytes shared by live votes and commit reconstruction.
pub(crate) fn canonical_vote_bytes(
    vote_type: VoteType,
    height: u64,
    round: u32,
    block_id: &Option<BlockId>,
    timestamp: Time,
    chain_id: &str,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(96 + chain_id.len());
    wire::write_uvarint(&mut out, u64::from(vote_type.as_u8()));
    wire::write_uvarint(&mut out, height);
    wire::write_uvarint(&mut out, u64::from(round));
    wire::write_option(&mut out, block_id, |o, id| id.encode_into(o));
    wire::write_uvarint(&mut out, timestamp.as_millis());
    wire::write_string(&mut out, chain_id);
    out
}

/// Canonical sign bytes for a vote extension.
pub(crate) fn canonical_extension_bytes(
    height: u64,
    round: u32,
    extension: &[u8],
    chain_id: &str,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(32 + extension.len() + chain_id.len());
    wire::write_uvarint(&mut out, height);
    wire::write_uvarint(&mut out, u64::from(round));
    wire::write_bytes(&mut out, extension);
    wire::write_string(&mut out, chain_id);
    out
}

impl Vote {
    /// The bytes this vote's signature covers.
    pub fn sign_bytes(&self, chain_id: &str) -> Vec<u8> {
        canonical_vote_bytes(
            self.vote_type,
            self.height,
            self.round,
            &self.block_id,
            self.timestamp,
            chain_id,
        )
    }

    /// The bytes the extension signature covers.
    pub fn extension_sign_bytes(&self, chain_id: &str) -> Vec<u8> {
        canonical_extension_bytes(self.height, self.round, &self.extension, chain_id)
    }

    pub fn is_nil(&self) -> bool {
        self.block_id.is_none()
    }
}

impl WireEncode for Vote {
    fn encode_into(&self, out: &mut Vec<u8>) {
        wire::write_uvarint(out, u64::from(self.vote_type.as_u8()));
        wire::write_uvarint(out, self.height);
        wire::write_uvarint(out, u64::from(self.round));
        wire::write_option(out, &self.block_id, |o, id| id.encode_into(o));
        wire::write_uvarint(out, self.timestamp.as_millis());
        wire::write_fixed(out, self.validator_address.as_bytes());
        wire::write_uvarint(out, u64::from(self.validator_index));
        wire::write_bytes(out, self.signature.as_bytes());
        wire::write_bytes(out, &self.extension);
        wire::write_option(out, &self.extension_signature, |o, sig| {
            wire::write_bytes(o, sig.as_bytes())
        });
    }
}

impl WireDecode for Vote {
    fn decode_from(input: &mut &[u8]) -> Result<Self, WireError> {
        let type_byte = wire::read_uvarint(input)?;
        let vote_type = u8::try_from(type_byte)
            .ok()
            .and_then(VoteType::from_u8)
            .ok_or(WireError::InvalidDiscriminant(type_byte))?;
        let height = wire::read_uvarint(input)?;
        let round = wire::read_uvarint(input)?;
        let round: u32 = round.try_into().map_err(|_| WireError::LengthOverflow)?;
        let block_id = wire::read_option(input, BlockId::decode_from)?;
        let timestamp = Time::from_millis(wire::read_uvarint(input)?);
        let validator_address = Address::from_bytes(wire::read_fixed::<ADDRESS_SIZE>(input)?);
        let validator_index = wire::read_uvarint(input)?;
        let validator_index: u32 = validator_index
            .try_into()
            .map_err(|_| WireError::LengthOverflow)?;
        let signature = Signature::from_slice(&wire::read_bytes(input)?)
            .map_err(|_| WireError::LengthOverflow)?;
        let extension = wire::read_bytes(input)?;
        let extension_signature = wire::read_option(input, |i| {
            let bytes = wire::read_bytes(i)?;
            Signature::from_slice(&bytes).map_err(|_| WireError::LengthOverflow)
        })?;
        Ok(Vote {
            vote_type,
            height,
            round,
            block_id,
            timestamp,
            validator_address,
            validator_index,
            signature,
            extension,
            extension_signature,
        })
    }
}
