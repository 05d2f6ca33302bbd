//! Block proposals.

use crate::block::BlockId;
use crate::crypto::Signature;
use crate::time::Time;
use crate::wire::{self, WireDecode, WireEncode, WireError};

/// A proposal for the block to decide at one (height, round), signed by the
/// round's proposer.
///
/// `pol_round` is set when the proposer re-proposes a block that already
/// gathered +2/3 prevotes in an earlier round; it names that round so
/// locked validators can justify switching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub height: u64,
    pub round: u32,
    pub pol_round: Option<u32>,
    pub block_id: BlockId,
    pub timestamp: Time,
    pub signature: Signature,
}

impl Proposal {
    /// Canonical sign bytes: everything but the signature, chain id
    /// appended.
    pub fn sign_bytes(&self, chain_id: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(96 + chain_id.len());
        wire::write_uvarint(&mut out, self.height);
        wire::write_uvarint(&mut out, u64::from(self.round));
        wire::write_option(&mut out, &self.pol_round, |o, r| {
            wire::write_uvarint(o, u64::from(*r))
        });
        self.block_id.encode_into(&mut out);
        wire::write_uvarint(&mut out, self.timestamp.as_millis());
        wire::write_string(&mut out, chain_id);
        out
    }

    /// A POL round, when present, must precede the proposal round.
    pub fn validate_basic(&self) -> bool {
        self.height > 0 && self.pol_round.map_or(true, |pol| pol < self.round)
    }
}

impl WireEncode for Proposal {
    fn encode_into(&self, out: &mut Vec<u8>) {
        wire::write_uvarint(out, self.height);
        wire::write_uvarint(out, u64::from(self.round));
        wire::write_option(out, &self.pol_round, |o, r| {
            wire::write_uvarint(o, u64::from(*r))
        });
        self.block_id.encode_into(out);
        wire::write_uvarint(out, self.timestamp.as_millis());
        wire::write_bytes(out, self.signature.as_bytes());
    }
}

impl WireDecode for Proposal {
    fn decode_from(input: &mut &[u8]) -> Result<Self, WireError> {
        let height = wire::read_uvarint(input)?;
        let round = wire::read_uvarint(input)?;
        let round: u32 = round.try_into().map_err(|_| WireError::LengthOverflow)?;
        let pol_round = wire::read_option(input, |i| {
            let r = wire::read_uvarint(i)?;
            u32::try_from(r).map_err(|_| WireError::LengthOverflow)
        })?;
        let block_id = BlockId::decode_from(input)?;
        let timestamp = Time::from_millis(wire::read_uvarint(input)?);
        let signature = Signature::from_slice(&wire::read_bytes(input)?)
            .map_err(|_| WireError::LengthOverflow)?;
        Ok(Proposal {
            height,
            round,
            pol_round,
            block_id,
            timestamp,
            signature,
        })
    }
}
