//! Inter-block chain state.
//!
//! Everything consensus needs to carry from one height to the next:
//! validator sets for three consecutive heights, the last block id and
//! time, the application hash, and the consensus parameters. Blocks and
//! validator sets are immutable and content-addressed; components hand
//! around `BlockId`s, never object references.

use palisade_abci::{FinalizeBlockResponse, TxResult};
use palisade_types::merkle::hash_from_byte_slices;
use palisade_types::{
    Block, BlockId, ConsensusParams, GenesisDoc, GenesisError, Hash, Time, ValidatorSet,
    ValidatorSetError,
};
use palisade_types::wire::{self, WireDecode, WireEncode, WireError};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("genesis error: {0}")]
    Genesis(#[from] GenesisError),

    #[error("validator update rejected: {0}")]
    ValidatorUpdate(#[from] ValidatorSetError),

    #[error("block height {got} does not follow {have}")]
    NonSequentialHeight { got: u64, have: u64 },

    #[error("consensus param update rejected: {0}")]
    InvalidParamUpdate(String),
}

/// Chain state after the last committed block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainState {
    pub chain_id: String,
    pub initial_height: u64,
    pub genesis_time: Time,
    /// 0 until the first block commits.
    pub last_block_height: u64,
    pub last_block_id: Option<BlockId>,
    pub last_block_time: Time,
    /// Validator set for height `last_block_height + 1`.
    pub validators: ValidatorSet,
    /// Validator set for height `last_block_height + 2`.
    pub next_validators: ValidatorSet,
    /// Validator set that signed the last committed block; `None` before
    /// the first commit.
    pub last_validators: Option<ValidatorSet>,
    pub consensus_params: ConsensusParams,
    /// Application hash after the last committed block.
    pub app_hash: Vec<u8>,
    /// Merkle root of the last block's transaction results.
    pub last_results_hash: Hash,
}

impl ChainState {
    /// Boot state from a validated genesis document.
    ///
    /// The height-1 set is the genesis set as given; the height-2 set is
    /// the same set advanced one proposer-rotation step, mirroring the
    /// per-commit advancement below.
    pub fn from_genesis(doc: &GenesisDoc) -> Result<Self, ChainError> {
        doc.validate()?;
        let validators = doc.validator_set()?;
        let next_validators = validators.copy_increment_proposer_priority(1);
        Ok(ChainState {
            chain_id: doc.chain_id.clone(),
            initial_height: doc.initial_height,
            genesis_time: doc.genesis_time(),
            last_block_height: 0,
            last_block_id: None,
            last_block_time: doc.genesis_time(),
            validators,
            next_validators,
            last_validators: None,
            consensus_params: doc.consensus_params.clone(),
            app_hash: doc.app_hash_bytes()?,
            last_results_hash: hash_from_byte_slices::<&[u8]>(&[]),
        })
    }

    /// The height consensus is currently deciding.
    pub fn next_height(&self) -> u64 {
        if self.last_block_height == 0 {
            self.initial_height
        } else {
            self.last_block_height + 1
        }
    }

    /// Merkle root over canonical transaction results.
    pub fn results_hash(results: &[TxResult]) -> Hash {
        let items: Vec<Vec<u8>> = results.iter().map(|r| r.canonical_bytes()).collect();
        hash_from_byte_slices(&items)
    }

    /// Advance past a committed block.
    ///
    /// Validator updates returned by the application for block H take
    /// effect at height H+2: the set that will sign H+1 was already fixed
    /// when H was proposed, so the diffs land in `next_validators` only.
    pub fn apply_block(
        &mut self,
        block: &Block,
        block_id: BlockId,
        response: &FinalizeBlockResponse,
    ) -> Result<(), ChainError> {
        let height = block.header.height;
        if height != self.next_height() {
            return Err(ChainError::NonSequentialHeight {
                got: height,
                have: self.last_block_height,
            });
        }

        // Build the H+2 set: apply diffs, then advance the rotation one
        // step for the new height.
        let mut upcoming = self.next_validators.clone();
        if !response.validator_updates.is_empty() {
            upcoming.update_with(&response.validator_updates)?;
        }
        upcoming.increment_proposer_priority(1);

        if let Some(params) = &response.consensus_param_updates {
            params
                .validate()
                .map_err(|e| ChainError::InvalidParamUpdate(e.to_string()))?;
            self.consensus_params = params.clone();
        }

        self.last_validators = Some(std::mem::replace(
            &mut self.validators,
            self.next_validators.clone(),
        ));
        self.next_validators = upcoming;
        self.last_block_height = height;
        self.last_block_id = Some(block_id);
        self.last_block_time = block.header.time;
        self.app_hash = response.app_hash.clone();
        self.last_results_hash = Self::results_hash(&response.tx_results);
        Ok(())
    }
}

impl WireEncode for ChainState {
    fn encode_into(&self, out: &mut Vec<u8>) {
        wire::write_string(out, &self.chain_id);
        wire::write_uvarint(out, self.initial_height);
        wire::write_uvarint(out, self.genesis_time.as_millis());
        wire::write_uvarint(out, self.last_block_height);
        wire::write_option(out, &self.last_block_id, |o, id| id.encode_into(o));
        wire::write_uvarint(out, self.last_block_time.as_millis());
        encode_validator_set(out, &self.validators);
        encode_validator_set(out, &self.next_validators);
        wire::write_option(out, &self.last_validators, encode_validator_set);
        encode_params(out, &self.consensus_params);
        wire::write_bytes(out, &self.app_hash);
        wire::write_fixed(out, self.last_results_hash.as_bytes());
    }
}

impl WireDecode for ChainState {
    fn decode_from(input: &mut &[u8]) -> Result<Self, WireError> {
        Ok(ChainState {
            chain_id: wire::read_string(input)?,
            initial_height: wire::read_uvarint(input)?,
            genesis_time: Time::from_millis(wire::read_uvarint(input)?),
            last_block_height: wire::read_uvarint(input)?,
            last_block_id: wire::read_option(input, BlockId::decode_from)?,
            last_block_time: Time::from_millis(wire::read_uvarint(input)?),
            validators: decode_validator_set(input)?,
            next_validators: decode_validator_set(input)?,
            last_validators: wire::read_option(input, decode_validator_set)?,
            consensus_params: decode_params(input)?,
            app_hash: wire::read_bytes(input)?,
            last_results_hash: Hash::from_bytes(wire::read_fixed(input)?),
        })
    }
}

fn encode_validator_set(out: &mut Vec<u8>, set: &ValidatorSet) {
    wire::write_uvarint(out, set.len() as u64);
    for val in set.iter() {
        wire::write_string(out, val.pub_key.type_tag());
        wire::write_bytes(out, val.pub_key.as_bytes());
        wire::write_svarint(out, val.voting_power);
        wire::write_svarint(out, val.proposer_priority);
    }
}

fn decode_validator_set(input: &mut &[u8]) -> Result<ValidatorSet, WireError> {
    use palisade_types::{PublicKey, Validator};
    let count = wire::read_uvarint(input)?;
    let count: usize = count.try_into().map_err(|_| WireError::LengthOverflow)?;
    if count > input.len() {
        return Err(WireError::LengthOverflow);
    }
    let mut vals = Vec::with_capacity(count);
    for _ in 0..count {
        let tag = wire::read_string(input)?;
        let key_bytes = wire::read_bytes(input)?;
        let pub_key = PublicKey::from_type_and_bytes(&tag, &key_bytes)
            .map_err(|_| WireError::InvalidDiscriminant(0))?;
        let mut val = Validator::new(pub_key, wire::read_svarint(input)?);
        val.proposer_priority = wire::read_svarint(input)?;
        vals.push(val);
    }
    ValidatorSet::new(vals).map_err(|_| WireError::InvalidDiscriminant(0))
}

fn encode_params(out: &mut Vec<u8>, params: &ConsensusParams) {
    wire::write_svarint(out, params.block.max_bytes);
    wire::write_svarint(out, params.block.max_gas);
    wire::write_uvarint(out, params.evidence.max_age_num_blocks);
    wire::write_uvarint(out, params.evidence.max_age_duration_ms);
    wire::write_svarint(out, params.evidence.max_bytes);
    wire::write_uvarint(out, params.validator.pub_key_types.len() as u64);
    for t in &params.validator.pub_key_types {
        wire::write_string(out, t);
    }
    wire::write_option(out, &params.feature.vote_extensions_enable_height, |o, h| {
        wire::write_uvarint(o, *h)
    });
}

fn decode_params(input: &mut &[u8]) -> Result<ConsensusParams, WireError> {
    use palisade_types::{BlockParams, EvidenceParams, FeatureParams, ValidatorParams};
    let max_bytes = wire::read_svarint(input)?;
    let max_gas = wire::read_svarint(input)?;
    let max_age_num_blocks = wire::read_uvarint(input)?;
    let max_age_duration_ms = wire::read_uvarint(input)?;
    let ev_max_bytes = wire::read_svarint(input)?;
    let count = wire::read_uvarint(input)?;
    let count: usize = count.try_into().map_err(|_| WireError::LengthOverflow)?;
    if count > input.len() {
        return Err(WireError::LengthOverflow);
    }
    let mut pub_key_types = Vec::with_capacity(count);
    for _ in 0..count {
        pub_key_types.push(wire::read_string(input)?);
    }
    let vote_extensions_enable_height = wire::read_option(input, wire::read_uvarint)?;
    Ok(ConsensusParams {
        block: BlockParams { max_bytes, max_gas },
        evidence: EvidenceParams {
            max_age_num_blocks,
            max_age_duration_ms,
            max_bytes: ev_max_bytes,
        },
        validator: ValidatorParams { pub_key_types },
        feature: FeatureParams {
            vote_extensions_enable_height,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_types::test_utils::test_keypair;
    use palisade_types::{
        Address, ConsensusParams, GenesisPubKey, GenesisValidator, PartSetHeader, Tx,
        ValidatorUpdate,
    };

    fn test_genesis(n: u8) -> GenesisDoc {
        let validators = (0..n)
            .map(|i| {
                let kp = test_keypair(i);
                GenesisValidator {
                    address: None,
                    pub_key: GenesisPubKey {
                        key_type: palisade_types::ED25519_KEY_TYPE.to_string(),
                        value: hex_bytes(kp.public_key().as_bytes()),
                    },
                    power: 10,
                    name: format!("v{i}"),
                }
            })
            .collect();
        GenesisDoc {
            genesis_time: 1_000,
            chain_id: "chain-test".to_string(),
            initial_height: 1,
            validators,
            app_hash: String::new(),
            app_state: serde_json::Value::Null,
            consensus_params: ConsensusParams::default(),
        }
    }

    fn hex_bytes(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    fn test_block(state: &ChainState, height: u64) -> (Block, BlockId) {
        let header = palisade_types::Header {
            chain_id: state.chain_id.clone(),
            height,
            time: Time::from_millis(height * 1_000),
            last_block_id: state.last_block_id,
            last_commit_hash: Block::last_commit_hash(&None),
            data_hash: Block::data_hash(&[]),
            validators_hash: state.validators.hash(),
            next_validators_hash: state.next_validators.hash(),
            consensus_hash: state.consensus_params.hash(),
            app_hash: state.app_hash.clone(),
            last_results_hash: state.last_results_hash,
            evidence_hash: Block::evidence_hash(&[]),
            proposer_address: Address::from_bytes([0; 20]),
        };
        let block = Block {
            header,
            data: Vec::<Tx>::new(),
            evidence: vec![],
            last_commit: None,
        };
        let id = BlockId {
            hash: block.hash(),
            part_set_header: PartSetHeader {
                total: 1,
                hash: Hash::sum(b"p"),
            },
        };
        (block, id)
    }

    fn finalize_response(updates: Vec<ValidatorUpdate>) -> FinalizeBlockResponse {
        FinalizeBlockResponse {
            tx_results: vec![],
            validator_updates: updates,
            consensus_param_updates: None,
            app_hash: vec![0xab],
            events: vec![],
        }
    }

    #[test]
    fn genesis_state_is_consistent() {
        let state = ChainState::from_genesis(&test_genesis(4)).unwrap();
        assert_eq!(state.next_height(), 1);
        assert_eq!(state.validators.len(), 4);
        // Hashes equal (priorities differ, hash ignores them).
        assert_eq!(state.validators.hash(), state.next_validators.hash());
        assert!(state.last_validators.is_none());
    }

    #[test]
    fn validator_updates_take_effect_at_h_plus_2() {
        let mut state = ChainState::from_genesis(&test_genesis(4)).unwrap();
        let vals_h1 = state.validators.hash();

        // Block 1 adds a validator.
        let new_kp = test_keypair(40);
        let (block1, id1) = test_block(&state, 1);
        state
            .apply_block(
                &block1,
                id1,
                &finalize_response(vec![ValidatorUpdate {
                    pub_key: new_kp.public_key(),
                    power: 10,
                }]),
            )
            .unwrap();

        // Height 2 is still signed by the old set...
        assert_eq!(state.validators.hash(), vals_h1);
        assert_eq!(state.validators.len(), 4);
        // ...and height 3 by the grown set.
        assert_eq!(state.next_validators.len(), 5);

        let (block2, id2) = test_block(&state, 2);
        state
            .apply_block(&block2, id2, &finalize_response(vec![]))
            .unwrap();
        assert_eq!(state.validators.len(), 5);
    }

    #[test]
    fn rejects_non_sequential_heights() {
        let mut state = ChainState::from_genesis(&test_genesis(4)).unwrap();
        let (block, id) = test_block(&state, 3);
        assert!(matches!(
            state.apply_block(&block, id, &finalize_response(vec![])),
            Err(ChainError::NonSequentialHeight { got: 3, have: 0 })
        ));
    }

    #[test]
    fn rejects_update_emptying_the_set() {
        let mut state = ChainState::from_genesis(&test_genesis(1)).unwrap();
        let (block, id) = test_block(&state, 1);
        let kp = test_keypair(0);
        let result = state.apply_block(
            &block,
            id,
            &finalize_response(vec![ValidatorUpdate {
                pub_key: kp.public_key(),
                power: 0,
            }]),
        );
        assert!(matches!(result, Err(ChainError::ValidatorUpdate(_))));
    }

    #[test]
    fn wire_round_trip() {
        let mut state = ChainState::from_genesis(&test_genesis(3)).unwrap();
        let (block, id) = test_block(&state, 1);
        state
            .apply_block(&block, id, &finalize_response(vec![]))
            .unwrap();

        let decoded = ChainState::decode(&state.encode()).unwrap();
        assert_eq!(state, decoded);
    }

    #[test]
    fn results_hash_covers_codes() {
        let ok = vec![TxResult::ok()];
        let err = vec![TxResult::error(5, "boom")];
        assert_ne!(ChainState::results_hash(&ok), ChainState::results_hash(&err));
    }
}
