//! The genesis document and consensus parameters.
//!
//! Genesis files are JSON; hashes and keys are hex strings. Everything is
//! validated before a node boots from it.

use crate::crypto::PublicKey;
use crate::hash::{Address, Hash};
use crate::time::Time;
use crate::validator::{Validator, ValidatorSet, ValidatorSetError};
use crate::wire;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Chain identifiers are 1..=50 characters.
const MAX_CHAIN_ID_LEN: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenesisError {
    #[error("chain id length {0} outside 1..={MAX_CHAIN_ID_LEN}")]
    InvalidChainId(usize),

    #[error("initial height must be >= 1, got {0}")]
    InvalidInitialHeight(u64),

    #[error("genesis has no validators")]
    NoValidators,

    #[error("validator {name:?} has non-positive power {power}")]
    NonPositivePower { name: String, power: i64 },

    #[error("validator {name:?} key type {key_type:?} is not in the allow-list")]
    DisallowedKeyType { name: String, key_type: String },

    #[error("validator {name:?} has a malformed key: {reason}")]
    MalformedKey { name: String, reason: String },

    #[error("validator {name:?} address does not match its public key")]
    AddressMismatch { name: String },

    #[error("invalid consensus params: {0}")]
    InvalidParams(String),

    #[error("invalid validator set: {0}")]
    InvalidValidatorSet(#[from] ValidatorSetError),

    #[error("invalid json: {0}")]
    Json(String),

    #[error("invalid hex in {field}: {reason}")]
    Hex { field: String, reason: String },
}

/// Block size limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockParams {
    pub max_bytes: i64,
    pub max_gas: i64,
}

impl Default for BlockParams {
    fn default() -> Self {
        BlockParams {
            max_bytes: 4 * 1024 * 1024,
            max_gas: -1,
        }
    }
}

/// How long evidence remains includable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceParams {
    pub max_age_num_blocks: u64,
    pub max_age_duration_ms: u64,
    pub max_bytes: i64,
}

impl Default for EvidenceParams {
    fn default() -> Self {
        EvidenceParams {
            max_age_num_blocks: 100_000,
            // 48 hours.
            max_age_duration_ms: 48 * 60 * 60 * 1_000,
            max_bytes: 1024 * 1024,
        }
    }
}

/// Which key schemes validators may use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorParams {
    pub pub_key_types: Vec<String>,
}

impl Default for ValidatorParams {
    fn default() -> Self {
        ValidatorParams {
            pub_key_types: vec![crate::crypto::ED25519_KEY_TYPE.to_string()],
        }
    }
}

/// Feature activation heights.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FeatureParams {
    /// Height at and above which precommits carry vote extensions.
    /// `None` disables extensions entirely.
    #[serde(default)]
    pub vote_extensions_enable_height: Option<u64>,
}

/// Consensus parameters, hashed into every header's `consensus_hash`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConsensusParams {
    #[serde(default)]
    pub block: BlockParams,
    #[serde(default)]
    pub evidence: EvidenceParams,
    #[serde(default)]
    pub validator: ValidatorParams,
    #[serde(default)]
    pub feature: FeatureParams,
}

impl ConsensusParams {
    pub fn validate(&self) -> Result<(), GenesisError> {
        if self.block.max_bytes <= 0 {
            return Err(GenesisError::InvalidParams(format!(
                "block.max_bytes must be positive, got {}",
                self.block.max_bytes
            )));
        }
        if self.block.max_gas < -1 {
            return Err(GenesisError::InvalidParams(format!(
                "block.max_gas must be >= -1, got {}",
                self.block.max_gas
            )));
        }
        if self.evidence.max_age_num_blocks == 0 || self.evidence.max_age_duration_ms == 0 {
            return Err(GenesisError::InvalidParams(
                "evidence age window must be positive".to_string(),
            ));
        }
        if self.validator.pub_key_types.is_empty() {
            return Err(GenesisError::InvalidParams(
                "validator.pub_key_types must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Deterministic hash carried in headers.
    pub fn hash(&self) -> Hash {
        let mut out = Vec::new();
        wire::write_svarint(&mut out, self.block.max_bytes);
        wire::write_svarint(&mut out, self.block.max_gas);
        wire::write_uvarint(&mut out, self.evidence.max_age_num_blocks);
        wire::write_uvarint(&mut out, self.evidence.max_age_duration_ms);
        wire::write_svarint(&mut out, self.evidence.max_bytes);
        wire::write_uvarint(&mut out, self.validator.pub_key_types.len() as u64);
        for t in &self.validator.pub_key_types {
            wire::write_string(&mut out, t);
        }
        wire::write_option(&mut out, &self.feature.vote_extensions_enable_height, |o, h| {
            wire::write_uvarint(o, *h)
        });
        Hash::sum(&out)
    }

    /// Are vote extensions active at `height`?
    pub fn vote_extensions_enabled(&self, height: u64) -> bool {
        match self.feature.vote_extensions_enable_height {
            Some(enable) => height >= enable,
            None => false,
        }
    }
}

/// One validator entry in the genesis file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisValidator {
    /// Hex address; optional, checked against the key when present.
    #[serde(default)]
    pub address: Option<String>,
    pub pub_key: GenesisPubKey,
    pub power: i64,
    #[serde(default)]
    pub name: String,
}

/// Tagged public key as serialized in genesis JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisPubKey {
    #[serde(rename = "type")]
    pub key_type: String,
    /// Hex-encoded key bytes.
    pub value: String,
}

/// The genesis document: everything needed to boot height 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisDoc {
    /// Milliseconds since the Unix epoch.
    pub genesis_time: u64,
    pub chain_id: String,
    #[serde(default = "default_initial_height")]
    pub initial_height: u64,
    pub validators: Vec<GenesisValidator>,
    /// Hex-encoded initial application hash.
    #[serde(default)]
    pub app_hash: String,
    #[serde(default)]
    pub app_state: serde_json::Value,
    #[serde(default)]
    pub consensus_params: ConsensusParams,
}

fn default_initial_height() -> u64 {
    1
}

impl GenesisDoc {
    pub fn from_json(json: &str) -> Result<Self, GenesisError> {
        let doc: GenesisDoc =
            serde_json::from_str(json).map_err(|e| GenesisError::Json(e.to_string()))?;
        doc.validate()?;
        Ok(doc)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).expect("genesis doc serializes")
    }

    pub fn genesis_time(&self) -> Time {
        Time::from_millis(self.genesis_time)
    }

    pub fn app_hash_bytes(&self) -> Result<Vec<u8>, GenesisError> {
        if self.app_hash.is_empty() {
            return Ok(Vec::new());
        }
        hex::decode(&self.app_hash).map_err(|e| GenesisError::Hex {
            field: "app_hash".to_string(),
            reason: e.to_string(),
        })
    }

    pub fn validate(&self) -> Result<(), GenesisError> {
        if self.chain_id.is_empty() || self.chain_id.len() > MAX_CHAIN_ID_LEN {
            return Err(GenesisError::InvalidChainId(self.chain_id.len()));
        }
        if self.initial_height == 0 {
            return Err(GenesisError::InvalidInitialHeight(self.initial_height));
        }
        self.consensus_params.validate()?;
        if self.validators.is_empty() {
            return Err(GenesisError::NoValidators);
        }
        for gv in &self.validators {
            if gv.power <= 0 {
                return Err(GenesisError::NonPositivePower {
                    name: gv.name.clone(),
                    power: gv.power,
                });
            }
            if !self
                .consensus_params
                .validator
                .pub_key_types
                .contains(&gv.pub_key.key_type)
            {
                return Err(GenesisError::DisallowedKeyType {
                    name: gv.name.clone(),
                    key_type: gv.pub_key.key_type.clone(),
                });
            }
            let key = gv.parsed_key()?;
            if let Some(addr_hex) = &gv.address {
                let addr: Address = addr_hex.parse().map_err(|_| GenesisError::Hex {
                    field: format!("validators[{}].address", gv.name),
                    reason: "not a 20-byte hex address".to_string(),
                })?;
                if addr != key.address() {
                    return Err(GenesisError::AddressMismatch {
                        name: gv.name.clone(),
                    });
                }
            }
        }
        self.app_hash_bytes()?;
        Ok(())
    }

    /// Build the height-1 validator set.
    pub fn validator_set(&self) -> Result<ValidatorSet, GenesisError> {
        let vals = self
            .validators
            .iter()
            .map(|gv| Ok(Validator::new(gv.parsed_key()?, gv.power)))
            .collect::<Result<Vec<_>, GenesisError>>()?;
        Ok(ValidatorSet::new(vals)?)
    }
}

impl GenesisValidator {
    fn parsed_key(&self) -> Result<PublicKey, GenesisError> {
        let bytes = hex::decode(&self.pub_key.value).map_err(|e| GenesisError::MalformedKey {
            name: self.name.clone(),
            reason: e.to_string(),
        })?;
        PublicKey::from_type_and_bytes(&self.pub_key.key_type, &bytes).map_err(|e| {
            GenesisError::MalformedKey {
                name: self.name.clone(),
                reason: e.to_string(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Keypair;

    fn genesis_validator(seed: u8, power: i64) -> GenesisValidator {
        let kp = Keypair::from_seed([seed; 32]);
        GenesisValidator {
            address: Some(kp.address().to_string()),
            pub_key: GenesisPubKey {
                key_type: crate::crypto::ED25519_KEY_TYPE.to_string(),
                value: hex::encode(kp.public_key().as_bytes()),
            },
            power,
            name: format!("val-{seed}"),
        }
    }

    fn valid_doc() -> GenesisDoc {
        GenesisDoc {
            genesis_time: 1_700_000_000_000,
            chain_id: "palisade-test".to_string(),
            initial_height: 1,
            validators: vec![genesis_validator(1, 10), genesis_validator(2, 20)],
            app_hash: String::new(),
            app_state: serde_json::json!({"accounts": {}}),
            consensus_params: ConsensusParams::default(),
        }
    }

    #[test]
    fn json_round_trip() {
        let doc = valid_doc();
        let parsed = GenesisDoc::from_json(&doc.to_json()).unwrap();
        assert_eq!(doc, parsed);
    }

    #[test]
    fn validates_chain_id_bounds() {
        let mut doc = valid_doc();
        doc.chain_id = String::new();
        assert!(matches!(doc.validate(), Err(GenesisError::InvalidChainId(0))));

        doc.chain_id = "c".repeat(51);
        assert!(matches!(
            doc.validate(),
            Err(GenesisError::InvalidChainId(51))
        ));

        doc.chain_id = "c".repeat(50);
        doc.validate().unwrap();
    }

    #[test]
    fn validates_initial_height() {
        let mut doc = valid_doc();
        doc.initial_height = 0;
        assert_eq!(doc.validate(), Err(GenesisError::InvalidInitialHeight(0)));
    }

    #[test]
    fn rejects_disallowed_key_type() {
        let mut doc = valid_doc();
        doc.validators[0].pub_key.key_type = "palisade/PubKeySecp256k1".to_string();
        assert!(matches!(
            doc.validate(),
            Err(GenesisError::DisallowedKeyType { .. })
        ));
    }

    #[test]
    fn rejects_address_key_mismatch() {
        let mut doc = valid_doc();
        let other = Keypair::from_seed([99; 32]);
        doc.validators[0].address = Some(other.address().to_string());
        assert!(matches!(
            doc.validate(),
            Err(GenesisError::AddressMismatch { .. })
        ));
    }

    #[test]
    fn rejects_non_positive_power() {
        let mut doc = valid_doc();
        doc.validators[1].power = 0;
        assert!(matches!(
            doc.validate(),
            Err(GenesisError::NonPositivePower { .. })
        ));
    }

    #[test]
    fn builds_validator_set() {
        let doc = valid_doc();
        let set = doc.validator_set().unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.total_voting_power(), 30);
    }

    #[test]
    fn params_hash_changes_with_content() {
        let a = ConsensusParams::default();
        let mut b = a.clone();
        b.block.max_bytes += 1;
        assert_ne!(a.hash(), b.hash());

        let mut c = a.clone();
        c.feature.vote_extensions_enable_height = Some(10);
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn vote_extensions_activation() {
        let mut params = ConsensusParams::default();
        assert!(!params.vote_extensions_enabled(5));
        params.feature.vote_extensions_enable_height = Some(10);
        assert!(!params.vote_extensions_enabled(9));
        assert!(params.vote_extensions_enabled(10));
        assert!(params.vote_extensions_enabled(11));
    }

    #[test]
    fn params_validation() {
        let mut params = ConsensusParams::default();
        params.block.max_bytes = 0;
        assert!(params.validate().is_err());

        let mut params = ConsensusParams::default();
        params.validator.pub_key_types.clear();
        assert!(params.validate().is_err());
    }
}
