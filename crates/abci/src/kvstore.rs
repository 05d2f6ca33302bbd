//! The example key-value application.
//!
//! Transactions are `key=value` or `key:value` pairs. Transactions whose
//! key is `val` change the validator set: `val=<pubkey-hex>!<power>`.
//! The application hash is the Merkle root over the sorted store contents,
//! so any key's membership can be proven against a committed header.

use crate::application::Application;
use crate::types::*;
use palisade_types::merkle::{proofs_from_byte_slices, ValueOp};
use palisade_types::{wire, Hash, PublicKey, Tx, ValidatorUpdate, ED25519_KEY_TYPE};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Transaction is not `key=value` / `key:value` with non-empty halves.
pub const CODE_INVALID_TX_FORMAT: u32 = 2;

/// Key prefix marking a validator-set change transaction.
pub const VALIDATOR_TX_KEY: &str = "val";

/// Lane carrying validator-set changes.
pub const VALIDATOR_LANE: &str = "val";

/// Lane for transactions without a special class.
pub const DEFAULT_LANE: &str = "default";

/// Parse `key=value`, falling back to `key:value`. Both halves must be
/// non-empty.
fn parse_tx(tx: &[u8]) -> Option<(&[u8], &[u8])> {
    let split_at = tx
        .iter()
        .position(|&b| b == b'=')
        .or_else(|| tx.iter().position(|&b| b == b':'))?;
    let (key, rest) = tx.split_at(split_at);
    let value = &rest[1..];
    if key.is_empty() || value.is_empty() {
        return None;
    }
    Some((key, value))
}

/// Parse the value of a validator tx: `<pubkey-hex>!<power>`.
fn parse_validator_tx(value: &[u8]) -> Option<ValidatorUpdate> {
    let value = std::str::from_utf8(value).ok()?;
    let (key_hex, power) = value.split_once('!')?;
    let key_bytes = hex::decode(key_hex).ok()?;
    let pub_key = PublicKey::from_type_and_bytes(ED25519_KEY_TYPE, &key_bytes).ok()?;
    let power: i64 = power.parse().ok()?;
    (power >= 0).then_some(ValidatorUpdate { pub_key, power })
}

/// Build the canonical transaction for a validator change.
pub fn make_validator_tx(update: &ValidatorUpdate) -> Tx {
    let encoded = format!(
        "{VALIDATOR_TX_KEY}={}!{}",
        hex::encode(update.pub_key.as_bytes()),
        update.power
    );
    Tx(encoded.into_bytes())
}

/// Build a canonical `key=value` transaction.
pub fn make_tx(key: &str, value: &str) -> Tx {
    Tx(format!("{key}={value}").into_bytes())
}

/// Deterministic lane assignment: validator txs ride the validator lane,
/// everything else spreads across the bulk lanes by key.
pub fn assign_lane(tx: &[u8]) -> &'static str {
    match parse_tx(tx) {
        Some((key, _)) if key == VALIDATOR_TX_KEY.as_bytes() => VALIDATOR_LANE,
        Some((key, _)) => {
            let sum: u64 = key.iter().map(|&b| u64::from(b)).sum();
            match sum % 3 {
                0 => "foo",
                1 => DEFAULT_LANE,
                _ => "bar",
            }
        }
        None => DEFAULT_LANE,
    }
}

/// Lanes this application uses, with their reap priorities.
pub fn lanes() -> Vec<(String, u32)> {
    vec![
        (VALIDATOR_LANE.to_string(), 3),
        ("foo".to_string(), 1),
        ("bar".to_string(), 1),
        (DEFAULT_LANE.to_string(), 1),
    ]
}

/// In-memory key-value application.
///
/// State becomes visible to `info`/`query` only after `commit`, matching
/// the engine's finality boundary.
pub struct KvStoreApp {
    /// Committed store contents.
    store: BTreeMap<Vec<u8>, Vec<u8>>,
    /// Current validator powers by public key, for `/validators` queries
    /// and tests.
    validators: BTreeMap<Vec<u8>, (PublicKey, i64)>,
    /// Height staged by `finalize_block`, made durable by `commit`.
    staged: Option<StagedBlock>,
    last_committed_height: u64,
    last_app_hash: Vec<u8>,
    /// Keep this many recent blocks; `0` retains everything.
    retain_blocks: u64,
}

struct StagedBlock {
    height: u64,
    store: BTreeMap<Vec<u8>, Vec<u8>>,
    validators: BTreeMap<Vec<u8>, (PublicKey, i64)>,
    app_hash: Vec<u8>,
}

impl Default for KvStoreApp {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStoreApp {
    pub fn new() -> Self {
        KvStoreApp {
            store: BTreeMap::new(),
            validators: BTreeMap::new(),
            staged: None,
            last_committed_height: 0,
            last_app_hash: Vec::new(),
            retain_blocks: 0,
        }
    }

    /// Retain only the most recent `blocks` heights after each commit.
    pub fn with_retain_blocks(mut self, blocks: u64) -> Self {
        self.retain_blocks = blocks;
        self
    }

    /// Current validator set as (key, power) pairs, for tests and the
    /// `/validators` query path.
    pub fn validators(&self) -> Vec<ValidatorUpdate> {
        self.validators
            .values()
            .map(|(pub_key, power)| ValidatorUpdate {
                pub_key: *pub_key,
                power: *power,
            })
            .collect()
    }

    /// Leaf encoding for one store entry: the shape `ValueOp` expects.
    fn entry_leaf(key: &[u8], value: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(key.len() + 40);
        wire::write_bytes(&mut out, key);
        wire::write_bytes(&mut out, Hash::sum(value).as_bytes());
        out
    }

    fn compute_app_hash(store: &BTreeMap<Vec<u8>, Vec<u8>>) -> Vec<u8> {
        let leaves: Vec<Vec<u8>> = store
            .iter()
            .map(|(k, v)| Self::entry_leaf(k, v))
            .collect();
        palisade_types::merkle::hash_from_byte_slices(&leaves)
            .as_bytes()
            .to_vec()
    }
}

impl Application for KvStoreApp {
    fn info(&self) -> InfoResponse {
        InfoResponse {
            data: "palisade kvstore".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            last_block_height: self.last_committed_height,
            last_block_app_hash: self.last_app_hash.clone(),
        }
    }

    fn init_chain(&mut self, req: InitChainRequest) -> InitChainResponse {
        for update in &req.validators {
            self.validators.insert(
                update.pub_key.as_bytes().to_vec(),
                (update.pub_key, update.power),
            );
        }
        // Genesis app state: a flat {key: value} object.
        if let Some(entries) = req.app_state.as_object() {
            for (key, value) in entries {
                if let Some(value) = value.as_str() {
                    self.store
                        .insert(key.clone().into_bytes(), value.as_bytes().to_vec());
                }
            }
        }
        self.last_app_hash = Self::compute_app_hash(&self.store);
        info!(
            chain_id = %req.chain_id,
            validators = req.validators.len(),
            entries = self.store.len(),
            "kvstore initialized"
        );
        InitChainResponse {
            validators: Vec::new(),
            app_hash: self.last_app_hash.clone(),
            consensus_params: None,
        }
    }

    fn check_tx(&mut self, tx: &Tx, _kind: CheckTxKind) -> CheckTxResponse {
        let Some((key, value)) = parse_tx(tx.as_bytes()) else {
            return CheckTxResponse::error(CODE_INVALID_TX_FORMAT, "expected key=value");
        };
        if key == VALIDATOR_TX_KEY.as_bytes() && parse_validator_tx(value).is_none() {
            return CheckTxResponse::error(
                CODE_INVALID_TX_FORMAT,
                "expected val=<pubkey-hex>!<power>",
            );
        }
        CheckTxResponse::ok().with_lane(assign_lane(tx.as_bytes()))
    }

    fn prepare_proposal(&mut self, req: PrepareProposalRequest) -> Vec<Tx> {
        // Drop empty transactions, keep order, respect the byte budget.
        let mut total: i64 = 0;
        let mut txs = Vec::with_capacity(req.txs.len());
        for tx in req.txs {
            if tx.is_empty() {
                continue;
            }
            let size = tx.len() as i64;
            if req.max_tx_bytes > 0 && total + size > req.max_tx_bytes {
                break;
            }
            total += size;
            txs.push(tx);
        }
        txs
    }

    fn process_proposal(&mut self, req: ProcessProposalRequest) -> ProposalStatus {
        for tx in &req.txs {
            match parse_tx(tx.as_bytes()) {
                None => return ProposalStatus::Reject,
                Some((key, value)) => {
                    if key == VALIDATOR_TX_KEY.as_bytes() && parse_validator_tx(value).is_none() {
                        return ProposalStatus::Reject;
                    }
                }
            }
        }
        ProposalStatus::Accept
    }

    fn finalize_block(&mut self, req: FinalizeBlockRequest) -> FinalizeBlockResponse {
        let mut store = self.store.clone();
        let mut validators = self.validators.clone();
        let mut tx_results = Vec::with_capacity(req.txs.len());
        let mut validator_updates = Vec::new();
        let mut events = Vec::new();

        for tx in &req.txs {
            let Some((key, value)) = parse_tx(tx.as_bytes()) else {
                tx_results.push(TxResult::error(CODE_INVALID_TX_FORMAT, "expected key=value"));
                continue;
            };
            if key == VALIDATOR_TX_KEY.as_bytes() {
                let Some(update) = parse_validator_tx(value) else {
                    tx_results.push(TxResult::error(
                        CODE_INVALID_TX_FORMAT,
                        "expected val=<pubkey-hex>!<power>",
                    ));
                    continue;
                };
                let key_bytes = update.pub_key.as_bytes().to_vec();
                if update.power == 0 {
                    validators.remove(&key_bytes);
                } else {
                    validators.insert(key_bytes, (update.pub_key, update.power));
                }
                validator_updates.push(update);
                tx_results.push(TxResult::ok());
                continue;
            }

            store.insert(key.to_vec(), value.to_vec());
            events.push(AppEvent {
                kind: "store".to_string(),
                attributes: vec![(
                    String::from_utf8_lossy(key).to_string(),
                    String::from_utf8_lossy(value).to_string(),
                )],
            });
            tx_results.push(TxResult::ok());
        }

        let app_hash = Self::compute_app_hash(&store);
        debug!(
            height = req.height,
            txs = req.txs.len(),
            updates = validator_updates.len(),
            "finalized block"
        );
        self.staged = Some(StagedBlock {
            height: req.height,
            store,
            validators,
            app_hash: app_hash.clone(),
        });

        FinalizeBlockResponse {
            tx_results,
            validator_updates,
            consensus_param_updates: None,
            app_hash,
            events,
        }
    }

    fn commit(&mut self) -> CommitResponse {
        let staged = self.staged.take().expect("commit without finalize_block");
        self.store = staged.store;
        self.validators = staged.validators;
        self.last_committed_height = staged.height;
        self.last_app_hash = staged.app_hash;

        let retain_height = if self.retain_blocks > 0 {
            self.last_committed_height
                .saturating_sub(self.retain_blocks - 1)
        } else {
            0
        };
        CommitResponse { retain_height }
    }

    fn query(&self, req: QueryRequest) -> QueryResponse {
        match req.path.as_str() {
            "/store" => {
                let key = req.data.clone();
                let Some(value) = self.store.get(&key) else {
                    return QueryResponse {
                        code: 1,
                        key,
                        height: self.last_committed_height,
                        log: "does not exist".to_string(),
                        ..Default::default()
                    };
                };
                let mut resp = QueryResponse {
                    code: CODE_OK,
                    key: key.clone(),
                    value: value.clone(),
                    height: self.last_committed_height,
                    log: "exists".to_string(),
                    proof_ops: Vec::new(),
                };
                if req.prove {
                    let leaves: Vec<Vec<u8>> = self
                        .store
                        .iter()
                        .map(|(k, v)| Self::entry_leaf(k, v))
                        .collect();
                    let index = self
                        .store
                        .keys()
                        .position(|k| *k == key)
                        .expect("key exists");
                    let (_, mut proofs) = proofs_from_byte_slices(&leaves);
                    let op = ValueOp::new(&key, proofs.remove(index));
                    resp.proof_ops = vec![palisade_types::merkle::ProofOperator::proof_op(&op)];
                }
                resp
            }
            _ => QueryResponse {
                code: 1,
                log: format!("unknown query path {:?}", req.path),
                height: self.last_committed_height,
                ..Default::default()
            },
        }
    }
}
