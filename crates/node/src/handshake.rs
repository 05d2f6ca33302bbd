//! Startup handshake.
//!
//! Brings the application and the block store back into agreement before
//! consensus starts:
//!
//! 1. Load the chain state; on a fresh store, build it from genesis and
//!    run `init_chain`.
//! 2. Replay any stored blocks the application has not durably committed,
//!    tracking the call cursor.
//! 3. Verify the application hash matches the engine's record; divergence
//!    is fatal (exit code 2), the node must never fork.

use crate::storage::{RocksCursorStore, Store};
use crate::NodeError;
use palisade_abci::{
    Application, BlockExecutor, FinalizeBlockRequest, InitChainRequest, SharedApplication,
};
use palisade_consensus::{ChainState, RecoveredState};
use palisade_types::{GenesisDoc, ValidatorUpdate};
use tracing::info;

/// The pieces `bootstrap` hands to the runner.
pub struct Bootstrapped {
    pub chain: ChainState,
    pub executor: BlockExecutor,
    pub recovered: RecoveredState,
}

impl std::fmt::Debug for Bootstrapped {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bootstrapped")
            .field("chain", &self.chain)
            .field("recovered", &self.recovered)
            .finish_non_exhaustive()
    }
}

/// Prepare chain state, executor, and recovered consensus state.
pub fn bootstrap(
    store: &Store,
    genesis: &GenesisDoc,
    app: SharedApplication,
) -> Result<Bootstrapped, NodeError> {
    let mut executor = BlockExecutor::new(app.clone(), Box::new(RocksCursorStore::new(store)));

    let mut chain = match store.load_chain_state()? {
        Some(chain) => {
            info!(
                height = chain.last_block_height,
                "resuming from stored chain state"
            );
            chain
        }
        None => {
            info!(chain_id = %genesis.chain_id, "fresh store, building state from genesis");
            ChainState::from_genesis(genesis)?
        }
    };

    // Nothing committed yet and a fresh application: run the genesis
    // handshake. `init_chain` is deterministic, so re-running it after a
    // crash before the first commit reproduces the same state.
    let app_height = app.lock().info().last_block_height;
    if chain.last_block_height == 0 && app_height == 0 {
        let response = app.lock().init_chain(InitChainRequest {
            chain_id: chain.chain_id.clone(),
            initial_height: chain.initial_height,
            time: chain.genesis_time,
            validators: chain
                .validators
                .iter()
                .map(|v| ValidatorUpdate {
                    pub_key: v.pub_key,
                    power: v.voting_power,
                })
                .collect(),
            app_state: genesis.app_state.clone(),
            consensus_params: chain.consensus_params.clone(),
        });

        // The application may override the genesis app hash and consensus
        // params; a replacement validator set applies to both upcoming
        // heights.
        if !response.app_hash.is_empty() {
            chain.app_hash = response.app_hash;
        }
        if let Some(params) = response.consensus_params {
            params.validate()?;
            chain.consensus_params = params;
        }
        if !response.validators.is_empty() {
            chain.validators.update_with(&response.validators)?;
            chain.next_validators = chain.validators.copy_increment_proposer_priority(1);
        }
        store.save_chain_state(&chain);
    }

    // Replay whatever the application is missing.
    let store_height = chain.last_block_height;
    let replayed = executor.replay_to(
        store_height,
        &chain.app_hash,
        block_requests(store, store_height),
    )?;
    if replayed > 0 {
        info!(replayed, "application caught up with the block store");
    }

    let last_commit = if store_height > 0 {
        store.block(store_height).map(|(_, commit)| commit)
    } else {
        None
    };

    let recovered = RecoveredState {
        chain: Some(chain.clone()),
        last_commit,
        own_votes: store.load_own_votes(),
        evidence: store.load_evidence(),
    };

    Ok(Bootstrapped {
        chain,
        executor,
        recovered,
    })
}

/// Finalize requests for every stored block up to `store_height`.
///
/// Commit metadata is not reconstructed during replay; deterministic
/// applications must not condition state transitions on it (the kv
/// example does not).
fn block_requests(
    store: &Store,
    store_height: u64,
) -> impl Iterator<Item = FinalizeBlockRequest> + '_ {
    let base = store.base_height().unwrap_or(1);
    (base..=store_height).filter_map(move |height| {
        let (block, _) = store.block(height)?;
        Some(FinalizeBlockRequest {
            height,
            time: block.header.time,
            hash: block.hash(),
            txs: block.data.clone(),
            decided_last_commit: None,
            misbehavior: Vec::new(),
            proposer_address: block.header.proposer_address,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_abci::kvstore::KvStoreApp;
    use palisade_abci::share;
    use palisade_types::test_utils::test_keypair;
    use palisade_types::{ConsensusParams, GenesisPubKey, GenesisValidator};
    use tempfile::TempDir;

    fn test_genesis() -> GenesisDoc {
        GenesisDoc {
            genesis_time: 500,
            chain_id: "handshake-test".to_string(),
            initial_height: 1,
            validators: (0..4u8)
                .map(|i| {
                    let kp = test_keypair(i);
                    GenesisValidator {
                        address: None,
                        pub_key: GenesisPubKey {
                            key_type: palisade_types::ED25519_KEY_TYPE.to_string(),
                            value: hex::encode(kp.public_key().as_bytes()),
                        },
                        power: 10,
                        name: format!("v{i}"),
                    }
                })
                .collect(),
            app_hash: String::new(),
            app_state: serde_json::json!({"seeded": "yes"}),
            consensus_params: ConsensusParams::default(),
        }
    }

    #[test]
    fn fresh_store_initializes_from_genesis() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let app = share(KvStoreApp::new());

        let boot = bootstrap(&store, &test_genesis(), app.clone()).unwrap();
        assert_eq!(boot.chain.last_block_height, 0);
        assert_eq!(boot.chain.validators.len(), 4);
        // The kv app hashed the seeded genesis state.
        assert!(!boot.chain.app_hash.is_empty());
        assert_eq!(
            app.lock().query(palisade_abci::QueryRequest {
                path: "/store".to_string(),
                data: b"seeded".to_vec(),
                height: 0,
                prove: false,
            })
            .value,
            b"yes"
        );

        // Chain state was persisted: a second bootstrap resumes.
        let boot2 = bootstrap(&store, &test_genesis(), share(KvStoreApp::new())).unwrap();
        assert_eq!(boot2.chain, boot.chain);
    }

    #[test]
    fn app_hash_divergence_is_fatal() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let app = share(KvStoreApp::new());
        let boot = bootstrap(&store, &test_genesis(), app).unwrap();

        // Corrupt the stored app hash and bootstrap with a fresh app.
        let mut chain = boot.chain;
        chain.last_block_height = 0;
        chain.app_hash = vec![0xde, 0xad, 0xbe, 0xef];
        store.save_chain_state(&chain);

        // Height 0 skips the hash check (nothing committed yet); simulate
        // a committed chain by bumping the height with no stored blocks:
        // replay finds nothing and the hashes disagree.
        chain.last_block_height = 1;
        store.save_chain_state(&chain);

        let err = bootstrap(&store, &test_genesis(), share(KvStoreApp::new())).unwrap_err();
        assert_eq!(err.exit_code(), crate::exit_code::APP_HASH_MISMATCH);
    }
}
