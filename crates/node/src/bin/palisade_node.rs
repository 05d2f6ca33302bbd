//! The `palisade-node` binary.

use clap::{Parser, Subcommand};
use palisade_abci::kvstore::{lanes, KvStoreApp};
use palisade_abci::share;
use palisade_consensus::{ConsensusState, PrivValidator};
use palisade_mempool::MempoolState;
use palisade_node::{bootstrap, exit_code, NodeConfig, NodeError, NodeRunner, NullGossipBus, Store};
use palisade_types::{
    ConsensusParams, GenesisDoc, GenesisPubKey, GenesisValidator, Keypair, SignatureCache,
};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "palisade-node", about = "Palisade consensus node")]
struct Cli {
    /// Home directory (config, genesis, keys, data).
    #[arg(long, default_value = ".palisade")]
    home: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a home directory with a fresh key and a single-validator
    /// genesis.
    Init {
        #[arg(long, default_value = "palisade-dev")]
        chain_id: String,
    },
    /// Run the node.
    Run,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Command::Init { chain_id } => match init_home(&cli.home, &chain_id) {
            Ok(()) => exit_code::OK,
            Err(e) => {
                error!(error = %e, "init failed");
                e.exit_code()
            }
        },
        Command::Run => match run_node(&cli.home) {
            Ok(()) => exit_code::OK,
            Err(e) => {
                error!(error = %e, "node terminated");
                e.exit_code()
            }
        },
    };
    std::process::exit(code);
}

fn init_home(home: &Path, chain_id: &str) -> Result<(), NodeError> {
    std::fs::create_dir_all(home)?;
    let config = NodeConfig::default();

    let seed: [u8; 32] = rand::random();
    let keypair = Keypair::from_seed(seed);
    let key_path = home.join(config.validator_key_file.as_deref().unwrap_or("validator_key"));
    std::fs::write(&key_path, hex::encode(seed))?;

    let genesis = GenesisDoc {
        genesis_time: std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64,
        chain_id: chain_id.to_string(),
        initial_height: 1,
        validators: vec![GenesisValidator {
            address: Some(keypair.address().to_string()),
            pub_key: GenesisPubKey {
                key_type: palisade_types::ED25519_KEY_TYPE.to_string(),
                value: hex::encode(keypair.public_key().as_bytes()),
            },
            power: 10,
            name: "validator".to_string(),
        }],
        app_hash: String::new(),
        app_state: serde_json::json!({}),
        consensus_params: ConsensusParams::default(),
    };
    genesis.validate()?;
    std::fs::write(config.genesis_path(home), genesis.to_json())?;
    std::fs::write(
        home.join("config.json"),
        serde_json::to_string_pretty(&config).expect("config serializes"),
    )?;

    info!(home = %home.display(), address = %keypair.address(), "home initialized");
    Ok(())
}

fn run_node(home: &Path) -> Result<(), NodeError> {
    let config = NodeConfig::load(home)?;

    let genesis_text = std::fs::read_to_string(config.genesis_path(home))?;
    let genesis = GenesisDoc::from_json(&genesis_text)?;

    let privval = match config.validator_key_path(home) {
        Some(path) if path.exists() => {
            let seed_hex = std::fs::read_to_string(&path)?;
            let seed_bytes = hex::decode(seed_hex.trim())
                .map_err(|e| NodeError::Config(format!("validator key: {e}")))?;
            let seed: [u8; 32] = seed_bytes
                .try_into()
                .map_err(|_| NodeError::Config("validator key must be 32 hex bytes".into()))?;
            Some(PrivValidator::new(Keypair::from_seed(seed)))
        }
        _ => {
            info!("no validator key, running as observer");
            None
        }
    };

    let store = Arc::new(Store::open(config.db_path(home))?);
    let app = share(KvStoreApp::new());
    let boot = bootstrap(&store, &genesis, app.clone())?;

    let mempool = Arc::new(Mutex::new(MempoolState::new(
        config.mempool_config(),
        app,
        lanes(),
    )));
    let machine = ConsensusState::new(
        config.consensus_config(),
        boot.chain,
        privval,
        boot.executor,
        mempool,
        Arc::new(SignatureCache::default()),
        boot.recovered,
    );

    let runner = NodeRunner::new(
        machine,
        store,
        Arc::new(NullGossipBus),
        config.event_queue_size,
    );
    let handle = runner.handle();

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let shutdown = handle.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                shutdown.shutdown();
            }
        });
        runner.run().await;
    });
    Ok(())
}
