//! The production node.
//!
//! Wires the deterministic state machine to the real world: a tokio event
//! loop with a bounded queue, spawned-task timers, RocksDB persistence,
//! the startup handshake against the application, and a pluggable gossip
//! bus. Everything consensus-critical stays inside the state machine;
//! this crate only executes its actions.

mod codec;
mod config;
mod handshake;
mod runner;
mod storage;
mod timers;

pub use codec::{channel, decode_wire_message, encode_wire_message, CodecError, WIRE_VERSION};
pub use config::NodeConfig;
pub use handshake::{bootstrap, Bootstrapped};
pub use runner::{GossipBus, NodeHandle, NodeRunner, NullGossipBus};
pub use storage::{RocksCursorStore, Store, StoreError};
pub use timers::TimerManager;

use thiserror::Error;

/// Process exit codes.
pub mod exit_code {
    /// Clean shutdown.
    pub const OK: i32 = 0;
    /// Unrecoverable error (storage, configuration).
    pub const FATAL: i32 = 1;
    /// The application disagrees with the stored chain; halting beats
    /// forking.
    pub const APP_HASH_MISMATCH: i32 = 2;
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("genesis error: {0}")]
    Genesis(#[from] palisade_types::GenesisError),

    #[error("validator set error: {0}")]
    ValidatorSet(#[from] palisade_types::ValidatorSetError),

    #[error("chain state error: {0}")]
    Chain(#[from] palisade_consensus::ChainError),

    #[error("handshake failed: {0}")]
    Handshake(#[from] palisade_abci::ExecutorError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),
}

impl NodeError {
    /// The exit code this error should terminate the process with.
    pub fn exit_code(&self) -> i32 {
        match self {
            NodeError::Handshake(palisade_abci::ExecutorError::AppHashMismatch { .. }) => {
                exit_code::APP_HASH_MISMATCH
            }
            _ => exit_code::FATAL,
        }
    }
}
