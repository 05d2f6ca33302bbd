//! Transaction mempool.
//!
//! This crate implements the mempool as a pure, synchronous state
//! machine. It handles:
//!
//! - Transaction admission through the application's `check_tx`
//! - Lane partitioning with priority-weighted reaping
//! - Eviction and recheck after each committed block
//!
//! Uses `HashMap` instead of a concurrent map since there's no concurrent
//! access: all access is serialized through the event loop.

mod state;

pub use state::{AddTxOutcome, MempoolConfig, MempoolState};
