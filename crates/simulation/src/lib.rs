//! Deterministic simulation of a Palisade network.
//!
//! Runs N consensus state machines against a virtual clock and an
//! in-memory network with seeded latency jitter. The same seed always
//! produces the same schedule, which is the property that makes failures
//! replayable.
//!
//! The harness executes actions the way the production runner would:
//! broadcasts become delayed deliveries to the other nodes, timeouts
//! become scheduled timer events, persistence lands in an in-memory
//! store, and internal events are re-queued at the current instant with
//! internal priority so causality is preserved.

mod network;
mod runner;

pub use network::NetworkConfig;
pub use runner::{SimStats, SimulationRunner};
