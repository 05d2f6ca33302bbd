//! The simulated network.

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::time::Duration;

/// Shape of the simulated network.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Number of validator nodes.
    pub validators: u8,
    /// Voting power per validator (equal stake).
    pub voting_power: i64,
    /// Base one-way message latency.
    pub latency: Duration,
    /// Fraction of the base latency applied as random jitter.
    pub jitter_fraction: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            validators: 4,
            voting_power: 10,
            latency: Duration::from_millis(10),
            jitter_fraction: 0.1,
        }
    }
}

/// Link state and latency sampling.
pub(crate) struct SimNetwork {
    config: NetworkConfig,
    /// When partitioned, each node's group id; messages only flow within
    /// a group.
    groups: Option<Vec<usize>>,
}

impl SimNetwork {
    pub(crate) fn new(config: NetworkConfig) -> Self {
        SimNetwork {
            config,
            groups: None,
        }
    }

    /// Split the network; nodes not named fall into their own singleton
    /// groups.
    pub(crate) fn partition(&mut self, groups: &[Vec<usize>]) {
        let n = usize::from(self.config.validators);
        let mut assignment = vec![usize::MAX; n];
        for (gid, members) in groups.iter().enumerate() {
            for &node in members {
                assignment[node] = gid;
            }
        }
        let mut next = groups.len();
        for slot in assignment.iter_mut() {
            if *slot == usize::MAX {
                *slot = next;
                next += 1;
            }
        }
        self.groups = Some(assignment);
    }

    pub(crate) fn heal(&mut self) {
        self.groups = None;
    }

    pub(crate) fn can_deliver(&self, from: usize, to: usize) -> bool {
        match &self.groups {
            None => true,
            Some(groups) => groups[from] == groups[to],
        }
    }

    /// Sample a delivery delay for one message hop.
    pub(crate) fn sample_latency(&self, rng: &mut ChaCha8Rng) -> Duration {
        let base = self.config.latency.as_micros() as f64;
        let jitter = base * self.config.jitter_fraction;
        let offset: f64 = rng.gen_range(-jitter..=jitter);
        Duration::from_micros((base + offset).max(0.0) as u64)
    }

    pub(crate) fn validators(&self) -> usize {
        usize::from(self.config.validators)
    }
}
