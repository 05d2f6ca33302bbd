//! The simulation event loop.

use crate::network::{NetworkConfig, SimNetwork};
use palisade_abci::kvstore::{lanes, KvStoreApp};
use palisade_abci::{share, Application, BlockExecutor, MemCursorStore, SharedApplication};
use palisade_consensus::{
    ChainState, ConsensusConfig, ConsensusState, PrivValidator, RecoveredState,
};
use palisade_core::{Action, Event, EventPriority, OutboundMessage, StateMachine};
use palisade_mempool::{MempoolConfig, MempoolState};
use palisade_types::test_utils::test_keypair;
use palisade_types::{
    Block, Commit, ConsensusParams, GenesisDoc, GenesisPubKey, GenesisValidator, Hash, Keypair,
    SignatureCache, Tx,
};
use parking_lot::Mutex;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Aggregate counters for determinism checks and debugging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimStats {
    pub events_processed: u64,
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub timers_set: u64,
    pub actions_generated: u64,
}

struct ScheduledEvent {
    time: Duration,
    priority: EventPriority,
    seq: u64,
    node: usize,
    event: Event,
}

impl PartialEq for ScheduledEvent {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScheduledEvent {}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the earliest event pops
        // first. Ties break by priority, then by insertion order.
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.priority.cmp(&self.priority))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct SimNode {
    machine: ConsensusState,
    app: SharedApplication,
    /// Blocks this node persisted, by height.
    blocks: BTreeMap<u64, (Block, Commit)>,
    /// Commit order as observed, for safety assertions.
    committed: Vec<(u64, Hash)>,
}

/// Runs N consensus nodes against a virtual clock.
pub struct SimulationRunner {
    nodes: Vec<SimNode>,
    net: SimNetwork,
    rng: ChaCha8Rng,
    queue: BinaryHeap<ScheduledEvent>,
    /// Messages cut off by a partition, replayed on heal. The real gossip
    /// layer keeps retransmitting from its per-peer state until delivery
    /// succeeds; this models that without a reactor.
    undelivered: Vec<(usize, Event)>,
    time: Duration,
    seq: u64,
    stats: SimStats,
}

/// Genesis shared by every simulated node.
pub(crate) fn simulation_genesis(config: &NetworkConfig) -> (Vec<Keypair>, GenesisDoc) {
    let keys: Vec<Keypair> = (0..config.validators).map(test_keypair).collect();
    let doc = GenesisDoc {
        genesis_time: 0,
        chain_id: "palisade-sim".to_string(),
        initial_height: 1,
        validators: keys
            .iter()
            .enumerate()
            .map(|(i, kp)| GenesisValidator {
                address: None,
                pub_key: GenesisPubKey {
                    key_type: palisade_types::ED25519_KEY_TYPE.to_string(),
                    value: kp
                        .public_key()
                        .as_bytes()
                        .iter()
                        .map(|b| format!("{b:02x}"))
                        .collect(),
                },
                power: config.voting_power,
                name: format!("sim-{i}"),
            })
            .collect(),
        app_hash: String::new(),
        app_state: serde_json::Value::Null,
        consensus_params: ConsensusParams::default(),
    };
    (keys, doc)
}

impl SimulationRunner {
    pub fn new(config: NetworkConfig, seed: u64) -> Self {
        let (keys, genesis) = simulation_genesis(&config);
        let chain = ChainState::from_genesis(&genesis).expect("simulation genesis is valid");
        let cache = Arc::new(SignatureCache::default());

        let nodes = keys
            .iter()
            .map(|key| {
                let app = share(KvStoreApp::new());
                app.lock().init_chain(palisade_abci::InitChainRequest {
                    chain_id: chain.chain_id.clone(),
                    initial_height: chain.initial_height,
                    time: chain.genesis_time,
                    validators: chain
                        .validators
                        .iter()
                        .map(|v| palisade_types::ValidatorUpdate {
                            pub_key: v.pub_key,
                            power: v.voting_power,
                        })
                        .collect(),
                    app_state: serde_json::Value::Null,
                    consensus_params: chain.consensus_params.clone(),
                });
                let executor =
                    BlockExecutor::new(app.clone(), Box::new(MemCursorStore::default()));
                let mempool = Arc::new(Mutex::new(MempoolState::new(
                    MempoolConfig::default(),
                    app.clone(),
                    lanes(),
                )));
                let machine = ConsensusState::new(
                    ConsensusConfig::fast(),
                    chain.clone(),
                    Some(PrivValidator::new(key.clone())),
                    executor,
                    mempool,
                    cache.clone(),
                    RecoveredState::default(),
                );
                SimNode {
                    machine,
                    app,
                    blocks: BTreeMap::new(),
                    committed: Vec::new(),
                }
            })
            .collect();

        SimulationRunner {
            nodes,
            net: SimNetwork::new(config),
            rng: ChaCha8Rng::seed_from_u64(seed),
            queue: BinaryHeap::new(),
            undelivered: Vec::new(),
            time: Duration::ZERO,
            seq: 0,
            stats: SimStats::default(),
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn stats(&self) -> &SimStats {
        &self.stats
    }

    pub fn now(&self) -> Duration {
        self.time
    }

    /// The application instance of one node, for queries.
    pub fn app(&self, node: usize) -> Option<&SharedApplication> {
        self.nodes.get(node).map(|n| &n.app)
    }

    /// Chain state of one node.
    pub fn chain(&self, node: usize) -> Option<&ChainState> {
        self.nodes.get(node).map(|n| n.machine.chain())
    }

    /// Commit log of one node: (height, block hash) in commit order.
    pub fn committed(&self, node: usize) -> &[(u64, Hash)] {
        &self.nodes[node].committed
    }

    /// A persisted block of one node.
    pub fn block(&self, node: usize, height: u64) -> Option<&(Block, Commit)> {
        self.nodes.get(node)?.blocks.get(&height)
    }

    /// Drop messages across the given groups from now on.
    pub fn partition(&mut self, groups: &[Vec<usize>]) {
        self.net.partition(groups);
    }

    /// Restore full connectivity and flush messages the partition cut
    /// off.
    pub fn heal(&mut self) {
        self.net.heal();
        let backlog = std::mem::take(&mut self.undelivered);
        for (to, event) in backlog {
            let delay = self.net.sample_latency(&mut self.rng);
            self.schedule(self.time + delay, to, event);
        }
    }

    /// Start consensus on every node at the current instant.
    pub fn start(&mut self) {
        for node in 0..self.nodes.len() {
            self.nodes[node].machine.set_now(self.time);
            let actions = self.nodes[node].machine.start();
            self.execute_actions(node, actions);
        }
    }

    /// Submit a client transaction to one node.
    pub fn submit_tx(&mut self, node: usize, tx: Tx) {
        self.schedule(self.time, node, Event::SubmitTransaction { tx });
    }

    /// Run the virtual clock forward to `deadline`.
    pub fn run_until(&mut self, deadline: Duration) {
        while let Some(head) = self.queue.peek() {
            if head.time > deadline {
                break;
            }
            let scheduled = self.queue.pop().expect("peeked");
            self.time = self.time.max(scheduled.time);
            self.stats.events_processed += 1;
            trace!(
                node = scheduled.node,
                event = scheduled.event.type_name(),
                time_ms = self.time.as_millis() as u64,
                "delivering event"
            );
            let node = scheduled.node;
            self.nodes[node].machine.set_now(self.time);
            let actions = self.nodes[node].machine.handle(scheduled.event);
            self.execute_actions(node, actions);
        }
        self.time = self.time.max(deadline);
    }

    fn schedule(&mut self, time: Duration, node: usize, event: Event) {
        let priority = event.priority();
        self.queue.push(ScheduledEvent {
            time,
            priority,
            seq: self.seq,
            node,
            event,
        });
        self.seq += 1;
    }

    fn execute_actions(&mut self, node: usize, actions: Vec<Action>) {
        for action in actions {
            self.stats.actions_generated += 1;
            match action {
                Action::Broadcast { message } => self.broadcast(node, message),
                Action::ScheduleTimeout {
                    height,
                    round,
                    step,
                    duration,
                } => {
                    self.stats.timers_set += 1;
                    self.schedule(
                        self.time + duration,
                        node,
                        Event::TimeoutElapsed {
                            height,
                            round,
                            step,
                        },
                    );
                }
                Action::EnqueueInternal { event } => {
                    self.schedule(self.time, node, event);
                }
                Action::PersistBlock { block, commit } => {
                    let height = block.header.height;
                    self.nodes[node].blocks.insert(height, (*block, commit));
                }
                Action::PersistOwnVote { .. } | Action::PersistEvidence { .. } => {
                    // Durable in the in-memory sense: the machine already
                    // holds this state for the process lifetime.
                }
                Action::PruneBlocks { retain_height } => {
                    self.nodes[node].blocks.retain(|h, _| *h >= retain_height);
                }
                Action::EmitCommittedBlock { block } => {
                    self.nodes[node]
                        .committed
                        .push((block.header.height, block.hash()));
                }
            }
        }
    }

    fn broadcast(&mut self, from: usize, message: OutboundMessage) {
        for to in 0..self.net.validators() {
            if to == from {
                continue;
            }
            let Some(event) = message_to_event(&message) else {
                continue;
            };
            if !self.net.can_deliver(from, to) {
                self.stats.messages_dropped += 1;
                self.undelivered.push((to, event));
                continue;
            }
            self.stats.messages_sent += 1;
            let delay = self.net.sample_latency(&mut self.rng);
            self.schedule(self.time + delay, to, event);
        }
    }

    /// Fire commit timeouts eagerly: convenience for tests that want to
    /// stop waiting at a height boundary rather than a wall-clock one.
    pub fn run_blocks(&mut self, node: usize, blocks: u64, max_time: Duration) -> bool {
        let target = self.nodes[node].committed.len() as u64 + blocks;
        let step = Duration::from_millis(50);
        let deadline = self.time + max_time;
        while (self.nodes[node].committed.len() as u64) < target {
            if self.time >= deadline || self.queue.is_empty() {
                return false;
            }
            let next = (self.time + step).min(deadline);
            self.run_until(next);
        }
        true
    }
}

/// An outbound message, as received by a peer.
fn message_to_event(message: &OutboundMessage) -> Option<Event> {
    match message {
        OutboundMessage::Proposal(g) => Some(Event::ProposalReceived {
            proposal: g.proposal.clone(),
        }),
        OutboundMessage::BlockPart(g) => Some(Event::BlockPartReceived {
            height: g.height,
            round: g.round,
            part: g.part.clone(),
        }),
        OutboundMessage::Vote(g) => Some(Event::VoteReceived {
            vote: g.vote.clone(),
        }),
        OutboundMessage::Evidence(g) => Some(Event::EvidenceReceived {
            evidence: g.evidence.clone(),
        }),
        OutboundMessage::Transaction(g) => Some(Event::TransactionReceived { tx: g.tx.clone() }),
        // State-channel chatter is a gossip optimization; the simulation
        // delivers everything directly.
        OutboundMessage::NewRoundStep(_) | OutboundMessage::HasVote(_) => None,
    }
}
