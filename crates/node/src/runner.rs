//! The production event loop.
//!
//! One task owns the consensus state machine and consumes a bounded,
//! backpressured event queue. Actions returned by the machine execute in
//! order before the next event is delivered, which is what makes the
//! persist-before-broadcast and persist-before-apply guarantees real.

use crate::codec::{channel_for_message, decode_wire_message, encode_wire_message};
use crate::storage::Store;
use crate::timers::TimerManager;
use palisade_consensus::ConsensusState;
use palisade_core::{Action, Event, StateMachine};
use palisade_types::Block;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Where outbound gossip goes. The transport itself (peer management,
/// authentication, per-peer backpressure) is outside this crate; the bus
/// is handed encoded frames and a channel id.
pub trait GossipBus: Send + Sync {
    fn broadcast(&self, channel: u8, bytes: Vec<u8>);
}

/// A bus that drops everything; single-node setups and tests.
#[derive(Debug, Default)]
pub struct NullGossipBus;

impl GossipBus for NullGossipBus {
    fn broadcast(&self, _channel: u8, _bytes: Vec<u8>) {}
}

/// Cloneable handle for feeding events into a running node.
#[derive(Clone)]
pub struct NodeHandle {
    event_tx: mpsc::Sender<Event>,
    cancel: CancellationToken,
    blocks: broadcast::Sender<Arc<Block>>,
}

impl NodeHandle {
    /// Submit a client transaction.
    pub async fn submit_tx(&self, tx: palisade_types::Tx) -> bool {
        self.event_tx
            .send(Event::SubmitTransaction { tx })
            .await
            .is_ok()
    }

    /// Inject a wire message received from a peer.
    ///
    /// Malformed frames are logged and dropped; the caller may score the
    /// peer down.
    pub async fn deliver_wire_message(&self, data: &[u8]) -> bool {
        match decode_wire_message(data) {
            Ok(Some(event)) => self.event_tx.send(event).await.is_ok(),
            Ok(None) => true,
            Err(e) => {
                warn!(error = %e, "dropping malformed wire message");
                false
            }
        }
    }

    /// Subscribe to committed blocks.
    pub fn subscribe_blocks(&self) -> broadcast::Receiver<Arc<Block>> {
        self.blocks.subscribe()
    }

    /// Request a clean shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Owns the machine and executes its actions.
pub struct NodeRunner {
    machine: ConsensusState,
    store: Arc<Store>,
    bus: Arc<dyn GossipBus>,
    timers: TimerManager,
    event_tx: mpsc::Sender<Event>,
    event_rx: mpsc::Receiver<Event>,
    cancel: CancellationToken,
    blocks: broadcast::Sender<Arc<Block>>,
}

impl NodeRunner {
    pub fn new(
        machine: ConsensusState,
        store: Arc<Store>,
        bus: Arc<dyn GossipBus>,
        queue_size: usize,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(queue_size);
        let (blocks, _) = broadcast::channel(64);
        let timers = TimerManager::new(event_tx.clone());
        NodeRunner {
            machine,
            store,
            bus,
            timers,
            event_tx,
            event_rx,
            cancel: CancellationToken::new(),
            blocks,
        }
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            event_tx: self.event_tx.clone(),
            cancel: self.cancel.clone(),
            blocks: self.blocks.clone(),
        }
    }

    fn wall_now() -> std::time::Duration {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
    }

    /// Run until shutdown. Drains the queue, cancels timers, and flushes
    /// the store before returning.
    pub async fn run(mut self) {
        info!(height = self.machine.height(), "node runner starting");
        self.machine.set_now(Self::wall_now());
        let actions = self.machine.start();
        self.execute(actions);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = self.event_rx.recv() => {
                    let Some(event) = event else { break };
                    self.machine.set_now(Self::wall_now());
                    let actions = self.machine.handle(event);
                    self.execute(actions);
                }
            }
        }

        // Drain whatever was queued before the shutdown signal.
        while let Ok(event) = self.event_rx.try_recv() {
            self.machine.set_now(Self::wall_now());
            let actions = self.machine.handle(event);
            self.execute(actions);
        }
        self.timers.cancel_all();
        self.store.flush();
        info!("node runner stopped");
    }

    fn execute(&mut self, actions: Vec<Action>) {
        for action in actions {
            trace!(kind = action.type_name(), "executing action");
            match action {
                Action::Broadcast { message } => {
                    let channel = channel_for_message(&message);
                    let bytes = encode_wire_message(&message);
                    debug!(
                        channel,
                        kind = message.type_name(),
                        len = bytes.len(),
                        "broadcasting"
                    );
                    self.bus.broadcast(channel, bytes);
                }
                Action::ScheduleTimeout {
                    height,
                    round,
                    step,
                    duration,
                } => {
                    self.timers.schedule(height, round, step, duration);
                }
                Action::EnqueueInternal { event } => {
                    // Internal events preserve causality by running before
                    // anything queued behind the current event.
                    self.machine.set_now(Self::wall_now());
                    let nested = self.machine.handle(event);
                    self.execute(nested);
                }
                Action::PersistBlock { block, commit } => {
                    self.store.put_block(&block, &commit);
                }
                Action::PersistOwnVote {
                    height,
                    round,
                    vote_type,
                    block_id,
                } => {
                    self.store.put_own_vote(height, round, vote_type, block_id);
                }
                Action::PersistEvidence { evidence } => {
                    self.store.put_evidence(&evidence);
                }
                Action::PruneBlocks { retain_height } => {
                    self.store.prune_blocks(retain_height);
                }
                Action::EmitCommittedBlock { block } => {
                    // The chain state just advanced past this block; keep
                    // the durable copy in step and tell observers.
                    self.store.save_chain_state(self.machine.chain());
                    self.store.prune_own_votes(block.header.height);
                    let _ = self.blocks.send(Arc::from(block));
                }
            }
        }
    }
}
