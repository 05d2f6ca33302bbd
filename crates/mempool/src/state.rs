//! Mempool state.

use palisade_abci::{Application, CheckTxKind, SharedApplication};
use palisade_types::{Hash, Tx};
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::{debug, trace};

/// Mempool limits.
#[derive(Debug, Clone)]
pub struct MempoolConfig {
    /// Maximum number of pooled transactions.
    pub max_txs: usize,
    /// Maximum total bytes across all pooled transactions.
    pub max_bytes: usize,
    /// Re-run `check_tx` on survivors after each commit.
    pub recheck: bool,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        MempoolConfig {
            max_txs: 5_000,
            max_bytes: 64 * 1024 * 1024,
            recheck: true,
        }
    }
}

/// Outcome of offering a transaction to the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddTxOutcome {
    /// Admitted; worth gossiping to peers.
    Added { lane: String },
    /// Already pooled; do not re-gossip.
    Duplicate,
    /// The application refused it.
    Rejected { code: u32, log: String },
    /// Pool limits reached.
    Full,
}

#[derive(Debug)]
struct PoolEntry {
    tx: Tx,
    lane: String,
}

#[derive(Debug)]
struct Lane {
    priority: u32,
    /// FIFO admission order within the lane.
    queue: VecDeque<Hash>,
}

/// The lane-partitioned transaction pool.
///
/// Reaping is a weighted round-robin: each pass visits lanes in
/// descending priority (name order breaking ties) and takes up to
/// `priority` transactions from each non-empty lane, preserving FIFO
/// order within a lane. Every lane with priority >= 1 is visited each
/// pass, so no lane starves.
pub struct MempoolState {
    config: MempoolConfig,
    app: SharedApplication,
    lanes: BTreeMap<String, Lane>,
    default_lane: String,
    pool: HashMap<Hash, PoolEntry>,
    total_bytes: usize,
}

impl MempoolState {
    /// `lane_priorities` declares the known lanes; the first entry is also
    /// the fallback for transactions the application does not classify.
    /// Lanes the application names later are registered on the fly with
    /// priority 1.
    pub fn new(
        config: MempoolConfig,
        app: SharedApplication,
        lane_priorities: Vec<(String, u32)>,
    ) -> Self {
        let default_lane = lane_priorities
            .first()
            .map(|(name, _)| name.clone())
            .unwrap_or_else(|| "default".to_string());
        let mut lanes: BTreeMap<String, Lane> = lane_priorities
            .into_iter()
            .map(|(name, priority)| {
                (
                    name,
                    Lane {
                        priority: priority.max(1),
                        queue: VecDeque::new(),
                    },
                )
            })
            .collect();
        lanes.entry(default_lane.clone()).or_insert(Lane {
            priority: 1,
            queue: VecDeque::new(),
        });
        MempoolState {
            config,
            app,
            lanes,
            default_lane,
            pool: HashMap::new(),
            total_bytes: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.pool.contains_key(hash)
    }

    /// Offer a transaction, running the application's admission check.
    pub fn add_tx(&mut self, tx: Tx) -> AddTxOutcome {
        let hash = tx.hash();
        if self.pool.contains_key(&hash) {
            return AddTxOutcome::Duplicate;
        }
        if self.pool.len() >= self.config.max_txs
            || self.total_bytes + tx.len() > self.config.max_bytes
        {
            return AddTxOutcome::Full;
        }

        let response = self.app.lock().check_tx(&tx, CheckTxKind::New);
        if !response.is_ok() {
            trace!(?hash, code = response.code, "transaction rejected");
            return AddTxOutcome::Rejected {
                code: response.code,
                log: response.log,
            };
        }

        let lane = response.lane.unwrap_or_else(|| self.default_lane.clone());
        let lane_entry = self.lanes.entry(lane.clone()).or_insert_with(|| Lane {
            priority: 1,
            queue: VecDeque::new(),
        });
        lane_entry.queue.push_back(hash);
        self.total_bytes += tx.len();
        self.pool.insert(hash, PoolEntry { tx, lane: lane.clone() });
        trace!(?hash, lane = %lane, "transaction added");
        AddTxOutcome::Added { lane }
    }

    /// Collect transactions for a proposal, up to `max_bytes`.
    ///
    /// Transactions stay pooled; they are only evicted once committed (or
    /// rejected on recheck).
    pub fn reap(&self, max_bytes: i64) -> Vec<Tx> {
        // Lanes in descending priority, name order breaking ties.
        let mut order: Vec<(&String, &Lane)> = self.lanes.iter().collect();
        order.sort_by(|(name_a, lane_a), (name_b, lane_b)| {
            lane_b
                .priority
                .cmp(&lane_a.priority)
                .then_with(|| name_a.cmp(name_b))
        });

        let mut cursors: Vec<(usize, &Lane)> = order.iter().map(|(_, l)| (0usize, *l)).collect();
        let mut reaped = Vec::new();
        let mut total: i64 = 0;
        loop {
            let mut progressed = false;
            for (cursor, lane) in &mut cursors {
                for _ in 0..lane.priority {
                    let Some(hash) = lane.queue.get(*cursor) else {
                        break;
                    };
                    let entry = &self.pool[hash];
                    let size = entry.tx.len() as i64;
                    if max_bytes > 0 && total + size > max_bytes {
                        return reaped;
                    }
                    total += size;
                    reaped.push(entry.tx.clone());
                    *cursor += 1;
                    progressed = true;
                }
            }
            if !progressed {
                return reaped;
            }
        }
    }

    /// A block committed: evict its transactions, then re-check the
    /// survivors and drop any the application no longer accepts.
    pub fn update_committed(&mut self, height: u64, committed: &[Tx]) {
        let mut evicted = 0usize;
        for tx in committed {
            if self.remove(&tx.hash()) {
                evicted += 1;
            }
        }

        let mut rechecked = 0usize;
        if self.config.recheck {
            let survivors: Vec<Hash> = self.pool.keys().copied().collect();
            for hash in survivors {
                let tx = self.pool[&hash].tx.clone();
                let response = self.app.lock().check_tx(&tx, CheckTxKind::Recheck);
                if !response.is_ok() {
                    self.remove(&hash);
                    rechecked += 1;
                }
            }
        }

        debug!(
            height,
            evicted,
            recheck_dropped = rechecked,
            remaining = self.pool.len(),
            "mempool updated after commit"
        );
    }

    fn remove(&mut self, hash: &Hash) -> bool {
        let Some(entry) = self.pool.remove(hash) else {
            return false;
        };
        self.total_bytes -= entry.tx.len();
        if let Some(lane) = self.lanes.get_mut(&entry.lane) {
            lane.queue.retain(|h| h != hash);
        }
        true
    }
}

impl std::fmt::Debug for MempoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MempoolState")
            .field("txs", &self.pool.len())
            .field("bytes", &self.total_bytes)
            .field("lanes", &self.lanes.len())
            .finish()
    }
}
