//! The block executor: calls into the application with a durable cursor.
//!
//! `finalize_block` and `commit` must each run exactly once per height.
//! The executor writes a cursor around every call so that after a crash
//! the handshake can tell exactly which call last completed, then replays
//! stored blocks through the application until it catches up with the
//! block store. An application hash that diverges during replay is fatal:
//! the node halts rather than forks.

use crate::application::Application;
use crate::types::{CommitResponse, FinalizeBlockRequest, FinalizeBlockResponse};
use crate::SharedApplication;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutorError {
    #[error(
        "application hash mismatch at height {height}: engine has {engine}, application has {app}"
    )]
    AppHashMismatch {
        height: u64,
        engine: String,
        app: String,
    },

    #[error("application is at height {app}, ahead of the block store at {store}")]
    AppAheadOfStore { app: u64, store: u64 },

    #[error("cursor regressed: stored {stored:?}, executing height {executing}")]
    CursorRegression { stored: AbciCursor, executing: u64 },
}

/// Which application call last completed for a height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CursorPhase {
    Finalized,
    Committed,
}

/// The durable record of application-call progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbciCursor {
    pub height: u64,
    pub phase: CursorPhase,
}

/// Durable storage for the cursor. Writes must be synchronous: the cursor
/// is what makes a crash between `finalize_block` and `commit`
/// distinguishable from a crash before either.
pub trait CursorStore: Send {
    fn get(&self) -> Option<AbciCursor>;
    fn set(&mut self, cursor: AbciCursor);
}

/// In-memory cursor store for tests and simulation.
#[derive(Debug, Default)]
pub struct MemCursorStore {
    cursor: Option<AbciCursor>,
}

impl CursorStore for MemCursorStore {
    fn get(&self) -> Option<AbciCursor> {
        self.cursor
    }

    fn set(&mut self, cursor: AbciCursor) {
        self.cursor = Some(cursor);
    }
}

/// Serializes the per-height application calls and tracks the cursor.
pub struct BlockExecutor {
    app: SharedApplication,
    cursor: Box<dyn CursorStore>,
}

impl BlockExecutor {
    pub fn new(app: SharedApplication, cursor: Box<dyn CursorStore>) -> Self {
        BlockExecutor { app, cursor }
    }

    pub fn app(&self) -> &SharedApplication {
        &self.app
    }

    pub fn cursor(&self) -> Option<AbciCursor> {
        self.cursor.get()
    }

    /// Run `finalize_block` then `commit` for one decided block, cursoring
    /// each call. Returns the finalize response and the retain height.
    pub fn execute_block(
        &mut self,
        req: FinalizeBlockRequest,
    ) -> Result<(FinalizeBlockResponse, CommitResponse), ExecutorError> {
        let height = req.height;
        if let Some(stored) = self.cursor.get() {
            if stored.height >= height && stored.phase == CursorPhase::Committed {
                return Err(ExecutorError::CursorRegression {
                    stored,
                    executing: height,
                });
            }
        }

        let finalize = {
            let mut app = self.app.lock();
            app.finalize_block(req)
        };
        self.cursor.set(AbciCursor {
            height,
            phase: CursorPhase::Finalized,
        });

        let commit = {
            let mut app = self.app.lock();
            app.commit()
        };
        self.cursor.set(AbciCursor {
            height,
            phase: CursorPhase::Committed,
        });

        debug!(height, "block executed through application");
        Ok((finalize, commit))
    }

    /// Startup handshake: bring the application back in sync with the
    /// block store.
    ///
    /// `store_height` is the highest block the engine has durably stored;
    /// `blocks` must yield the finalize requests for every height in
    /// `(app_height, store_height]`, in order. `expected_app_hash` is the
    /// engine's recorded hash after `store_height`.
    pub fn replay_to(
        &mut self,
        store_height: u64,
        expected_app_hash: &[u8],
        blocks: impl Iterator<Item = FinalizeBlockRequest>,
    ) -> Result<u64, ExecutorError> {
        let app_height = {
            let app = self.app.lock();
            app.info().last_block_height
        };
        if app_height > store_height {
            return Err(ExecutorError::AppAheadOfStore {
                app: app_height,
                store: store_height,
            });
        }
        if let Some(cursor) = self.cursor.get() {
            debug!(?cursor, app_height, store_height, "handshake cursor");
        }

        let mut replayed = 0u64;
        for req in blocks {
            if req.height <= app_height {
                continue;
            }
            let height = req.height;
            info!(height, "replaying block through application");
            let mut app = self.app.lock();
            app.finalize_block(req);
            drop(app);
            self.cursor.set(AbciCursor {
                height,
                phase: CursorPhase::Finalized,
            });
            let mut app = self.app.lock();
            app.commit();
            drop(app);
            self.cursor.set(AbciCursor {
                height,
                phase: CursorPhase::Committed,
            });
            replayed += 1;
        }

        let info = self.app.lock().info();
        if info.last_block_height != store_height {
            warn!(
                app = info.last_block_height,
                store = store_height,
                "handshake left application behind the store"
            );
        }
        if store_height > 0 && info.last_block_app_hash != expected_app_hash {
            return Err(ExecutorError::AppHashMismatch {
                height: store_height,
                engine: hex::encode(expected_app_hash),
                app: hex::encode(&info.last_block_app_hash),
            });
        }
        Ok(replayed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvstore::{make_tx, KvStoreApp};
    use crate::share;
    use palisade_types::{Address, Hash, Time, Tx};

    fn finalize_request(height: u64, txs: Vec<Tx>) -> FinalizeBlockRequest {
        FinalizeBlockRequest {
            height,
            time: Time::from_millis(height),
            hash: Hash::sum(&height.to_le_bytes()),
            txs,
            decided_last_commit: None,
            misbehavior: Vec::new(),
            proposer_address: Address::from_bytes([0; 20]),
        }
    }

    #[test]
    fn execute_block_advances_cursor_through_both_phases() {
        let mut exec = BlockExecutor::new(
            share(KvStoreApp::new()),
            Box::new(MemCursorStore::default()),
        );
        let (finalize, commit) = exec
            .execute_block(finalize_request(1, vec![make_tx("a", "1")]))
            .unwrap();
        assert_eq!(finalize.tx_results.len(), 1);
        assert_eq!(commit.retain_height, 0);
        assert_eq!(
            exec.cursor(),
            Some(AbciCursor {
                height: 1,
                phase: CursorPhase::Committed
            })
        );
    }

    #[test]
    fn re_executing_a_committed_height_is_refused() {
        let mut exec = BlockExecutor::new(
            share(KvStoreApp::new()),
            Box::new(MemCursorStore::default()),
        );
        exec.execute_block(finalize_request(1, vec![])).unwrap();
        assert!(matches!(
            exec.execute_block(finalize_request(1, vec![])),
            Err(ExecutorError::CursorRegression { .. })
        ));
    }

    #[test]
    fn replay_brings_fresh_app_to_store_height() {
        // Build the authoritative history on one app instance.
        let reference = share(KvStoreApp::new());
        let mut ref_exec =
            BlockExecutor::new(reference.clone(), Box::new(MemCursorStore::default()));
        let history: Vec<FinalizeBlockRequest> = (1..=5u64)
            .map(|h| finalize_request(h, vec![make_tx(&format!("k{h}"), "v")]))
            .collect();
        for req in &history {
            ref_exec.execute_block(req.clone()).unwrap();
        }
        let expected_hash = reference.lock().info().last_block_app_hash;

        // A fresh app instance (crash wiped its memory) replays the same
        // blocks and lands on the same hash.
        let mut exec = BlockExecutor::new(
            share(KvStoreApp::new()),
            Box::new(MemCursorStore::default()),
        );
        let replayed = exec
            .replay_to(5, &expected_hash, history.into_iter())
            .unwrap();
        assert_eq!(replayed, 5);
        assert_eq!(exec.app().lock().info().last_block_height, 5);
    }

    #[test]
    fn replay_skips_heights_the_app_already_has() {
        let app = share(KvStoreApp::new());
        let history: Vec<FinalizeBlockRequest> = (1..=4u64)
            .map(|h| finalize_request(h, vec![make_tx(&format!("k{h}"), "v")]))
            .collect();

        // App already executed heights 1..=2.
        let mut exec = BlockExecutor::new(app.clone(), Box::new(MemCursorStore::default()));
        for req in &history[..2] {
            exec.execute_block(req.clone()).unwrap();
        }

        // Authoritative hash after height 4.
        let reference = share(KvStoreApp::new());
        let mut ref_exec =
            BlockExecutor::new(reference.clone(), Box::new(MemCursorStore::default()));
        for req in &history {
            ref_exec.execute_block(req.clone()).unwrap();
        }
        let expected_hash = reference.lock().info().last_block_app_hash;

        let replayed = exec
            .replay_to(4, &expected_hash, history.into_iter())
            .unwrap();
        assert_eq!(replayed, 2);
        assert_eq!(app.lock().info().last_block_height, 4);
    }

    #[test]
    fn replay_detects_app_hash_divergence() {
        let mut exec = BlockExecutor::new(
            share(KvStoreApp::new()),
            Box::new(MemCursorStore::default()),
        );
        let history = vec![finalize_request(1, vec![make_tx("k", "v")])];
        let wrong_hash = vec![0xde, 0xad];
        assert!(matches!(
            exec.replay_to(1, &wrong_hash, history.into_iter()),
            Err(ExecutorError::AppHashMismatch { height: 1, .. })
        ));
    }

    #[test]
    fn replay_rejects_app_ahead_of_store() {
        let app = share(KvStoreApp::new());
        let mut exec = BlockExecutor::new(app, Box::new(MemCursorStore::default()));
        for h in 1..=3u64 {
            exec.execute_block(finalize_request(h, vec![])).unwrap();
        }
        assert!(matches!(
            exec.replay_to(2, &[], std::iter::empty()),
            Err(ExecutorError::AppAheadOfStore { app: 3, store: 2 })
        ));
    }
}
