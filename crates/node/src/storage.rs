//! RocksDB storage.
//!
//! All operations are synchronous blocking I/O. Column families keep the
//! key spaces separate:
//!
//! - `blocks`: big-endian height → (block, commit)
//! - `evidence`: evidence hash → evidence
//! - `votes`: (height, round, type) → voted block id
//! - `default`: chain state, application-call cursor
//!
//! Writes that BFT safety depends on (own votes, the call cursor, chain
//! state) are issued with sync durability and panic on failure: a node
//! that cannot persist them must stop before it can equivocate or fork.

use palisade_abci::{AbciCursor, CursorPhase, CursorStore};
use palisade_consensus::ChainState;
use palisade_types::wire::{WireDecode, WireEncode};
use palisade_types::{Block, BlockId, Commit, Evidence, Hash, VoteType};
use rocksdb::{ColumnFamilyDescriptor, Options, WriteOptions, DB};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info};

const CF_BLOCKS: &str = "blocks";
const CF_EVIDENCE: &str = "evidence";
const CF_VOTES: &str = "votes";

const KEY_CHAIN_STATE: &[u8] = b"state:latest";
const KEY_ABCI_CURSOR: &[u8] = b"abci:cursor";

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("corrupt record under {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// The node's persistent store.
pub struct Store {
    db: Arc<DB>,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = vec![
            ColumnFamilyDescriptor::new("default", Options::default()),
            ColumnFamilyDescriptor::new(CF_BLOCKS, Options::default()),
            ColumnFamilyDescriptor::new(CF_EVIDENCE, Options::default()),
            ColumnFamilyDescriptor::new(CF_VOTES, Options::default()),
        ];
        let db = DB::open_cf_descriptors(&opts, path, cfs)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(Store { db: Arc::new(db) })
    }

    fn cf(&self, name: &str) -> &rocksdb::ColumnFamily {
        self.db
            .cf_handle(name)
            .expect("column families are created at open")
    }

    fn sync_writes() -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(true);
        opts
    }

    // ═══════════════════════════════════════════════════════════════════
    // Blocks
    // ═══════════════════════════════════════════════════════════════════

    /// Store a committed block with its commit.
    ///
    /// # Panics
    ///
    /// Panics if the write fails: the state machine treats the block as
    /// durable once this returns, so continuing without it would leave a
    /// gap in the chain on restart.
    pub fn put_block(&self, block: &Block, commit: &Commit) {
        let key = block.header.height.to_be_bytes();
        let mut value = Vec::new();
        block.encode_into(&mut value);
        commit.encode_into(&mut value);
        self.db
            .put_cf_opt(self.cf(CF_BLOCKS), key, value, &Self::sync_writes())
            .expect("block persistence failed - cannot maintain chain state");
        debug!(height = block.header.height, "block persisted");
    }

    pub fn block(&self, height: u64) -> Option<(Block, Commit)> {
        let key = height.to_be_bytes();
        let value = self.db.get_cf(self.cf(CF_BLOCKS), key).ok().flatten()?;
        let mut input = value.as_slice();
        let block = Block::decode_from(&mut input).ok()?;
        let commit = Commit::decode_from(&mut input).ok()?;
        Some((block, commit))
    }

    /// Lowest stored height, if any.
    pub fn base_height(&self) -> Option<u64> {
        let mut iter = self.db.iterator_cf(self.cf(CF_BLOCKS), rocksdb::IteratorMode::Start);
        let (key, _) = iter.next()?.ok()?;
        let bytes: [u8; 8] = key.as_ref().try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }

    /// Drop blocks below `retain_height`. Returns how many were removed.
    pub fn prune_blocks(&self, retain_height: u64) -> u64 {
        let mut batch = rocksdb::WriteBatch::default();
        let mut pruned = 0u64;
        let iter = self.db.iterator_cf(self.cf(CF_BLOCKS), rocksdb::IteratorMode::Start);
        for entry in iter.flatten() {
            let (key, _) = entry;
            let Ok(bytes) = <[u8; 8]>::try_from(key.as_ref()) else {
                continue;
            };
            if u64::from_be_bytes(bytes) < retain_height {
                batch.delete_cf(self.cf(CF_BLOCKS), key);
                pruned += 1;
            } else {
                break;
            }
        }
        if let Err(e) = self.db.write(batch) {
            error!(error = %e, "failed to prune blocks");
            return 0;
        }
        if pruned > 0 {
            info!(pruned, retain_height, "pruned block store");
        }
        pruned
    }

    // ═══════════════════════════════════════════════════════════════════
    // Chain state
    // ═══════════════════════════════════════════════════════════════════

    /// # Panics
    ///
    /// Panics on write failure; the chain state must match the block
    /// store or restart recovery is undefined.
    pub fn save_chain_state(&self, state: &ChainState) {
        self.db
            .put_opt(KEY_CHAIN_STATE, state.encode(), &Self::sync_writes())
            .expect("chain state persistence failed");
    }

    pub fn load_chain_state(&self) -> Result<Option<ChainState>, StoreError> {
        match self.db.get(KEY_CHAIN_STATE) {
            Ok(None) => Ok(None),
            Ok(Some(bytes)) => ChainState::decode(&bytes).map(Some).map_err(|e| {
                StoreError::Corrupt {
                    key: "state:latest".to_string(),
                    reason: e.to_string(),
                }
            }),
            Err(e) => Err(StoreError::Database(e.to_string())),
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // Own votes
    // ═══════════════════════════════════════════════════════════════════

    fn vote_key(height: u64, round: u32, vote_type: VoteType) -> [u8; 13] {
        let mut key = [0u8; 13];
        key[..8].copy_from_slice(&height.to_be_bytes());
        key[8..12].copy_from_slice(&round.to_be_bytes());
        key[12] = vote_type.as_u8();
        key
    }

    /// Record our own vote before it is broadcast.
    ///
    /// # Panics
    ///
    /// Panics if the write fails. If we cannot remember the vote, we must
    /// not send it: a crash would let us sign a conflicting vote later.
    pub fn put_own_vote(&self, height: u64, round: u32, vote_type: VoteType, block_id: Option<BlockId>) {
        let mut value = Vec::new();
        palisade_types::wire::write_option(&mut value, &block_id, |o, id| id.encode_into(o));
        self.db
            .put_cf_opt(
                self.cf(CF_VOTES),
                Self::vote_key(height, round, vote_type),
                value,
                &Self::sync_writes(),
            )
            .expect("vote persistence failed - cannot continue safely");
    }

    /// All recorded own votes, for restart recovery.
    pub fn load_own_votes(&self) -> HashMap<(u64, u32, VoteType), Option<BlockId>> {
        let iter = self.db.iterator_cf(self.cf(CF_VOTES), rocksdb::IteratorMode::Start);
        iter.flatten()
            .filter_map(|(key, value)| {
                if key.len() != 13 {
                    return None;
                }
                let height = u64::from_be_bytes(key[..8].try_into().ok()?);
                let round = u32::from_be_bytes(key[8..12].try_into().ok()?);
                let vote_type = VoteType::from_u8(key[12])?;
                let mut input = value.as_ref();
                let block_id =
                    palisade_types::wire::read_option(&mut input, BlockId::decode_from).ok()?;
                Some(((height, round, vote_type), block_id))
            })
            .collect()
    }

    /// Drop votes below `height`; they can no longer conflict.
    pub fn prune_own_votes(&self, height: u64) {
        let mut batch = rocksdb::WriteBatch::default();
        let iter = self.db.iterator_cf(self.cf(CF_VOTES), rocksdb::IteratorMode::Start);
        for (key, _) in iter.flatten() {
            if key.len() == 13 {
                if let Ok(bytes) = <[u8; 8]>::try_from(&key[..8]) {
                    if u64::from_be_bytes(bytes) < height {
                        batch.delete_cf(self.cf(CF_VOTES), key);
                    }
                }
            }
        }
        if let Err(e) = self.db.write(batch) {
            error!(error = %e, "failed to prune votes");
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // Evidence
    // ═══════════════════════════════════════════════════════════════════

    pub fn put_evidence(&self, evidence: &Evidence) {
        let hash = evidence.hash();
        if let Err(e) = self
            .db
            .put_cf(self.cf(CF_EVIDENCE), hash.as_bytes(), evidence.encode())
        {
            error!(error = %e, "failed to persist evidence");
        }
    }

    pub fn load_evidence(&self) -> Vec<Evidence> {
        let iter = self
            .db
            .iterator_cf(self.cf(CF_EVIDENCE), rocksdb::IteratorMode::Start);
        iter.flatten()
            .filter_map(|(_, value)| Evidence::decode(&value).ok())
            .collect()
    }

    pub fn delete_evidence(&self, hash: &Hash) {
        let _ = self.db.delete_cf(self.cf(CF_EVIDENCE), hash.as_bytes());
    }

    // ═══════════════════════════════════════════════════════════════════
    // Misc
    // ═══════════════════════════════════════════════════════════════════

    /// Flush WAL and memtables; part of clean shutdown.
    pub fn flush(&self) {
        if let Err(e) = self.db.flush() {
            error!(error = %e, "flush failed");
        }
    }

    pub(crate) fn db(&self) -> Arc<DB> {
        self.db.clone()
    }
}

/// RocksDB-backed application-call cursor.
pub struct RocksCursorStore {
    db: Arc<DB>,
}

impl RocksCursorStore {
    pub fn new(store: &Store) -> Self {
        RocksCursorStore { db: store.db() }
    }
}

impl CursorStore for RocksCursorStore {
    fn get(&self) -> Option<AbciCursor> {
        let value = self.db.get(KEY_ABCI_CURSOR).ok().flatten()?;
        if value.len() != 9 {
            return None;
        }
        let height = u64::from_be_bytes(value[..8].try_into().ok()?);
        let phase = match value[8] {
            0 => CursorPhase::Finalized,
            1 => CursorPhase::Committed,
            _ => return None,
        };
        Some(AbciCursor { height, phase })
    }

    fn set(&mut self, cursor: AbciCursor) {
        let mut value = Vec::with_capacity(9);
        value.extend_from_slice(&cursor.height.to_be_bytes());
        value.push(match cursor.phase {
            CursorPhase::Finalized => 0,
            CursorPhase::Committed => 1,
        });
        let mut opts = WriteOptions::default();
        opts.set_sync(true);
        self.db
            .put_opt(KEY_ABCI_CURSOR, value, &opts)
            .expect("cursor persistence failed - replay would be ambiguous");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_types::{Address, Hash, PartSetHeader, Time, Tx};
    use tempfile::TempDir;

    fn test_block(height: u64) -> (Block, Commit) {
        let txs = vec![Tx(format!("k{height}=v").into_bytes())];
        let header = palisade_types::Header {
            chain_id: "store-test".to_string(),
            height,
            time: Time::from_millis(height * 1000),
            last_block_id: None,
            last_commit_hash: Block::last_commit_hash(&None),
            data_hash: Block::data_hash(&txs),
            validators_hash: Hash::sum(b"vals"),
            next_validators_hash: Hash::sum(b"next"),
            consensus_hash: Hash::sum(b"params"),
            app_hash: vec![1, 2, 3],
            last_results_hash: Hash::sum(b"results"),
            evidence_hash: Block::evidence_hash(&[]),
            proposer_address: Address::from_bytes([7; 20]),
        };
        let block = Block {
            header,
            data: txs,
            evidence: vec![],
            last_commit: None,
        };
        let commit = Commit {
            height,
            round: 0,
            block_id: BlockId {
                hash: block.hash(),
                part_set_header: PartSetHeader {
                    total: 1,
                    hash: Hash::sum(b"parts"),
                },
            },
            signatures: vec![palisade_types::CommitSig::Absent],
        };
        (block, commit)
    }

    #[test]
    fn block_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();

        assert!(store.block(1).is_none());
        let (block, commit) = test_block(1);
        store.put_block(&block, &commit);

        let (loaded_block, loaded_commit) = store.block(1).unwrap();
        assert_eq!(loaded_block, block);
        assert_eq!(loaded_commit, commit);
    }

    #[test]
    fn prune_respects_retain_height() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        for h in 1..=10 {
            let (block, commit) = test_block(h);
            store.put_block(&block, &commit);
        }
        assert_eq!(store.base_height(), Some(1));

        let pruned = store.prune_blocks(6);
        assert_eq!(pruned, 5);
        assert_eq!(store.base_height(), Some(6));
        assert!(store.block(5).is_none());
        assert!(store.block(6).is_some());
    }

    #[test]
    fn own_votes_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let id = BlockId {
            hash: Hash::sum(b"voted"),
            part_set_header: PartSetHeader {
                total: 2,
                hash: Hash::sum(b"p"),
            },
        };
        {
            let store = Store::open(dir.path()).unwrap();
            store.put_own_vote(5, 0, VoteType::Prevote, Some(id));
            store.put_own_vote(5, 0, VoteType::Precommit, None);
            store.put_own_vote(6, 2, VoteType::Prevote, None);
        }
        {
            let store = Store::open(dir.path()).unwrap();
            let votes = store.load_own_votes();
            assert_eq!(votes.len(), 3);
            assert_eq!(votes[&(5, 0, VoteType::Prevote)], Some(id));
            assert_eq!(votes[&(5, 0, VoteType::Precommit)], None);

            store.prune_own_votes(6);
            assert_eq!(store.load_own_votes().len(), 1);
        }
    }

    #[test]
    fn cursor_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let mut cursor = RocksCursorStore::new(&store);
        assert!(CursorStore::get(&cursor).is_none());

        cursor.set(AbciCursor {
            height: 9,
            phase: CursorPhase::Finalized,
        });
        assert_eq!(
            CursorStore::get(&cursor),
            Some(AbciCursor {
                height: 9,
                phase: CursorPhase::Finalized
            })
        );

        cursor.set(AbciCursor {
            height: 9,
            phase: CursorPhase::Committed,
        });
        assert_eq!(
            CursorStore::get(&cursor).unwrap().phase,
            CursorPhase::Committed
        );
    }

    #[test]
    fn chain_state_none_on_fresh_db() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        assert!(store.load_chain_state().unwrap().is_none());
    }
}
