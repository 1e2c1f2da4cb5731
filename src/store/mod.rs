//! Versioned record storage.
//!
//! State lives in persistent maps guarded by one reader-writer lock, so a
//! commit swaps in all of its changes at once and readers never observe a
//! half-applied transaction. Durability comes from an append-only commit
//! journal with periodic whole-state checkpoints; recovery replays the newest
//! checkpoint plus the journal suffix.

pub mod journal;
mod locks;
pub mod state;
mod txn;

pub use locks::PairLockTable;
pub use txn::{Isolation, TransactionScope};

use crate::config::AspectDbConfig;
use crate::error::AspectDbError;
use crate::record::VersionedAspect;
use crate::store::state::{PairKey, RecordKey, RecordOp, StoreState};
use crate::urn::Urn;
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{info, warn};

/// Outcome of an entity deletion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollbackResult {
    pub entity_removed: bool,
    pub aspects_removed: usize,
    pub rows_removed: usize,
}

struct JournalState {
    writer: journal::JournalWriter,
    last_seq: u64,
    commits_since_checkpoint: u64,
}

/// The record store: in-memory versioned state plus its commit journal.
///
/// All mutation flows through [`TransactionScope`]s handed out by
/// [`RecordStore::begin_transaction`]. Scopes are independent of each other,
/// so retention can run its own transaction while an ingestion batch holds
/// another, as long as they touch different pairs.
pub struct RecordStore {
    state: RwLock<StoreState>,
    journal: Mutex<JournalState>,
    locks: PairLockTable,
    next_txn_id: AtomicU64,
    config: AspectDbConfig,
    dir: PathBuf,
}

impl RecordStore {
    pub fn open(dir: &Path, config: AspectDbConfig) -> Result<Self, AspectDbError> {
        config.validate()?;
        let recovered = journal::open_dir(dir, config.recovery_mode, config.durability_mode)?;
        info!(
            path = %dir.display(),
            last_seq = recovered.last_seq,
            replayed_commits = recovered.replayed_commits,
            checkpoint_seq = recovered.checkpoint_seq.unwrap_or(0),
            pairs = recovered.state.pair_count(),
            rows = recovered.state.row_count(),
            durability_mode = ?config.durability_mode,
            recovery_mode = ?config.recovery_mode,
            "record store opened"
        );
        Ok(Self {
            state: RwLock::new(recovered.state),
            journal: Mutex::new(JournalState {
                writer: recovered.writer,
                last_seq: recovered.last_seq,
                commits_since_checkpoint: 0,
            }),
            locks: PairLockTable::new(),
            next_txn_id: AtomicU64::new(1),
            config,
            dir: dir.to_path_buf(),
        })
    }

    pub fn begin_transaction(&self, isolation: Isolation) -> TransactionScope<'_> {
        let id = self.next_txn_id.fetch_add(1, Ordering::Relaxed);
        TransactionScope::new(self, id, isolation)
    }

    pub fn config(&self) -> &AspectDbConfig {
        &self.config
    }

    pub(crate) fn locks(&self) -> &PairLockTable {
        &self.locks
    }

    pub(crate) fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.config.pair_lock_timeout_ms)
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&StoreState) -> R) -> R {
        f(&self.state.read())
    }

    pub(crate) fn state_snapshot(&self) -> StoreState {
        self.state.read().clone()
    }

    pub fn last_commit_seq(&self) -> u64 {
        self.journal.lock().last_seq
    }

    /// Journals and applies one transaction's ops as a single commit.
    ///
    /// The journal mutex serializes commits and assigns the sequence number;
    /// the state write lock makes the whole op list visible atomically. The
    /// caller still holds its pair locks, so nothing else can write the same
    /// pairs between journaling and applying.
    pub(crate) fn commit_ops(&self, ops: &[RecordOp]) -> Result<u64, AspectDbError> {
        let mut journal = self.journal.lock();
        let seq = journal.last_seq + 1;
        journal.writer.append_commit(seq, ops)?;
        {
            let mut state = self.state.write();
            state.apply_all(ops);
        }
        journal.last_seq = seq;
        journal.commits_since_checkpoint += 1;

        let due = journal.commits_since_checkpoint >= self.config.checkpoint_every_commits
            || journal.writer.bytes_written() >= self.config.max_journal_bytes;
        if due {
            // The commit itself is already durable; a failed checkpoint only
            // means recovery replays a longer journal.
            if let Err(e) = self.checkpoint_locked(&mut journal) {
                warn!(error = %e, "checkpoint failed, staying on current journal");
            }
        }
        Ok(seq)
    }

    fn checkpoint_locked(&self, journal: &mut JournalState) -> Result<(), AspectDbError> {
        // The active journal holds no commits, so the rotation already
        // happened at this sequence; rotating again would collide with it.
        if journal.writer.base_seq() == journal.last_seq {
            journal.commits_since_checkpoint = 0;
            return Ok(());
        }
        let snapshot = self.state.read().clone();
        journal::write_checkpoint(&self.dir, journal.last_seq, &snapshot)?;
        journal.writer =
            journal::JournalWriter::create(&self.dir, journal.last_seq, self.config.durability_mode)?;
        journal.commits_since_checkpoint = 0;
        journal::prune_older(&self.dir, journal.last_seq)?;
        info!(seq = journal.last_seq, "checkpoint written");
        Ok(())
    }

    /// Forces a checkpoint now, rotating the journal.
    pub fn checkpoint(&self) -> Result<(), AspectDbError> {
        let mut journal = self.journal.lock();
        self.checkpoint_locked(&mut journal)
    }

    /// Latest value of the pair as stored, version 0.
    pub fn get_latest(&self, pair: &PairKey) -> Option<VersionedAspect> {
        let state = self.state.read();
        let record = state.latest_row(pair)?.clone();
        Some(VersionedAspect {
            urn: pair.urn.clone(),
            aspect_name: pair.aspect_name.clone(),
            version: 0,
            record,
        })
    }

    /// A specific stored row; version 0 is the latest, positive versions are
    /// historical slots (absent if trimmed or never assigned).
    pub fn get_version(&self, pair: &PairKey, version: u64) -> Option<VersionedAspect> {
        let state = self.state.read();
        let record = state.row(&RecordKey::new(pair, version))?.clone();
        Some(VersionedAspect {
            urn: pair.urn.clone(),
            aspect_name: pair.aspect_name.clone(),
            version,
            record,
        })
    }

    /// The pair's write counter: 0 after the first write, incremented by each
    /// supersession, `None` if the pair was never written (or was deleted).
    pub fn current_version(&self, pair: &PairKey) -> Option<u64> {
        self.state.read().pair_version(pair)
    }

    pub fn entity_exists(&self, urn: &Urn) -> bool {
        self.state.read().entity_exists(urn)
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.dir
    }
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore")
            .field("dir", &self.dir)
            .field("last_seq", &self.last_commit_seq())
            .finish()
    }
}
