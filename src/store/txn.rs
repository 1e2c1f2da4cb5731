use crate::error::AspectDbError;
use crate::record::AspectRecord;
use crate::store::state::{PairKey, RecordKey, RecordOp, StoreState};
use crate::store::{RecordStore, RollbackResult};
use crate::urn::Urn;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Isolation level of one transaction scope.
///
/// `RepeatableRead` pins reads of untouched pairs to the state observed at
/// begin. `ReadCommitted` reads whatever is committed at call time. Pairs this
/// scope has locked are always read live: the lock freezes them for everyone
/// else, and the scope must see its own writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Isolation {
    ReadCommitted,
    #[default]
    RepeatableRead,
}

/// An independent unit of work against the store.
///
/// Scopes nest freely because each one is fully self-contained: its own id,
/// its own write buffer, its own locks. Committing or rolling back an inner
/// scope never touches an enclosing one. Two scopes contending for the same
/// pair resolve by lock timeout, including an inner scope waiting on its own
/// outer scope.
pub struct TransactionScope<'a> {
    store: &'a RecordStore,
    id: u64,
    isolation: Isolation,
    snapshot: StoreState,
    pending: Vec<RecordOp>,
    written_rows: HashMap<RecordKey, Option<AspectRecord>>,
    written_pairs: HashMap<PairKey, Option<u64>>,
    locked: Vec<PairKey>,
    finished: bool,
}

impl<'a> TransactionScope<'a> {
    pub(crate) fn new(store: &'a RecordStore, id: u64, isolation: Isolation) -> Self {
        Self {
            store,
            id,
            isolation,
            snapshot: store.state_snapshot(),
            pending: Vec::new(),
            written_rows: HashMap::new(),
            written_pairs: HashMap::new(),
            locked: Vec::new(),
            finished: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn isolation(&self) -> Isolation {
        self.isolation
    }

    pub fn is_read_only(&self) -> bool {
        self.pending.is_empty()
    }

    fn ensure_open(&self) -> Result<(), AspectDbError> {
        if self.finished {
            return Err(AspectDbError::TransactionClosed);
        }
        Ok(())
    }

    fn lock_pair(&mut self, pair: &PairKey) -> Result<(), AspectDbError> {
        if self.locked.contains(pair) {
            return Ok(());
        }
        if self
            .store
            .locks()
            .acquire(self.id, pair, self.store.lock_timeout())?
        {
            self.locked.push(pair.clone());
        }
        Ok(())
    }

    fn push_op(&mut self, op: RecordOp) {
        match &op {
            RecordOp::UpsertRow { key, record } => {
                self.written_rows.insert(key.clone(), Some(record.clone()));
            }
            RecordOp::RemoveRow { key } => {
                self.written_rows.insert(key.clone(), None);
            }
            RecordOp::SetPairVersion { pair, version } => {
                self.written_pairs.insert(pair.clone(), Some(*version));
            }
            RecordOp::RemovePair { pair } => {
                self.written_pairs.insert(pair.clone(), None);
            }
        }
        self.pending.push(op);
    }

    fn base_pair_version(&self, pair: &PairKey) -> Option<u64> {
        if self.locked.contains(pair) {
            return self.store.with_state(|s| s.pair_version(pair));
        }
        match self.isolation {
            Isolation::RepeatableRead => self.snapshot.pair_version(pair),
            Isolation::ReadCommitted => self.store.with_state(|s| s.pair_version(pair)),
        }
    }

    fn base_row(&self, key: &RecordKey) -> Option<AspectRecord> {
        if self.locked.contains(&key.pair()) {
            return self.store.with_state(|s| s.row(key).cloned());
        }
        match self.isolation {
            Isolation::RepeatableRead => self.snapshot.row(key).cloned(),
            Isolation::ReadCommitted => self.store.with_state(|s| s.row(key).cloned()),
        }
    }

    /// Write counter of the pair as this scope sees it, own writes included.
    pub fn pair_version(&self, pair: &PairKey) -> Option<u64> {
        if let Some(version) = self.written_pairs.get(pair) {
            return *version;
        }
        self.base_pair_version(pair)
    }

    pub fn row(&self, key: &RecordKey) -> Option<AspectRecord> {
        if let Some(row) = self.written_rows.get(key) {
            return row.clone();
        }
        self.base_row(key)
    }

    /// Latest value and write counter of the pair, or `None` if never written.
    pub fn read_latest(&self, pair: &PairKey) -> Option<(u64, AspectRecord)> {
        let version = self.pair_version(pair)?;
        let row = self.row(&RecordKey::new(pair, 0))?;
        Some((version, row))
    }

    pub fn read_version(&self, pair: &PairKey, version: u64) -> Option<AspectRecord> {
        self.row(&RecordKey::new(pair, version))
    }

    /// Locks the pair, then reads its latest. Once this returns, no other
    /// scope can change the pair until this scope commits or rolls back, so
    /// the value read here is the value a subsequent write supersedes.
    pub fn locked_latest(
        &mut self,
        pair: &PairKey,
    ) -> Result<Option<(u64, AspectRecord)>, AspectDbError> {
        self.ensure_open()?;
        self.lock_pair(pair)?;
        Ok(self.read_latest(pair))
    }

    /// Supersedes the pair's latest value.
    ///
    /// The outgoing slot-0 row, if any, moves to the next counter slot where
    /// it keeps that number forever; the new record takes slot 0. Returns the
    /// committed write counter: 0 when this write created the pair, otherwise
    /// the slot the superseded value now occupies.
    pub fn write_and_renumber(
        &mut self,
        pair: &PairKey,
        record: AspectRecord,
    ) -> Result<u64, AspectDbError> {
        self.ensure_open()?;
        self.lock_pair(pair)?;
        match self.pair_version(pair) {
            None => {
                self.push_op(RecordOp::UpsertRow {
                    key: RecordKey::new(pair, 0),
                    record,
                });
                self.push_op(RecordOp::SetPairVersion {
                    pair: pair.clone(),
                    version: 0,
                });
                Ok(0)
            }
            Some(current) => {
                let outgoing = self.row(&RecordKey::new(pair, 0)).ok_or_else(|| {
                    AspectDbError::Corruption {
                        message: format!(
                            "{} '{}' has a write counter but no latest row",
                            pair.urn, pair.aspect_name
                        ),
                    }
                })?;
                let next = current + 1;
                self.push_op(RecordOp::UpsertRow {
                    key: RecordKey::new(pair, next),
                    record: outgoing,
                });
                self.push_op(RecordOp::UpsertRow {
                    key: RecordKey::new(pair, 0),
                    record,
                });
                self.push_op(RecordOp::SetPairVersion {
                    pair: pair.clone(),
                    version: next,
                });
                Ok(next)
            }
        }
    }

    /// Removes one historical row. Slot 0 is not removable here; entity
    /// deletion is the only path that drops a latest value.
    pub fn remove_version(&mut self, pair: &PairKey, version: u64) -> Result<bool, AspectDbError> {
        self.ensure_open()?;
        if version == 0 {
            return Err(AspectDbError::Validation(
                "version 0 cannot be removed, delete the entity instead".into(),
            ));
        }
        self.lock_pair(pair)?;
        let key = RecordKey::new(pair, version);
        if self.row(&key).is_none() {
            return Ok(false);
        }
        self.push_op(RecordOp::RemoveRow { key });
        Ok(true)
    }

    /// Locks the pair and returns every surviving version ascending, slot 0
    /// included, own writes folded in.
    pub fn versions_locked(
        &mut self,
        pair: &PairKey,
    ) -> Result<Vec<(u64, AspectRecord)>, AspectDbError> {
        self.ensure_open()?;
        self.lock_pair(pair)?;
        let mut merged: BTreeMap<u64, AspectRecord> = self
            .store
            .with_state(|s| s.versions_of(pair))
            .into_iter()
            .collect();
        for (key, row) in &self.written_rows {
            if key.urn == pair.urn && key.aspect_name == pair.aspect_name {
                match row {
                    Some(record) => {
                        merged.insert(key.version, record.clone());
                    }
                    None => {
                        merged.remove(&key.version);
                    }
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    /// Removes every aspect row of the entity and its write counters.
    ///
    /// Re-ingesting the entity afterwards starts a fresh history at counter 0.
    /// Pairs are locked before deletion; the scan repeats until no unlocked
    /// pair remains so a writer that committed between scan and lock is still
    /// covered.
    pub fn delete_entity(&mut self, urn: &Urn) -> Result<RollbackResult, AspectDbError> {
        self.ensure_open()?;
        loop {
            let pairs = self.store.with_state(|s| s.pairs_of_entity(urn));
            let missing: Vec<PairKey> = pairs
                .into_iter()
                .filter(|pair| !self.locked.contains(pair))
                .collect();
            if missing.is_empty() {
                break;
            }
            for pair in &missing {
                self.lock_pair(pair)?;
            }
        }

        let targets: Vec<PairKey> = self
            .locked
            .iter()
            .filter(|pair| pair.urn == *urn)
            .cloned()
            .collect();

        let mut result = RollbackResult::default();
        for pair in targets {
            if self.pair_version(&pair).is_none() {
                continue;
            }
            let versions = self.versions_locked(&pair)?;
            for (version, _) in &versions {
                self.push_op(RecordOp::RemoveRow {
                    key: RecordKey::new(&pair, *version),
                });
                result.rows_removed += 1;
            }
            self.push_op(RecordOp::RemovePair { pair: pair.clone() });
            result.aspects_removed += 1;
        }
        result.entity_removed = result.aspects_removed > 0;
        Ok(result)
    }

    /// Durably commits the buffered writes and releases all pair locks.
    /// Returns the commit sequence number; a scope with no writes commits as
    /// a no-op at the store's current sequence.
    pub fn commit(mut self) -> Result<u64, AspectDbError> {
        self.ensure_open()?;
        let ops = std::mem::take(&mut self.pending);
        let outcome = if ops.is_empty() {
            Ok(self.store.last_commit_seq())
        } else {
            self.store.commit_ops(&ops)
        };
        self.finish();
        outcome
    }

    /// Discards the buffered writes and releases all pair locks.
    pub fn rollback(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.pending.clear();
        let locked = std::mem::take(&mut self.locked);
        self.store.locks().release_all(self.id, &locked);
    }
}

impl std::fmt::Debug for TransactionScope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionScope")
            .field("id", &self.id)
            .field("isolation", &self.isolation)
            .field("pending_ops", &self.pending.len())
            .field("locked_pairs", &self.locked.len())
            .field("finished", &self.finished)
            .finish()
    }
}

impl Drop for TransactionScope<'_> {
    fn drop(&mut self) {
        if !self.finished {
            debug!(txn = self.id, "scope dropped without commit, rolling back");
            self.finish();
        }
    }
}
