//! Retention trimming of historical aspect versions.
//!
//! Policies bound how many superseded rows a pair keeps, by count and by age.
//! Slot 0 is never touched. Each pair is trimmed in its own transaction, so a
//! trim that races an ingestion batch on the same pair serializes through the
//! pair lock instead of blocking unrelated work. Trim failures are logged and
//! left for the next cycle.

use crate::error::AspectDbError;
use crate::record::epoch_millis;
use crate::store::state::PairKey;
use crate::store::{Isolation, RecordStore};
use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Keep-window for one aspect's historical versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Keep at most this many historical rows, newest first. Slot 0 does not
    /// count against the window.
    pub max_versions_kept: Option<usize>,
    /// Drop historical rows whose audit timestamp is older than this.
    pub max_age_ms: Option<u64>,
}

impl RetentionPolicy {
    pub fn keep_versions(count: usize) -> Self {
        Self {
            max_versions_kept: Some(count),
            max_age_ms: None,
        }
    }

    pub fn keep_newer_than_ms(max_age_ms: u64) -> Self {
        Self {
            max_versions_kept: None,
            max_age_ms: Some(max_age_ms),
        }
    }

    pub fn and_max_age_ms(mut self, max_age_ms: u64) -> Self {
        self.max_age_ms = Some(max_age_ms);
        self
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_versions_kept.is_none() && self.max_age_ms.is_none()
    }
}

/// Per-aspect retention policies with an optional store-wide default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub default_policy: Option<RetentionPolicy>,
    pub by_aspect: BTreeMap<String, RetentionPolicy>,
}

impl RetentionConfig {
    pub fn with_default(mut self, policy: RetentionPolicy) -> Self {
        self.default_policy = Some(policy);
        self
    }

    pub fn with_aspect_policy(mut self, aspect_name: impl Into<String>, policy: RetentionPolicy) -> Self {
        self.by_aspect.insert(aspect_name.into(), policy);
        self
    }

    /// Policy for one aspect name: the aspect-specific entry wins over the
    /// default; `None` means unlimited history.
    pub fn policy_for(&self, aspect_name: &str) -> Option<RetentionPolicy> {
        self.by_aspect
            .get(aspect_name)
            .copied()
            .or(self.default_policy)
    }

    pub fn is_empty(&self) -> bool {
        self.default_policy.is_none() && self.by_aspect.is_empty()
    }
}

/// Summary of one sweep over many pairs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionSweep {
    pub pairs_examined: usize,
    pub rows_removed: usize,
    pub failures: usize,
}

/// Applies retention policies against one store.
#[derive(Clone)]
pub struct RetentionTrimmer {
    store: Arc<RecordStore>,
}

impl RetentionTrimmer {
    pub fn new(store: Arc<RecordStore>) -> Self {
        Self { store }
    }

    /// Trims one pair under its configured policy, in its own transaction.
    /// Returns the number of historical rows removed.
    pub fn apply_retention(&self, pair: &PairKey) -> Result<usize, AspectDbError> {
        self.trim_pair(pair).map_err(|e| AspectDbError::Retention {
            entity_id: pair.urn.to_string(),
            aspect_name: pair.aspect_name.clone(),
            message: e.to_string(),
        })
    }

    fn trim_pair(&self, pair: &PairKey) -> Result<usize, AspectDbError> {
        let Some(policy) = self.store.config().retention.policy_for(&pair.aspect_name) else {
            return Ok(0);
        };
        if policy.is_unbounded() {
            return Ok(0);
        }

        let mut txn = self.store.begin_transaction(Isolation::RepeatableRead);
        let historical: Vec<(u64, u64)> = txn
            .versions_locked(pair)?
            .into_iter()
            .filter(|(version, _)| *version != 0)
            .map(|(version, record)| (version, record.audit.time_ms))
            .collect();

        let mut doomed: Vec<u64> = Vec::new();
        let mut kept = historical;
        if let Some(max_kept) = policy.max_versions_kept {
            if kept.len() > max_kept {
                let cut = kept.len() - max_kept;
                doomed.extend(kept.drain(..cut).map(|(version, _)| version));
            }
        }
        if let Some(max_age_ms) = policy.max_age_ms {
            let cutoff = epoch_millis().saturating_sub(max_age_ms);
            doomed.extend(
                kept.iter()
                    .filter(|(_, time_ms)| *time_ms < cutoff)
                    .map(|(version, _)| *version),
            );
        }

        if doomed.is_empty() {
            txn.rollback();
            return Ok(0);
        }
        for version in &doomed {
            txn.remove_version(pair, *version)?;
        }
        txn.commit()?;
        debug!(
            urn = %pair.urn,
            aspect = %pair.aspect_name,
            removed = doomed.len(),
            "retention trimmed pair"
        );
        Ok(doomed.len())
    }

    /// Sweeps every known pair. Individual failures are logged and counted,
    /// never aborting the sweep.
    pub fn apply_to_all(&self) -> RetentionSweep {
        let pairs = self.store.with_state(|s| s.all_pairs());
        let mut sweep = RetentionSweep::default();
        for pair in pairs {
            sweep.pairs_examined += 1;
            match self.apply_retention(&pair) {
                Ok(removed) => sweep.rows_removed += removed,
                Err(e) => {
                    sweep.failures += 1;
                    warn!(
                        urn = %pair.urn,
                        aspect = %pair.aspect_name,
                        error = %e,
                        "retention trim failed, will retry on next sweep"
                    );
                }
            }
        }
        sweep
    }
}

enum RetentionOp {
    Trim(PairKey),
    Shutdown,
}

/// Background retention thread.
///
/// Ingestion enqueues touched pairs after commit; the worker trims them off
/// the hot path. Dropping the handle shuts the thread down after it drains
/// the queue.
pub struct RetentionWorker {
    tx: Sender<RetentionOp>,
    handle: Option<JoinHandle<()>>,
}

impl RetentionWorker {
    pub fn spawn(store: Arc<RecordStore>) -> Result<Self, AspectDbError> {
        let (tx, rx) = bounded(store.config().retention_queue_capacity);
        let trimmer = RetentionTrimmer::new(store);
        let handle = std::thread::Builder::new()
            .name("aspectdb-retention".into())
            .spawn(move || run_retention_loop(trimmer, rx))?;
        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    /// Queues one pair for trimming without blocking the caller.
    pub fn try_enqueue(&self, pair: PairKey) -> Result<(), AspectDbError> {
        match self.tx.try_send(RetentionOp::Trim(pair)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(AspectDbError::QueueFull),
            Err(TrySendError::Disconnected(_)) => Ok(()),
        }
    }

    /// Queues one pair for trimming. A full queue drops the request with a
    /// warning; the pair stays eligible for the next sweep.
    pub fn enqueue(&self, pair: PairKey) {
        if let Err(e) = self.try_enqueue(pair.clone()) {
            warn!(
                urn = %pair.urn,
                aspect = %pair.aspect_name,
                error = %e,
                "retention queue full, dropping trim request"
            );
        }
    }
}

impl Drop for RetentionWorker {
    fn drop(&mut self) {
        let _ = self.tx.send(RetentionOp::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_retention_loop(trimmer: RetentionTrimmer, rx: Receiver<RetentionOp>) {
    for op in rx {
        match op {
            RetentionOp::Trim(pair) => {
                if let Err(e) = trimmer.apply_retention(&pair) {
                    warn!(
                        urn = %pair.urn,
                        aspect = %pair.aspect_name,
                        error = %e,
                        "retention trim failed, will retry on next cycle"
                    );
                }
            }
            RetentionOp::Shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{RetentionConfig, RetentionPolicy, RetentionTrimmer, RetentionWorker};
    use crate::config::AspectDbConfig;
    use crate::record::{AspectRecord, AuditStamp, SystemMetadata};
    use crate::store::state::PairKey;
    use crate::store::{Isolation, RecordStore};
    use crate::urn::Urn;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn record_at(marker: u64, time_ms: u64) -> AspectRecord {
        AspectRecord::new(
            json!({"marker": marker}),
            SystemMetadata::for_run("run", time_ms),
            AuditStamp::new("urn:corpuser:tester", time_ms),
        )
    }

    fn store_with(retention: RetentionConfig) -> (tempfile::TempDir, Arc<RecordStore>) {
        let dir = tempdir().expect("tempdir");
        let config = AspectDbConfig::default().with_retention(retention);
        let store = Arc::new(RecordStore::open(dir.path(), config).expect("open"));
        (dir, store)
    }

    fn seed_versions(store: &RecordStore, pair: &PairKey, count: u64) {
        let mut txn = store.begin_transaction(Isolation::RepeatableRead);
        for i in 0..count {
            txn.write_and_renumber(pair, record_at(i, i)).expect("write");
        }
        txn.commit().expect("commit");
    }

    #[test]
    fn aspect_policy_wins_over_default() {
        let config = RetentionConfig::default()
            .with_default(RetentionPolicy::keep_versions(10))
            .with_aspect_policy("ownership", RetentionPolicy::keep_versions(1));
        assert_eq!(
            config.policy_for("ownership").expect("policy").max_versions_kept,
            Some(1)
        );
        assert_eq!(
            config.policy_for("schema").expect("default").max_versions_kept,
            Some(10)
        );
        assert!(RetentionConfig::default().policy_for("anything").is_none());
    }

    #[test]
    fn count_window_keeps_newest_history_and_slot_zero() {
        let (_dir, store) = store_with(
            RetentionConfig::default()
                .with_aspect_policy("ownership", RetentionPolicy::keep_versions(2)),
        );
        let pair = PairKey::new(Urn::parse("dataset:events").expect("urn"), "ownership");
        seed_versions(&store, &pair, 6);

        let trimmer = RetentionTrimmer::new(Arc::clone(&store));
        let removed = trimmer.apply_retention(&pair).expect("trim");
        assert_eq!(removed, 3);

        let slots: Vec<u64> = store
            .with_state(|s| s.versions_of(&pair))
            .into_iter()
            .map(|(v, _)| v)
            .collect();
        assert_eq!(slots, vec![0, 4, 5]);
        // The write counter is untouched, so new writes keep fresh numbers.
        assert_eq!(store.current_version(&pair), Some(5));
    }

    #[test]
    fn age_window_drops_only_stale_history() {
        let (_dir, store) = store_with(
            RetentionConfig::default()
                .with_aspect_policy("ownership", RetentionPolicy::keep_newer_than_ms(60_000)),
        );
        let pair = PairKey::new(Urn::parse("dataset:events").expect("urn"), "ownership");

        let now = crate::record::epoch_millis();
        let mut txn = store.begin_transaction(Isolation::RepeatableRead);
        txn.write_and_renumber(&pair, record_at(1, now.saturating_sub(3_600_000)))
            .expect("old");
        txn.write_and_renumber(&pair, record_at(2, now.saturating_sub(3_000_000)))
            .expect("old");
        txn.write_and_renumber(&pair, record_at(3, now)).expect("fresh");
        txn.commit().expect("commit");

        let trimmer = RetentionTrimmer::new(Arc::clone(&store));
        // Slot 1 (hour old) and slot 2 (50 min old) are stale, slot 0 stays.
        let removed = trimmer.apply_retention(&pair).expect("trim");
        assert_eq!(removed, 2);

        let slots: Vec<u64> = store
            .with_state(|s| s.versions_of(&pair))
            .into_iter()
            .map(|(v, _)| v)
            .collect();
        assert_eq!(slots, vec![0]);
    }

    #[test]
    fn unconfigured_aspect_is_never_trimmed() {
        let (_dir, store) = store_with(RetentionConfig::default());
        let pair = PairKey::new(Urn::parse("dataset:events").expect("urn"), "ownership");
        seed_versions(&store, &pair, 5);

        let trimmer = RetentionTrimmer::new(Arc::clone(&store));
        assert_eq!(trimmer.apply_retention(&pair).expect("trim"), 0);
        assert_eq!(store.with_state(|s| s.versions_of(&pair)).len(), 5);
    }

    #[test]
    fn sweep_covers_every_pair() {
        let (_dir, store) = store_with(
            RetentionConfig::default().with_default(RetentionPolicy::keep_versions(0)),
        );
        let a = PairKey::new(Urn::parse("dataset:a").expect("urn"), "ownership");
        let b = PairKey::new(Urn::parse("dataset:b").expect("urn"), "ownership");
        seed_versions(&store, &a, 3);
        seed_versions(&store, &b, 2);

        let trimmer = RetentionTrimmer::new(Arc::clone(&store));
        let sweep = trimmer.apply_to_all();
        assert_eq!(sweep.pairs_examined, 2);
        assert_eq!(sweep.rows_removed, 3);
        assert_eq!(sweep.failures, 0);
        assert_eq!(store.with_state(|s| s.versions_of(&a)).len(), 1);
        assert_eq!(store.with_state(|s| s.versions_of(&b)).len(), 1);
    }

    #[test]
    fn full_queue_rejects_new_trim_requests() {
        let dir = tempdir().expect("tempdir");
        let config = AspectDbConfig {
            retention_queue_capacity: 1,
            ..AspectDbConfig::default()
        }
        .with_retention(
            RetentionConfig::default()
                .with_aspect_policy("ownership", RetentionPolicy::keep_versions(1)),
        );
        let store = Arc::new(RecordStore::open(dir.path(), config).expect("open"));
        let pair = PairKey::new(Urn::parse("dataset:events").expect("urn"), "ownership");
        seed_versions(&store, &pair, 3);

        // Holding the pair lock parks the worker inside its first trim, so
        // the one-slot queue backs up after at most two accepted requests.
        let mut guard = store.begin_transaction(Isolation::RepeatableRead);
        let _ = guard.locked_latest(&pair).expect("lock");

        let worker = RetentionWorker::spawn(Arc::clone(&store)).expect("spawn");
        let err = loop {
            match worker.try_enqueue(pair.clone()) {
                Ok(()) => continue,
                Err(e) => break e,
            }
        };
        assert_eq!(err.code_str(), "queue_full");
        assert!(err.is_retryable());

        // Release the lock so the queued trims and the shutdown drain.
        guard.rollback();
        drop(worker);
    }

    #[test]
    fn worker_drains_queue_before_shutdown() {
        let (_dir, store) = store_with(
            RetentionConfig::default()
                .with_aspect_policy("ownership", RetentionPolicy::keep_versions(1)),
        );
        let pair = PairKey::new(Urn::parse("dataset:events").expect("urn"), "ownership");
        seed_versions(&store, &pair, 4);

        let worker = RetentionWorker::spawn(Arc::clone(&store)).expect("spawn");
        worker.enqueue(pair.clone());
        // Drop joins the thread after the queued trim runs.
        drop(worker);

        let slots: Vec<u64> = store
            .with_state(|s| s.versions_of(&pair))
            .into_iter()
            .map(|(v, _)| v)
            .collect();
        assert_eq!(slots, vec![0, 3]);
    }
}
