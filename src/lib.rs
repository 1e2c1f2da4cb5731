pub mod batch;
pub mod config;
pub mod error;
pub mod ingest;
pub mod listing;
pub mod publish;
pub mod record;
pub mod registry;
pub mod retention;
pub mod store;
pub mod urn;
pub mod validate;

use crate::batch::IngestBatch;
use crate::config::AspectDbConfig;
use crate::error::AspectDbError;
use crate::ingest::{IngestOptions, IngestResult, IngestionCoordinator};
use crate::listing::{ListedAspects, ListedUrns};
use crate::publish::ChangeEventPublisher;
use crate::record::{AuditStamp, VersionedAspect};
use crate::registry::EntityRegistry;
use crate::retention::{RetentionSweep, RetentionTrimmer, RetentionWorker};
use crate::store::state::PairKey;
use crate::store::{Isolation, RecordStore, RollbackResult, TransactionScope};
use crate::urn::Urn;
use crate::validate::BatchValidator;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Handle to one aspect store on disk. `Send + Sync`; share it across
/// threads behind an `Arc` or by reference.
pub struct AspectDb {
    store: Arc<RecordStore>,
    registry: Arc<dyn EntityRegistry>,
    publisher: Arc<dyn ChangeEventPublisher>,
    trimmer: RetentionTrimmer,
    /// Background trim thread, present when enabled in config. Joined on drop.
    retention_worker: Option<RetentionWorker>,
}

impl std::fmt::Debug for AspectDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AspectDb").finish_non_exhaustive()
    }
}

impl AspectDb {
    /// Opens (or creates) a store at `dir`, recovering any previous state
    /// from its checkpoint and journal files.
    pub fn open(
        config: AspectDbConfig,
        dir: &Path,
        registry: Arc<dyn EntityRegistry>,
        publisher: Arc<dyn ChangeEventPublisher>,
    ) -> Result<Self, AspectDbError> {
        let store = Arc::new(RecordStore::open(dir, config)?);
        let retention_worker = if store.config().retention_worker_enabled
            && !store.config().retention.is_empty()
        {
            Some(RetentionWorker::spawn(Arc::clone(&store))?)
        } else {
            None
        };
        Ok(Self {
            trimmer: RetentionTrimmer::new(Arc::clone(&store)),
            store,
            registry,
            publisher,
            retention_worker,
        })
    }

    /// Validates and applies a batch atomically, returning one result per
    /// unit in input order. Change events are published only after the
    /// commit is durable; touched pairs are handed to the retention worker.
    pub fn ingest(
        &self,
        batch: &IngestBatch,
        audit: AuditStamp,
        options: &IngestOptions,
    ) -> Result<Vec<IngestResult>, AspectDbError> {
        let validated =
            BatchValidator::new(self.registry.as_ref(), self.store.config().max_batch_units)
                .validate(batch)?;
        let results = IngestionCoordinator::new(&self.store, self.publisher.as_ref())
            .ingest(validated, audit, options)?;
        if let Some(worker) = &self.retention_worker {
            for result in results.iter().filter(|r| !r.is_no_op && !r.skipped) {
                worker.enqueue(PairKey::new(result.urn.clone(), result.aspect_name.clone()));
            }
        }
        Ok(results)
    }

    /// Latest value of one aspect, reported as version 0.
    pub fn get_latest(&self, urn: &Urn, aspect_name: &str) -> Option<VersionedAspect> {
        self.store
            .get_latest(&PairKey::new(urn.clone(), aspect_name))
    }

    /// Latest value of one aspect, erroring instead of returning `None` so a
    /// service layer can map the absence cases straight to its own statuses.
    pub fn require_latest(
        &self,
        urn: &Urn,
        aspect_name: &str,
    ) -> Result<VersionedAspect, AspectDbError> {
        if let Some(aspect) = self.get_latest(urn, aspect_name) {
            return Ok(aspect);
        }
        if self.exists(urn) {
            Err(AspectDbError::AspectNotFound {
                entity_id: urn.to_string(),
                aspect_name: aspect_name.to_string(),
                version: 0,
            })
        } else {
            Err(AspectDbError::EntityNotFound(urn.to_string()))
        }
    }

    /// One stored value of an aspect; version 0 is the latest, higher
    /// versions are history.
    pub fn get_version(
        &self,
        urn: &Urn,
        aspect_name: &str,
        version: u64,
    ) -> Option<VersionedAspect> {
        self.store
            .get_version(&PairKey::new(urn.clone(), aspect_name), version)
    }

    /// High-water write counter for a pair: 0 after the first write, then
    /// incremented by every supersession. `None` when the pair was never
    /// written.
    pub fn current_version(&self, urn: &Urn, aspect_name: &str) -> Option<u64> {
        self.store
            .current_version(&PairKey::new(urn.clone(), aspect_name))
    }

    /// True while the entity has at least one live aspect.
    pub fn exists(&self, urn: &Urn) -> bool {
        self.store.entity_exists(urn)
    }

    /// Pages over the latest values of `aspect_name` across every entity of
    /// `entity_type`, urn ascending. `count` is clamped to the configured
    /// maximum page size.
    pub fn list_latest_aspects(
        &self,
        entity_type: &str,
        aspect_name: &str,
        start: usize,
        count: usize,
    ) -> ListedAspects {
        let limit = count.min(self.store.config().max_page_size);
        let (rows, total) = self
            .store
            .with_state(|state| state.latest_by_type(entity_type, aspect_name, start, limit));
        let values = rows
            .into_iter()
            .map(|(pair, _, record)| VersionedAspect {
                urn: pair.urn,
                aspect_name: pair.aspect_name,
                version: 0,
                record,
            })
            .collect();
        ListedAspects::from_page(values, start, limit, total)
    }

    /// Pages over the urns of `entity_type`, urn ascending.
    pub fn list_urns(&self, entity_type: &str, start: usize, count: usize) -> ListedUrns {
        let limit = count.min(self.store.config().max_page_size);
        let (entities, total) = self
            .store
            .with_state(|state| state.entity_ids_by_type(entity_type, start, limit));
        ListedUrns::from_page(entities, start, total)
    }

    /// Removes every version of every aspect of `urn` in one transaction.
    pub fn delete_entity(&self, urn: &Urn) -> Result<RollbackResult, AspectDbError> {
        let mut txn = self.store.begin_transaction(Isolation::RepeatableRead);
        let result = txn.delete_entity(urn)?;
        txn.commit()?;
        if result.entity_removed {
            info!(
                urn = %urn,
                aspects = result.aspects_removed,
                rows = result.rows_removed,
                "entity deleted"
            );
        }
        Ok(result)
    }

    /// Trims one pair under its configured retention policy, on the calling
    /// thread. Returns the number of versions removed.
    pub fn apply_retention(&self, urn: &Urn, aspect_name: &str) -> Result<usize, AspectDbError> {
        self.trimmer
            .apply_retention(&PairKey::new(urn.clone(), aspect_name))
    }

    /// Sweeps every known pair under the configured retention policies.
    pub fn apply_to_all(&self) -> RetentionSweep {
        self.trimmer.apply_to_all()
    }

    /// Begins an explicit transaction scope against the store. Scopes are
    /// always independent of one another, never nested in the caller's.
    pub fn begin_transaction(&self, isolation: Isolation) -> TransactionScope<'_> {
        self.store.begin_transaction(isolation)
    }

    /// Writes the current state to one checkpoint file, rotates the journal
    /// and prunes files from older generations.
    pub fn checkpoint(&self) -> Result<(), AspectDbError> {
        self.store.checkpoint()
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn config(&self) -> &AspectDbConfig {
        self.store.config()
    }
}
