//! Batch ingestion.
//!
//! One transaction per batch: every unit runs read-current, precondition
//! check, no-op detection, write-and-renumber against that scope, in input
//! order. Later units targeting a pair an earlier unit wrote observe the
//! earlier write. The batch commits or rolls back as a whole; change events
//! go out only after the commit is durable.

use crate::batch::ExpectedVersion;
use crate::error::AspectDbError;
use crate::publish::{ChangeEvent, ChangeEventPublisher};
use crate::record::{AspectRecord, AuditStamp};
use crate::store::state::PairKey;
use crate::store::{Isolation, RecordStore};
use crate::urn::Urn;
use crate::validate::ValidatedBatch;
use serde_json::Value;
use tracing::{debug, warn};

/// What to do with a unit whose expected prior version does not match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApplyMode {
    /// The whole batch rolls back on the first mismatch.
    #[default]
    AllOrNothing,
    /// Mismatched units are skipped and reported; the rest still commit.
    BestEffort,
}

/// Per-call ingestion switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOptions {
    pub emit_events: bool,
    /// Write even when the payload equals the current latest.
    pub force: bool,
    pub mode: ApplyMode,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            emit_events: true,
            force: false,
            mode: ApplyMode::AllOrNothing,
        }
    }
}

impl IngestOptions {
    pub fn with_emit_events(mut self, emit_events: bool) -> Self {
        self.emit_events = emit_events;
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn best_effort(mut self) -> Self {
        self.mode = ApplyMode::BestEffort;
        self
    }
}

/// Committed outcome of one batch unit, in input order.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestResult {
    pub urn: Urn,
    pub aspect_name: String,
    pub previous_payload: Option<Value>,
    pub new_payload: Value,
    /// Write counter after this unit: unchanged for no-ops and skips.
    pub version: u64,
    pub is_no_op: bool,
    /// Set only in best-effort mode, for units whose precondition failed.
    pub skipped: bool,
}

/// Drives the per-unit protocol for one batch inside one transaction, then
/// publishes committed changes.
pub(crate) struct IngestionCoordinator<'a> {
    store: &'a RecordStore,
    publisher: &'a dyn ChangeEventPublisher,
}

impl<'a> IngestionCoordinator<'a> {
    pub fn new(store: &'a RecordStore, publisher: &'a dyn ChangeEventPublisher) -> Self {
        Self { store, publisher }
    }

    pub fn ingest(
        &self,
        batch: ValidatedBatch,
        audit: AuditStamp,
        options: &IngestOptions,
    ) -> Result<Vec<IngestResult>, AspectDbError> {
        let mut txn = self.store.begin_transaction(Isolation::RepeatableRead);
        let mut results = Vec::with_capacity(batch.units.len());
        let mut events = Vec::new();

        for (index, unit) in batch.units.into_iter().enumerate() {
            let pair = PairKey::new(unit.urn.clone(), unit.aspect_name.clone());
            let current = txn.locked_latest(&pair)?;

            if let Some(expected) = unit.expected_version {
                let matched = match (expected, &current) {
                    (ExpectedVersion::Absent, None) => true,
                    (ExpectedVersion::Exactly(want), Some((have, _))) => want == *have,
                    _ => false,
                };
                if !matched {
                    let found = current
                        .as_ref()
                        .map(|(version, _)| version.to_string())
                        .unwrap_or_else(|| "absent".into());
                    let err = AspectDbError::PreconditionFailed {
                        entity_id: unit.urn.to_string(),
                        aspect_name: unit.aspect_name.clone(),
                        expected: expected.to_string(),
                        found,
                    };
                    match options.mode {
                        ApplyMode::AllOrNothing => return Err(err),
                        ApplyMode::BestEffort => {
                            warn!(unit = index, error = %err, "skipping unit, precondition failed");
                            results.push(IngestResult {
                                urn: unit.urn,
                                aspect_name: unit.aspect_name,
                                previous_payload: current.as_ref().map(|(_, r)| r.payload.clone()),
                                new_payload: unit.payload,
                                version: current.map(|(version, _)| version).unwrap_or(0),
                                is_no_op: false,
                                skipped: true,
                            });
                            continue;
                        }
                    }
                }
            }

            if !options.force {
                if let Some((version, record)) = &current {
                    if record.payload == unit.payload {
                        results.push(IngestResult {
                            urn: unit.urn.clone(),
                            aspect_name: unit.aspect_name.clone(),
                            previous_payload: Some(record.payload.clone()),
                            new_payload: unit.payload.clone(),
                            version: *version,
                            is_no_op: true,
                            skipped: false,
                        });
                        events.push(ChangeEvent {
                            urn: unit.urn,
                            aspect_name: unit.aspect_name,
                            previous_payload: Some(record.payload.clone()),
                            new_payload: unit.payload,
                            version: *version,
                            is_no_op: true,
                            audit: audit.clone(),
                            system_metadata: unit.system_metadata,
                        });
                        continue;
                    }
                }
            }

            let record = AspectRecord::new(
                unit.payload.clone(),
                unit.system_metadata.clone(),
                audit.clone(),
            );
            let version = txn.write_and_renumber(&pair, record)?;
            let previous_payload = current.map(|(_, record)| record.payload);
            results.push(IngestResult {
                urn: unit.urn.clone(),
                aspect_name: unit.aspect_name.clone(),
                previous_payload: previous_payload.clone(),
                new_payload: unit.payload.clone(),
                version,
                is_no_op: false,
                skipped: false,
            });
            events.push(ChangeEvent {
                urn: unit.urn,
                aspect_name: unit.aspect_name,
                previous_payload,
                new_payload: unit.payload,
                version,
                is_no_op: false,
                audit: audit.clone(),
                system_metadata: unit.system_metadata,
            });
        }

        let seq = txn.commit()?;
        debug!(seq, units = results.len(), "ingest batch committed");

        if options.emit_events {
            let publish_no_ops = self.store.config().publish_no_ops;
            for event in &events {
                if event.is_no_op && !publish_no_ops {
                    continue;
                }
                if let Err(e) = self.publisher.publish(event) {
                    warn!(
                        urn = %event.urn,
                        aspect = %event.aspect_name,
                        version = event.version,
                        error = %e,
                        "change event publish failed, storage commit stands"
                    );
                }
            }
        }

        Ok(results)
    }
}
