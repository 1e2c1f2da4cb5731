use crate::record::AspectRecord;
use crate::urn::Urn;
use im::OrdMap;
use serde::{Deserialize, Serialize};
use std::ops::Bound;

/// Identity of one version chain: an entity plus one of its aspect names.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PairKey {
    pub urn: Urn,
    pub aspect_name: String,
}

impl PairKey {
    pub fn new(urn: Urn, aspect_name: impl Into<String>) -> Self {
        Self {
            urn,
            aspect_name: aspect_name.into(),
        }
    }
}

/// Storage key of one persisted row. Slot 0 is the latest value of its pair;
/// positive slots hold superseded values.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub urn: Urn,
    pub aspect_name: String,
    pub version: u64,
}

impl RecordKey {
    pub fn new(pair: &PairKey, version: u64) -> Self {
        Self {
            urn: pair.urn.clone(),
            aspect_name: pair.aspect_name.clone(),
            version,
        }
    }

    pub fn pair(&self) -> PairKey {
        PairKey {
            urn: self.urn.clone(),
            aspect_name: self.aspect_name.clone(),
        }
    }
}

/// Monotonic per-pair write counter. Survives retention trims so committed
/// version numbers are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairState {
    pub current_version: u64,
}

/// One applied state change, journaled in commit order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecordOp {
    UpsertRow { key: RecordKey, record: AspectRecord },
    RemoveRow { key: RecordKey },
    SetPairVersion { pair: PairKey, version: u64 },
    RemovePair { pair: PairKey },
}

/// The whole store image: persistent maps, so clones are O(1) structural
/// shares and serve as repeatable-read snapshots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreState {
    pub records: OrdMap<RecordKey, AspectRecord>,
    pub pairs: OrdMap<PairKey, PairState>,
}

// Upper bound for a "type:*" range scan: ';' is the successor of ':'.
fn type_scan_end(entity_type: &str) -> String {
    format!("{entity_type};")
}

impl StoreState {
    pub fn apply(&mut self, op: &RecordOp) {
        match op {
            RecordOp::UpsertRow { key, record } => {
                self.records.insert(key.clone(), record.clone());
            }
            RecordOp::RemoveRow { key } => {
                self.records.remove(key);
            }
            RecordOp::SetPairVersion { pair, version } => {
                self.pairs.insert(
                    pair.clone(),
                    PairState {
                        current_version: *version,
                    },
                );
            }
            RecordOp::RemovePair { pair } => {
                self.pairs.remove(pair);
            }
        }
    }

    pub fn apply_all(&mut self, ops: &[RecordOp]) {
        for op in ops {
            self.apply(op);
        }
    }

    pub fn row(&self, key: &RecordKey) -> Option<&AspectRecord> {
        self.records.get(key)
    }

    pub fn latest_row(&self, pair: &PairKey) -> Option<&AspectRecord> {
        self.records.get(&RecordKey::new(pair, 0))
    }

    pub fn pair_version(&self, pair: &PairKey) -> Option<u64> {
        self.pairs.get(pair).map(|p| p.current_version)
    }

    /// All stored slots of a pair in ascending slot order, slot 0 first.
    pub fn versions_of(&self, pair: &PairKey) -> Vec<(u64, AspectRecord)> {
        let lo = RecordKey::new(pair, 0);
        let hi = RecordKey::new(pair, u64::MAX);
        self.records
            .range((Bound::Included(lo), Bound::Included(hi)))
            .map(|(k, v)| (k.version, v.clone()))
            .collect()
    }

    /// Pairs belonging to one entity, in aspect-name order.
    pub fn pairs_of_entity(&self, urn: &Urn) -> Vec<PairKey> {
        let lo = PairKey {
            urn: urn.clone(),
            aspect_name: String::new(),
        };
        // "\0" appended makes the immediate successor of the urn string.
        let hi = PairKey {
            urn: Urn::from_raw(format!("{}\0", urn.as_str())),
            aspect_name: String::new(),
        };
        self.pairs
            .range((Bound::Included(lo), Bound::Excluded(hi)))
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn entity_exists(&self, urn: &Urn) -> bool {
        self.pairs_of_entity(urn)
            .iter()
            .any(|pair| self.latest_row(pair).is_some())
    }

    fn type_pair_range(
        &self,
        entity_type: &str,
    ) -> impl Iterator<Item = (&PairKey, &PairState)> {
        let lo = PairKey {
            urn: Urn::from_raw(format!("{entity_type}:")),
            aspect_name: String::new(),
        };
        let hi = PairKey {
            urn: Urn::from_raw(type_scan_end(entity_type)),
            aspect_name: String::new(),
        };
        self.pairs
            .range((Bound::Included(lo), Bound::Excluded(hi)))
    }

    /// Latest rows of one aspect across every entity of a type, urn ascending.
    /// Returns the page slice plus the total number of matching rows.
    pub fn latest_by_type(
        &self,
        entity_type: &str,
        aspect_name: &str,
        offset: usize,
        limit: usize,
    ) -> (Vec<(PairKey, u64, AspectRecord)>, usize) {
        let mut total = 0usize;
        let mut page = Vec::new();
        for (pair, state) in self.type_pair_range(entity_type) {
            if pair.aspect_name != aspect_name {
                continue;
            }
            let Some(record) = self.latest_row(pair) else {
                continue;
            };
            if total >= offset && page.len() < limit {
                page.push((pair.clone(), state.current_version, record.clone()));
            }
            total += 1;
        }
        (page, total)
    }

    /// Distinct existing entity ids of a type, urn ascending, with the total.
    pub fn entity_ids_by_type(
        &self,
        entity_type: &str,
        offset: usize,
        limit: usize,
    ) -> (Vec<Urn>, usize) {
        let mut total = 0usize;
        let mut page = Vec::new();
        let mut last: Option<&Urn> = None;
        for (pair, _) in self.type_pair_range(entity_type) {
            if last == Some(&pair.urn) {
                continue;
            }
            if self.latest_row(pair).is_none() {
                continue;
            }
            last = Some(&pair.urn);
            if total >= offset && page.len() < limit {
                page.push(pair.urn.clone());
            }
            total += 1;
        }
        (page, total)
    }

    /// Every pair with a write counter, urn ascending. Full scan; used by
    /// retention sweeps, not by the ingest path.
    pub fn all_pairs(&self) -> Vec<PairKey> {
        self.pairs.keys().cloned().collect()
    }

    pub fn row_count(&self) -> usize {
        self.records.len()
    }

    pub fn pair_count(&self) -> usize {
        self.pairs.len()
    }
}
