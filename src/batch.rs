use crate::record::SystemMetadata;
use crate::urn::Urn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Optimistic-concurrency guard for one unit: what the caller believes the
/// pair's current committed version to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpectedVersion {
    /// The pair must not have been written yet.
    Absent,
    /// The pair's current committed version must equal this.
    Exactly(u64),
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedVersion::Absent => f.write_str("absent"),
            ExpectedVersion::Exactly(v) => write!(f, "{v}"),
        }
    }
}

/// One proposed aspect write, as submitted by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AspectUpsert {
    pub urn: Urn,
    pub aspect_name: String,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_metadata: Option<SystemMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<ExpectedVersion>,
}

impl AspectUpsert {
    pub fn new(urn: Urn, aspect_name: impl Into<String>, payload: Value) -> Self {
        Self {
            urn,
            aspect_name: aspect_name.into(),
            payload,
            system_metadata: None,
            expected_version: None,
        }
    }

    pub fn with_system_metadata(mut self, system_metadata: SystemMetadata) -> Self {
        self.system_metadata = Some(system_metadata);
        self
    }

    pub fn expecting(mut self, expected: ExpectedVersion) -> Self {
        self.expected_version = Some(expected);
        self
    }
}

/// An ordered collection of proposed writes applied as one transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestBatch {
    pub units: Vec<AspectUpsert>,
}

impl IngestBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(unit: AspectUpsert) -> Self {
        Self { units: vec![unit] }
    }

    pub fn with_unit(mut self, unit: AspectUpsert) -> Self {
        self.units.push(unit);
        self
    }

    pub fn push(&mut self, unit: AspectUpsert) {
        self.units.push(unit);
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AspectUpsert> {
        self.units.iter()
    }
}
