use crate::urn::Urn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Who wrote a value and when (epoch millis).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditStamp {
    pub actor: String,
    pub time_ms: u64,
}

impl AuditStamp {
    pub fn new(actor: impl Into<String>, time_ms: u64) -> Self {
        Self {
            actor: actor.into(),
            time_ms,
        }
    }

    pub fn now(actor: impl Into<String>) -> Self {
        Self::new(actor, epoch_millis())
    }
}

/// Producer-identifying metadata carried through the store untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemMetadata {
    pub run_id: String,
    pub last_observed_ms: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

impl SystemMetadata {
    pub fn for_run(run_id: impl Into<String>, last_observed_ms: u64) -> Self {
        Self {
            run_id: run_id.into(),
            last_observed_ms,
            properties: BTreeMap::new(),
        }
    }

    /// Fresh metadata for writes that did not arrive with any.
    pub fn generated() -> Self {
        Self::for_run(Uuid::new_v4().to_string(), epoch_millis())
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// One persisted aspect value. The version lives in the row's key; slot 0 is
/// always the latest committed value for its pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AspectRecord {
    pub payload: Value,
    pub system_metadata: SystemMetadata,
    pub audit: AuditStamp,
}

impl AspectRecord {
    pub fn new(payload: Value, system_metadata: SystemMetadata, audit: AuditStamp) -> Self {
        Self {
            payload,
            system_metadata,
            audit,
        }
    }
}

/// An aspect row together with its identity and committed version, as handed
/// back by reads and listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedAspect {
    pub urn: Urn,
    pub aspect_name: String,
    pub version: u64,
    pub record: AspectRecord,
}

impl VersionedAspect {
    pub fn payload(&self) -> &Value {
        &self.record.payload
    }
}
