use crate::record::{AuditStamp, SystemMetadata};
use crate::urn::Urn;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One committed aspect write, handed to the publisher after the owning
/// transaction is durable. Events for one pair arrive in supersession order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub urn: Urn,
    pub aspect_name: String,
    pub previous_payload: Option<Value>,
    pub new_payload: Value,
    /// Write counter at commit: 0 when the write created the pair, otherwise
    /// the historical slot now holding the superseded value.
    pub version: u64,
    pub is_no_op: bool,
    pub audit: AuditStamp,
    pub system_metadata: SystemMetadata,
}

/// Downstream sink for committed changes.
///
/// Called strictly after durable commit, once per applied unit, in applied
/// order. At-least-once delivery is acceptable; a failed publish is logged by
/// the caller and never rolls back storage.
pub trait ChangeEventPublisher: Send + Sync {
    fn publish(&self, event: &ChangeEvent) -> Result<(), crate::error::AspectDbError>;
}

/// Publisher that drops every event. Useful when no downstream consumer is
/// wired up, and as the default for tests that only exercise storage.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopChangeEventPublisher;

impl ChangeEventPublisher for NoopChangeEventPublisher {
    fn publish(&self, _event: &ChangeEvent) -> Result<(), crate::error::AspectDbError> {
        Ok(())
    }
}
