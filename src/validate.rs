use crate::batch::{ExpectedVersion, IngestBatch};
use crate::error::AspectDbError;
use crate::record::SystemMetadata;
use crate::registry::EntityRegistry;
use crate::urn::Urn;
use serde_json::Value;

/// A proposed write that passed validation, with metadata defaults resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchUnit {
    pub urn: Urn,
    pub aspect_name: String,
    pub payload: Value,
    pub system_metadata: SystemMetadata,
    pub expected_version: Option<ExpectedVersion>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidatedBatch {
    pub units: Vec<BatchUnit>,
}

impl ValidatedBatch {
    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// Validates whole batches against the registry. Either every unit is
/// well-formed or the batch is rejected; validation never touches storage.
pub struct BatchValidator<'a> {
    registry: &'a dyn EntityRegistry,
    max_units: usize,
}

impl<'a> BatchValidator<'a> {
    pub fn new(registry: &'a dyn EntityRegistry, max_units: usize) -> Self {
        Self {
            registry,
            max_units,
        }
    }

    pub fn validate(&self, batch: &IngestBatch) -> Result<ValidatedBatch, AspectDbError> {
        if batch.len() > self.max_units {
            return Err(AspectDbError::Validation(format!(
                "batch has {} units, limit is {}",
                batch.len(),
                self.max_units
            )));
        }

        let mut units = Vec::with_capacity(batch.len());
        for (index, unit) in batch.iter().enumerate() {
            if unit.aspect_name.is_empty() {
                return Err(AspectDbError::Validation(format!(
                    "unit {index}: aspect name must not be empty"
                )));
            }
            if unit.payload.is_null() {
                return Err(AspectDbError::Validation(format!(
                    "unit {index}: payload must not be null"
                )));
            }
            let entity_type = unit.urn.entity_type();
            if self.registry.key_schema_for(entity_type).is_none() {
                return Err(AspectDbError::Validation(format!(
                    "unit {index}: unknown entity type '{entity_type}'"
                )));
            }
            if !self.registry.is_valid_aspect(entity_type, &unit.aspect_name) {
                return Err(AspectDbError::Validation(format!(
                    "unit {index}: aspect '{}' is not registered for entity type '{entity_type}'",
                    unit.aspect_name
                )));
            }
            units.push(BatchUnit {
                urn: unit.urn.clone(),
                aspect_name: unit.aspect_name.clone(),
                payload: unit.payload.clone(),
                system_metadata: unit
                    .system_metadata
                    .clone()
                    .unwrap_or_else(SystemMetadata::generated),
                expected_version: unit.expected_version,
            });
        }
        Ok(ValidatedBatch { units })
    }
}
