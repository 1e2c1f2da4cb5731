use std::collections::{BTreeMap, BTreeSet};

/// Describes how an entity type is keyed. Consumed by validation to decide
/// whether an entity type is known at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySchema {
    pub entity_type: String,
    pub key_aspect: String,
}

/// Read-only schema knowledge supplied by the hosting system. The engine never
/// introspects payloads; it only asks which names are legal.
pub trait EntityRegistry: Send + Sync {
    fn is_valid_aspect(&self, entity_type: &str, aspect_name: &str) -> bool;
    fn key_schema_for(&self, entity_type: &str) -> Option<KeySchema>;
}

#[derive(Debug, Clone)]
struct EntityTypeSpec {
    key_aspect: String,
    aspects: BTreeSet<String>,
}

/// In-memory registry built from per-type aspect lists.
#[derive(Debug, Clone, Default)]
pub struct StaticEntityRegistry {
    entities: BTreeMap<String, EntityTypeSpec>,
}

impl StaticEntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(
        mut self,
        entity_type: impl Into<String>,
        key_aspect: impl Into<String>,
        aspects: &[&str],
    ) -> Self {
        let key_aspect = key_aspect.into();
        let mut set: BTreeSet<String> = aspects.iter().map(|a| a.to_string()).collect();
        set.insert(key_aspect.clone());
        self.entities.insert(
            entity_type.into(),
            EntityTypeSpec {
                key_aspect,
                aspects: set,
            },
        );
        self
    }

    pub fn entity_types(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }
}

impl EntityRegistry for StaticEntityRegistry {
    fn is_valid_aspect(&self, entity_type: &str, aspect_name: &str) -> bool {
        self.entities
            .get(entity_type)
            .map(|spec| spec.aspects.contains(aspect_name))
            .unwrap_or(false)
    }

    fn key_schema_for(&self, entity_type: &str) -> Option<KeySchema> {
        self.entities.get(entity_type).map(|spec| KeySchema {
            entity_type: entity_type.to_string(),
            key_aspect: spec.key_aspect.clone(),
        })
    }
}
