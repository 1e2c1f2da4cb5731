use crate::error::AspectDbError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Globally unique entity identifier with an embedded type tag.
///
/// Canonical shape is `type:value`, for example `dataset:events.page_views`.
/// The value part may itself contain colons; the type part may not.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Urn(String);

impl Urn {
    pub fn parse(raw: &str) -> Result<Self, AspectDbError> {
        let Some((entity_type, value)) = raw.split_once(':') else {
            return Err(AspectDbError::Validation(format!(
                "urn '{raw}' is missing the type:value separator"
            )));
        };
        if entity_type.is_empty() {
            return Err(AspectDbError::Validation(format!(
                "urn '{raw}' has an empty entity type"
            )));
        }
        if value.is_empty() {
            return Err(AspectDbError::Validation(format!(
                "urn '{raw}' has an empty value"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn new(entity_type: &str, value: &str) -> Result<Self, AspectDbError> {
        if entity_type.contains(':') {
            return Err(AspectDbError::Validation(format!(
                "entity type '{entity_type}' must not contain ':'"
            )));
        }
        Self::parse(&format!("{entity_type}:{value}"))
    }

    pub fn entity_type(&self) -> &str {
        self.0.split_once(':').map(|(t, _)| t).unwrap_or("")
    }

    pub fn value(&self) -> &str {
        self.0.split_once(':').map(|(_, v)| v).unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    // Unvalidated constructor for range-scan bounds. Never hand these out.
    pub(crate) fn from_raw(raw: String) -> Self {
        Self(raw)
    }
}

impl fmt::Display for Urn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Urn {
    type Err = AspectDbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
