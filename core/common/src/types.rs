//! Common types used throughout Outbox.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opaque structured entity data. The engine never inspects it beyond the
/// reference fields named by the [`crate::ReferenceSchema`].
pub type Payload = serde_json::Value;

/// Client-generated identifier of a record on this device.
///
/// Stable for the record's lifetime and independent of any server id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(String);

impl LocalId {
    /// Create a LocalId from a string.
    ///
    /// # Errors
    /// - Returns error if id is empty
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::Error::InvalidInput(
                "LocalId cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Generate a fresh random LocalId.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier assigned by the server once a create succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(String);

impl ServerId {
    /// Wrap a server-assigned identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic sequence number of a queued mutation.
///
/// Defines the total order in which local intents were created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpId(pub u64);

impl OpId {
    /// The id following this one.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Zero-padded form whose lexical order matches numeric order.
    pub fn storage_key(&self) -> String {
        format!("{:020}", self.0)
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// Kind of entity a record holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityType {
    Client,
    Project,
    Task,
    TimeEntry,
    Invoice,
}

impl EntityType {
    /// All known entity types.
    pub const ALL: [EntityType; 5] = [
        EntityType::Client,
        EntityType::Project,
        EntityType::Task,
        EntityType::TimeEntry,
        EntityType::Invoice,
    ];

    /// Name used in payloads and configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Client => "client",
            EntityType::Project => "project",
            EntityType::Task => "task",
            EntityType::TimeEntry => "timeEntry",
            EntityType::Invoice => "invoice",
        }
    }

    /// REST collection segment for this type.
    pub fn collection(&self) -> &'static str {
        match self {
            EntityType::Client => "clients",
            EntityType::Project => "projects",
            EntityType::Task => "tasks",
            EntityType::TimeEntry => "time-entries",
            EntityType::Invoice => "invoices",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "client" => Ok(EntityType::Client),
            "project" => Ok(EntityType::Project),
            "task" => Ok(EntityType::Task),
            "timeEntry" | "time-entry" | "time_entry" => Ok(EntityType::TimeEntry),
            "invoice" => Ok(EntityType::Invoice),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown entity type: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_id_creation() {
        let id = LocalId::new("p1").unwrap();
        assert_eq!(id.as_str(), "p1");
    }

    #[test]
    fn test_local_id_empty_fails() {
        assert!(LocalId::new("").is_err());
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(LocalId::generate(), LocalId::generate());
    }

    #[test]
    fn test_op_id_storage_key_orders_numerically() {
        let a = OpId(9).storage_key();
        let b = OpId(10).storage_key();
        assert!(a < b);
        assert_eq!(OpId(9).next(), OpId(10));
    }

    #[test]
    fn test_entity_type_round_trip_names() {
        for ty in EntityType::ALL {
            assert_eq!(ty.as_str().parse::<EntityType>().unwrap(), ty);
        }
        assert!("widget".parse::<EntityType>().is_err());
    }

    #[test]
    fn test_entity_type_serde_uses_camel_case() {
        let json = serde_json::to_string(&EntityType::TimeEntry).unwrap();
        assert_eq!(json, "\"timeEntry\"");
    }
}
