//! Foreign-key reference schema for entity payloads.
//!
//! Payload fields listed here hold the local id of another record (or an
//! array of them). The sync layer uses the schema to compute op dependencies
//! and to swap local ids for server ids before a request leaves the device.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{EntityType, Payload};
use crate::{Error, Result};

/// A single reference field on an entity payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceField {
    /// Top-level payload field name.
    pub field: String,
    /// Entity type the field points at.
    pub target: EntityType,
    /// Whether the field holds an array of ids.
    #[serde(default)]
    pub many: bool,
}

/// Reference fields by source entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceSchema {
    fields: BTreeMap<EntityType, Vec<ReferenceField>>,
}

impl ReferenceSchema {
    /// Schema with no references at all.
    pub fn empty() -> Self {
        Self {
            fields: BTreeMap::new(),
        }
    }

    /// Add a single-valued reference field.
    pub fn with_reference(
        mut self,
        source: EntityType,
        field: impl Into<String>,
        target: EntityType,
    ) -> Self {
        self.fields.entry(source).or_default().push(ReferenceField {
            field: field.into(),
            target,
            many: false,
        });
        self
    }

    /// Add an array-valued reference field.
    pub fn with_many(
        mut self,
        source: EntityType,
        field: impl Into<String>,
        target: EntityType,
    ) -> Self {
        self.fields.entry(source).or_default().push(ReferenceField {
            field: field.into(),
            target,
            many: true,
        });
        self
    }

    /// Reference fields declared for an entity type.
    pub fn fields_for(&self, entity_type: EntityType) -> &[ReferenceField] {
        self.fields
            .get(&entity_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Collect every referenced id in a payload, paired with its target type.
    ///
    /// Missing or null fields are skipped. Non-string values are ignored.
    pub fn referenced_ids(
        &self,
        entity_type: EntityType,
        payload: &Payload,
    ) -> Vec<(String, EntityType)> {
        let mut ids = Vec::new();
        for field in self.fields_for(entity_type) {
            match payload.get(&field.field) {
                Some(Payload::String(id)) if !field.many => ids.push((id.clone(), field.target)),
                Some(Payload::Array(items)) if field.many => {
                    ids.extend(
                        items
                            .iter()
                            .filter_map(Payload::as_str)
                            .map(|id| (id.to_string(), field.target)),
                    );
                }
                _ => {}
            }
        }
        ids
    }

    /// Return a copy of `payload` with reference values passed through `map`.
    ///
    /// `map` receives each value with the field's target type and returns
    /// `Ok(Some(new))` to substitute, `Ok(None)` to keep the value as-is, or
    /// an error to abort the rewrite.
    pub fn rewrite<F>(&self, entity_type: EntityType, payload: &Payload, mut map: F) -> Result<Payload>
    where
        F: FnMut(&str, EntityType) -> Result<Option<String>>,
    {
        let fields = self.fields_for(entity_type);
        if fields.is_empty() {
            return Ok(payload.clone());
        }

        let mut rewritten = payload.clone();
        let Some(object) = rewritten.as_object_mut() else {
            return Err(Error::InvalidInput(format!(
                "{} payload must be a JSON object",
                entity_type
            )));
        };

        for field in fields {
            let Some(value) = object.get_mut(&field.field) else {
                continue;
            };
            match value {
                Payload::String(id) if !field.many => {
                    if let Some(new_id) = map(id, field.target)? {
                        *id = new_id;
                    }
                }
                Payload::Array(items) if field.many => {
                    for item in items.iter_mut() {
                        if let Payload::String(id) = item {
                            if let Some(new_id) = map(id, field.target)? {
                                *id = new_id;
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(rewritten)
    }
}

impl Default for ReferenceSchema {
    fn default() -> Self {
        Self::empty()
            .with_reference(EntityType::Project, "clientId", EntityType::Client)
            .with_reference(EntityType::Task, "projectId", EntityType::Project)
            .with_reference(EntityType::TimeEntry, "taskId", EntityType::Task)
            .with_reference(EntityType::TimeEntry, "projectId", EntityType::Project)
            .with_reference(EntityType::Invoice, "clientId", EntityType::Client)
            .with_many(EntityType::Invoice, "timeEntryIds", EntityType::TimeEntry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_referenced_ids_single_and_many() {
        let schema = ReferenceSchema::default();

        let task = json!({"title": "Write report", "projectId": "p1"});
        assert_eq!(
            schema.referenced_ids(EntityType::Task, &task),
            vec![("p1".to_string(), EntityType::Project)]
        );

        let invoice = json!({"clientId": "c1", "timeEntryIds": ["t1", "t2"]});
        let ids = schema.referenced_ids(EntityType::Invoice, &invoice);
        assert_eq!(ids.len(), 3);
        assert!(ids.contains(&("t2".to_string(), EntityType::TimeEntry)));
    }

    #[test]
    fn test_null_reference_is_skipped() {
        let schema = ReferenceSchema::default();
        let task = json!({"title": "Inbox item", "projectId": null});
        assert!(schema.referenced_ids(EntityType::Task, &task).is_empty());
    }

    #[test]
    fn test_rewrite_substitutes_known_ids() {
        let schema = ReferenceSchema::default();
        let task = json!({"title": "Write report", "projectId": "p1"});

        let sent = schema
            .rewrite(EntityType::Task, &task, |id, target| {
                assert_eq!(target, EntityType::Project);
                Ok((id == "p1").then(|| "srv-42".to_string()))
            })
            .unwrap();

        assert_eq!(sent["projectId"], "srv-42");
        assert_eq!(sent["title"], "Write report");
        // Original is untouched.
        assert_eq!(task["projectId"], "p1");
    }

    #[test]
    fn test_rewrite_propagates_errors() {
        let schema = ReferenceSchema::default();
        let entry = json!({"taskId": "t9"});
        let result = schema.rewrite(EntityType::TimeEntry, &entry, |id, _| {
            Err(Error::IntegrityViolation(format!("missing parent {}", id)))
        });
        assert!(matches!(result, Err(Error::IntegrityViolation(_))));
    }

    #[test]
    fn test_rewrite_rejects_non_object_payload() {
        let schema = ReferenceSchema::default();
        let result = schema.rewrite(EntityType::Task, &json!([1, 2]), |_, _| Ok(None));
        assert!(result.is_err());
    }

    proptest::proptest! {
        #[test]
        fn prop_rewrite_with_identity_map_is_noop(
            title in "[a-zA-Z ]{0,24}",
            project in "[a-z0-9-]{1,12}",
        ) {
            let schema = ReferenceSchema::default();
            let task = json!({"title": title, "projectId": project});
            let rewritten = schema.rewrite(EntityType::Task, &task, |_, _| Ok(None)).unwrap();
            proptest::prop_assert_eq!(rewritten, task);
        }
    }

    #[test]
    fn test_schema_round_trips_through_json() {
        let schema = ReferenceSchema::default();
        let json = serde_json::to_string(&schema).unwrap();
        let restored: ReferenceSchema = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, schema);
    }
}
