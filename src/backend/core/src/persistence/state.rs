//! Persisted state and reconstruction of a graph from it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::aggregate::state;
use crate::entity::{Entity, EntitySchema, SlotKind};
use crate::error::{Result, TrellisError};
use crate::property::PropertyValue;

/// Stored form of one node and its children.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub values: BTreeMap<String, PropertyValue>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<String, PersistedChild>,
}

/// Stored contents of one child slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "items", rename_all = "snake_case")]
pub enum PersistedChild {
    Single(Option<Box<PersistedState>>),
    List(Vec<PersistedState>),
}

impl PersistedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn value(&self, name: &str) -> Option<&PropertyValue> {
        self.values.get(name)
    }

    pub fn list(&self, slot: &str) -> &[PersistedState] {
        match self.children.get(slot) {
            Some(PersistedChild::List(items)) => items,
            _ => &[],
        }
    }

    pub fn single(&self, slot: &str) -> Option<&PersistedState> {
        match self.children.get(slot) {
            Some(PersistedChild::Single(Some(child))) => Some(child),
            _ => None,
        }
    }
}

impl Entity {
    /// The node's current values, without children.
    pub fn persisted_values(&self) -> PersistedState {
        PersistedState {
            values: self.values(),
            children: BTreeMap::new(),
        }
    }
}

impl EntitySchema {
    /// Rebuild a persisted node and its children with silent loads.
    ///
    /// Values for properties the schema does not declare are ignored. The
    /// result is not new and not modified; a full rule pass runs afterwards
    /// when `check_rules_on_fetch` is set.
    pub fn fetch(&self, persisted: &PersistedState) -> Result<Entity> {
        let entity = build(self, persisted)?;
        state::refresh_subtree(&entity);
        if self.config().check_rules_on_fetch {
            entity.check_rules_deep();
        }
        debug!(entity = %entity.id(), entity_type = %self.name(), "Fetched entity");
        Ok(entity)
    }
}

fn build(schema: &EntitySchema, persisted: &PersistedState) -> Result<Entity> {
    let entity = Entity::new(schema.clone(), false);
    {
        let mut core = entity.inner.core.lock();
        for (name, value) in &persisted.values {
            core.properties.load(name, value.clone());
        }
    }

    for (slot, child) in &persisted.children {
        let def = schema.slot(slot).ok_or_else(|| {
            TrellisError::reconstruction(format!(
                "entity type '{}' has no child slot '{}'",
                schema.name(),
                slot
            ))
        })?;
        let list = entity
            .slot_list(slot)
            .ok_or_else(|| TrellisError::child_slot_not_found(schema.name(), slot))?;

        match (def.kind, child) {
            (SlotKind::List, PersistedChild::List(items)) => {
                for item in items {
                    list.attach_loaded(&build(&def.schema, item)?, &entity);
                }
            }
            (SlotKind::Single, PersistedChild::Single(item)) => {
                if let Some(item) = item {
                    list.attach_loaded(&build(&def.schema, item)?, &entity);
                }
            }
            _ => {
                return Err(TrellisError::reconstruction(format!(
                    "slot '{}' of '{}' has the wrong cardinality",
                    slot,
                    schema.name()
                )))
            }
        }
    }
    Ok(entity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use serde_json::json;

    fn order_schema() -> EntitySchema {
        let line = EntitySchema::builder("Line").properties(["sku", "qty"]).build().unwrap();
        EntitySchema::builder("Order")
            .property("number")
            .list("lines", &line)
            .child("note", &line)
            .build()
            .unwrap()
    }

    #[test]
    fn test_fetch_builds_clean_graph() {
        let mut persisted = PersistedState::new().with_value("number", "A-1");
        persisted.children.insert(
            "lines".into(),
            PersistedChild::List(vec![
                PersistedState::new().with_value("sku", "X").with_value("qty", 2),
                PersistedState::new().with_value("sku", "Y").with_value("qty", 1),
            ]),
        );

        let order = order_schema().fetch(&persisted).unwrap();
        assert!(!order.is_new());
        assert!(!order.is_modified());
        assert_eq!(order.get("number").unwrap(), json!("A-1"));

        let lines = order.list("lines").unwrap();
        assert_eq!(lines.len(), 2);
        let first = lines.first().unwrap();
        assert_eq!(first.get("qty").unwrap(), json!(2));
        assert!(!first.is_new());
        assert_eq!(first.root(), Some(order.clone()));
    }

    #[test]
    fn test_fetch_rejects_unknown_slot() {
        let mut persisted = PersistedState::new();
        persisted
            .children
            .insert("bogus".into(), PersistedChild::List(Vec::new()));
        let err = order_schema().fetch(&persisted).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ReconstructionFailed);
    }

    #[test]
    fn test_cardinality_mismatch() {
        let mut persisted = PersistedState::new();
        persisted
            .children
            .insert("note".into(), PersistedChild::List(Vec::new()));
        let err = order_schema().fetch(&persisted).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ReconstructionFailed);
    }

    #[test]
    fn test_persisted_state_serde_shape() {
        let mut state = PersistedState::new().with_value("number", "A-1");
        state
            .children
            .insert("note".into(), PersistedChild::Single(None));
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["children"]["note"]["kind"], json!("single"));
        let back: PersistedState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }
}
