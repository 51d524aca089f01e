//! Full-fidelity snapshots for transfer across a process boundary.
//!
//! Unlike [`PersistedState`](super::PersistedState), a snapshot carries
//! committed values, modified and lifecycle flags, messages, and tombstones,
//! so an in-progress edit can be shipped and resumed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::aggregate::state;
use crate::entity::{Entity, EntitySchema};
use crate::error::{Result, TrellisError};
use crate::property::PropertySnapshot;

/// Serializable image of one node and its subtree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub entity_type: String,
    pub id: Uuid,
    pub is_new: bool,
    pub deleted: bool,
    #[serde(default)]
    pub forced: bool,
    pub properties: Vec<PropertySnapshot>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<String, SlotSnapshot>,
}

/// Live and tombstoned members of one slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlotSnapshot {
    #[serde(default)]
    pub live: Vec<EntitySnapshot>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tombstones: Vec<EntitySnapshot>,
}

impl Entity {
    /// Capture this node and its subtree.
    pub fn to_snapshot(&self) -> EntitySnapshot {
        let (is_new, deleted, forced, properties) = {
            let core = self.inner.core.lock();
            (core.is_new, core.deleted, core.forced, core.properties.snapshot())
        };

        let children = self
            .slot_lists()
            .iter()
            .map(|list| {
                let slot = SlotSnapshot {
                    live: list.items().iter().map(Entity::to_snapshot).collect(),
                    tombstones: list.tombstones().iter().map(Entity::to_snapshot).collect(),
                };
                (list.name().to_string(), slot)
            })
            .filter(|(_, slot)| !slot.live.is_empty() || !slot.tombstones.is_empty())
            .collect();

        EntitySnapshot {
            entity_type: self.entity_type().to_string(),
            id: self.id(),
            is_new,
            deleted,
            forced,
            properties,
            children,
        }
    }
}

impl EntitySchema {
    /// Rebuild a graph from a snapshot, then run every rule once.
    pub fn from_snapshot(&self, snapshot: &EntitySnapshot) -> Result<Entity> {
        let entity = restore(self, snapshot)?;
        state::refresh_subtree(&entity);
        entity.check_rules_deep();
        debug!(entity = %entity.id(), entity_type = %self.name(), "Restored entity from snapshot");
        Ok(entity)
    }
}

fn restore(schema: &EntitySchema, snapshot: &EntitySnapshot) -> Result<Entity> {
    if snapshot.entity_type != schema.name() {
        return Err(TrellisError::schema_mismatch(schema.name(), &snapshot.entity_type));
    }

    let entity = Entity::with_id(schema.clone(), snapshot.is_new, snapshot.id);
    {
        let mut core = entity.inner.core.lock();
        core.deleted = snapshot.deleted;
        core.forced = snapshot.forced;
        core.properties.restore(&snapshot.properties);
    }

    for (slot, contents) in &snapshot.children {
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

        for child in &contents.live {
            list.attach_loaded(&restore(&def.schema, child)?, &entity);
        }
        for child in &contents.tombstones {
            list.attach_tombstone(&restore(&def.schema, child)?, &entity);
        }
    }
    Ok(entity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::PersistedState;
    use serde_json::json;

    fn order_schema() -> EntitySchema {
        let line = EntitySchema::builder("Line").property("sku").build().unwrap();
        EntitySchema::builder("Order")
            .property("number")
            .list("lines", &line)
            .build()
            .unwrap()
    }

    #[test]
    fn test_snapshot_preserves_edits_and_tombstones() {
        let schema = order_schema();
        let mut persisted = PersistedState::new().with_value("number", "A-1");
        persisted.children.insert(
            "lines".into(),
            crate::persistence::PersistedChild::List(vec![
                PersistedState::new().with_value("sku", "X"),
                PersistedState::new().with_value("sku", "Y"),
            ]),
        );
        let order = schema.fetch(&persisted).unwrap();
        order.set("number", "A-2").unwrap();
        let lines = order.list("lines").unwrap();
        let first = lines.first().unwrap();
        lines.remove(&first).unwrap();

        let snapshot = order.to_snapshot();
        let text = serde_json::to_string(&snapshot).unwrap();
        let decoded: EntitySnapshot = serde_json::from_str(&text).unwrap();

        let copy = schema.from_snapshot(&decoded).unwrap();
        assert_eq!(copy.id(), order.id());
        assert_eq!(copy.get("number").unwrap(), json!("A-2"));
        assert!(copy.is_property_modified("number"));
        assert!(!copy.is_new());

        let copy_lines = copy.list("lines").unwrap();
        assert_eq!(copy_lines.len(), 1);
        assert_eq!(copy_lines.tombstones().len(), 1);
        assert!(copy_lines.tombstones()[0].is_deleted());
        assert!(copy.is_modified());
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let schema = order_schema();
        let mut snapshot = schema.create().to_snapshot();
        snapshot.entity_type = "Invoice".into();
        assert!(schema.from_snapshot(&snapshot).is_err());
    }
}
