//! Change notifications published by entities.

use serde::Serialize;
use uuid::Uuid;

use crate::aggregate::EntityState;
use crate::property::PropertyValue;

/// A change on one entity.
///
/// Events are broadcast on a bounded channel; slow subscribers observe
/// `RecvError::Lagged` rather than blocking writers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntityEvent {
    /// A write outside a paused scope changed a property.
    PropertyChanged {
        entity: Uuid,
        property: String,
        old: PropertyValue,
        new: PropertyValue,
    },
    /// A paused scope ended after writing these properties.
    BatchChanged { entity: Uuid, properties: Vec<String> },
    /// Cached self or aggregate state changed.
    StateChanged { entity: Uuid, state: EntityState },
    /// A child slot gained, lost, or tombstoned a member.
    ChildrenChanged { entity: Uuid, slot: String },
}

impl EntityEvent {
    pub fn entity_id(&self) -> Uuid {
        match self {
            Self::PropertyChanged { entity, .. }
            | Self::BatchChanged { entity, .. }
            | Self::StateChanged { entity, .. }
            | Self::ChildrenChanged { entity, .. } => *entity,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::PropertyChanged { .. } => "property_changed",
            Self::BatchChanged { .. } => "batch_changed",
            Self::StateChanged { .. } => "state_changed",
            Self::ChildrenChanged { .. } => "children_changed",
        }
    }
}
