//! Entity types: property declarations, type rules, and child slots.

use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::config::EngineConfig;
use crate::entity::Entity;
use crate::error::{Result, TrellisError};
use crate::property::PropertyDef;
use crate::rules::{DependencyGraph, RuleRegistration, RuleRegistry, RuleScope, ShapeConstraint};

/// Cardinality of a child slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    /// At most one child
    Single,
    /// Ordered collection with a tombstone list
    List,
}

/// A named child slot on an entity type.
#[derive(Debug, Clone)]
pub struct ChildSlotDef {
    pub name: String,
    pub kind: SlotKind,
    pub schema: EntitySchema,
}

/// An entity type. Cheap to clone.
#[derive(Clone)]
pub struct EntitySchema {
    inner: Arc<SchemaInner>,
}

struct SchemaInner {
    name: String,
    properties: Vec<PropertyDef>,
    rules: RuleRegistry,
    slots: Vec<ChildSlotDef>,
    config: Arc<EngineConfig>,
    cycles: Vec<Vec<String>>,
}

impl fmt::Debug for EntitySchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntitySchema")
            .field("name", &self.inner.name)
            .field("properties", &self.inner.properties.len())
            .field("rules", &self.inner.rules.len())
            .field("slots", &self.inner.slots)
            .finish()
    }
}

impl EntitySchema {
    pub fn builder(name: impl Into<String>) -> EntitySchemaBuilder {
        EntitySchemaBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn properties(&self) -> &[PropertyDef] {
        &self.inner.properties
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.inner.properties.iter().any(|p| p.name == name)
    }

    pub fn rules(&self) -> &RuleRegistry {
        &self.inner.rules
    }

    pub fn slots(&self) -> &[ChildSlotDef] {
        &self.inner.slots
    }

    pub fn slot(&self, name: &str) -> Option<&ChildSlotDef> {
        self.inner.slots.iter().find(|s| s.name == name)
    }

    pub(crate) fn slot_index(&self, name: &str) -> Option<usize> {
        self.inner.slots.iter().position(|s| s.name == name)
    }

    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.inner.config
    }

    /// Cascade cycles among this type's rules (A writes B, B writes A).
    pub fn dependency_cycles(&self) -> &[Vec<String>] {
        &self.inner.cycles
    }

    /// Check that every property a rule references is declared.
    pub(crate) fn check_rule(&self, rule: &RuleRegistration) -> Result<()> {
        for name in rule.referenced() {
            if !self.has_property(name) {
                return Err(TrellisError::property_not_found(self.name(), name));
            }
        }
        Ok(())
    }

    /// Create a new entity: defaults applied, flagged `new`.
    pub fn create(&self) -> Entity {
        let entity = self.create_unchecked();
        if self.inner.config.check_rules_on_create {
            entity.check_rules();
        }
        entity
    }

    /// New node with no initial rule pass.
    pub(crate) fn create_unchecked(&self) -> Entity {
        Entity::new(self.clone(), true)
    }

    pub(crate) fn same_type(&self, other: &EntitySchema) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) || self.inner.name == other.inner.name
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Builder
// ═══════════════════════════════════════════════════════════════════════════════

/// Builder for [`EntitySchema`].
pub struct EntitySchemaBuilder {
    name: String,
    properties: Vec<PropertyDef>,
    rules: Vec<RuleRegistration>,
    slots: Vec<ChildSlotDef>,
    config: Option<Arc<EngineConfig>>,
}

impl EntitySchemaBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Vec::new(),
            rules: Vec::new(),
            slots: Vec::new(),
            config: None,
        }
    }

    pub fn property(mut self, def: impl Into<PropertyDef>) -> Self {
        self.properties.push(def.into());
        self
    }

    pub fn properties<I, D>(mut self, defs: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<PropertyDef>,
    {
        self.properties.extend(defs.into_iter().map(Into::into));
        self
    }

    pub fn rule(mut self, rule: RuleRegistration) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn shape(self, property: impl Into<String>, constraint: ShapeConstraint) -> Self {
        self.rule(RuleRegistration::shape(property, constraint))
    }

    /// Add an ordered child collection.
    pub fn list(mut self, name: impl Into<String>, schema: &EntitySchema) -> Self {
        self.slots.push(ChildSlotDef {
            name: name.into(),
            kind: SlotKind::List,
            schema: schema.clone(),
        });
        self
    }

    /// Add a single-child slot.
    pub fn child(mut self, name: impl Into<String>, schema: &EntitySchema) -> Self {
        self.slots.push(ChildSlotDef {
            name: name.into(),
            kind: SlotKind::Single,
            schema: schema.clone(),
        });
        self
    }

    pub fn config(mut self, config: Arc<EngineConfig>) -> Self {
        self.config = Some(config);
        self
    }

    pub fn build(self) -> Result<EntitySchema> {
        for (i, def) in self.properties.iter().enumerate() {
            if self.properties[..i].iter().any(|p| p.name == def.name) {
                return Err(TrellisError::configuration(format!(
                    "property '{}' is declared twice on '{}'",
                    def.name, self.name
                )));
            }
        }
        for (i, slot) in self.slots.iter().enumerate() {
            if self.slots[..i].iter().any(|s| s.name == slot.name) {
                return Err(TrellisError::configuration(format!(
                    "child slot '{}' is declared twice on '{}'",
                    slot.name, self.name
                )));
            }
        }

        let cycles = DependencyGraph::from_rules(&self.rules).cycles();
        for cycle in &cycles {
            warn!(
                entity_type = %self.name,
                properties = ?cycle,
                "Rule cascade cycle; rules in it must break the loop with a silent load"
            );
        }

        let config = self
            .config
            .unwrap_or_else(|| Arc::new(EngineConfig::default()));

        let mut schema = SchemaInner {
            name: self.name,
            properties: self.properties,
            rules: RuleRegistry::new(RuleScope::Type),
            slots: self.slots,
            config,
            cycles,
        };

        for rule in self.rules {
            for name in rule.referenced() {
                if !schema.properties.iter().any(|p| &p.name == name) {
                    return Err(TrellisError::property_not_found(&schema.name, name));
                }
            }
            schema.rules.register(rule);
        }

        Ok(EntitySchema {
            inner: Arc::new(schema),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::rules::RuleKind;

    fn noop(name: &str, from: &str, to: &str) -> RuleRegistration {
        RuleRegistration::from_fn(name, RuleKind::Derivation, |_| Ok(()))
            .triggered_by([from])
            .writes([to])
    }

    #[test]
    fn test_build_rejects_unknown_trigger() {
        let err = EntitySchema::builder("Person")
            .property("first")
            .rule(noop("r", "missing", "first"))
            .build()
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::PropertyNotFound);
    }

    #[test]
    fn test_build_rejects_duplicate_property() {
        let err = EntitySchema::builder("Person")
            .properties(["first", "first"])
            .build()
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConfigurationError);
    }

    #[test]
    fn test_cycles_are_reported_not_rejected() {
        let schema = EntitySchema::builder("Pair")
            .properties(["a", "b"])
            .rule(noop("a_to_b", "a", "b"))
            .rule(noop("b_to_a", "b", "a"))
            .build()
            .unwrap();
        assert_eq!(schema.dependency_cycles().len(), 1);
    }

    #[test]
    fn test_slots() {
        let line = EntitySchema::builder("Line").property("qty").build().unwrap();
        let order = EntitySchema::builder("Order")
            .property("number")
            .list("lines", &line)
            .child("address", &line)
            .build()
            .unwrap();
        assert_eq!(order.slot("lines").map(|s| s.kind), Some(SlotKind::List));
        assert_eq!(order.slot_index("address"), Some(1));
        assert!(order.slot("missing").is_none());
    }
}
