//! The per-entity property store.
//!
//! The store is plain data: it never schedules rules or emits notifications.
//! The entity node wraps every mutation and decides what to trigger.
//!
//! Invariant: a property is modified iff its current value differs from its
//! committed value, or it was force-marked.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::message::RuleMessage;
use super::value::{PropertyDef, PropertyValue};

/// State of a single property.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyState {
    name: String,
    value: PropertyValue,
    committed: PropertyValue,
    forced: bool,
    busy: u32,
    messages: Vec<RuleMessage>,
}

impl PropertyState {
    fn new(def: &PropertyDef) -> Self {
        Self {
            name: def.name.clone(),
            value: def.default.clone(),
            committed: def.default.clone(),
            forced: false,
            busy: 0,
            messages: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &PropertyValue {
        &self.value
    }

    pub fn committed(&self) -> &PropertyValue {
        &self.committed
    }

    pub fn is_modified(&self) -> bool {
        self.forced || self.value != self.committed
    }

    pub fn is_busy(&self) -> bool {
        self.busy > 0
    }

    pub fn busy_count(&self) -> u32 {
        self.busy
    }

    pub fn messages(&self) -> &[RuleMessage] {
        &self.messages
    }

    pub fn has_errors(&self) -> bool {
        self.messages.iter().any(RuleMessage::is_error)
    }
}

/// Transferable view of one property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySnapshot {
    pub name: String,
    pub value: PropertyValue,
    pub committed: PropertyValue,
    #[serde(default)]
    pub forced: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<RuleMessage>,
}

/// Mapping from property name to value, change flags, and messages.
///
/// Properties keep their declaration order.
#[derive(Debug, Clone, Default)]
pub struct PropertyStore {
    entries: Vec<PropertyState>,
    index: HashMap<String, usize>,
}

impl PropertyStore {
    /// Create a store from property declarations.
    pub fn new(defs: &[PropertyDef]) -> Self {
        let mut store = Self::default();
        for def in defs {
            if store.index.contains_key(&def.name) {
                continue;
            }
            store.index.insert(def.name.clone(), store.entries.len());
            store.entries.push(PropertyState::new(def));
        }
        store
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|p| p.name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &PropertyState> {
        self.entries.iter()
    }

    pub fn get(&self, name: &str) -> Option<&PropertyState> {
        self.index.get(name).map(|&i| &self.entries[i])
    }

    fn get_mut(&mut self, name: &str) -> Option<&mut PropertyState> {
        match self.index.get(name) {
            Some(&i) => Some(&mut self.entries[i]),
            None => None,
        }
    }

    /// Current value of a property.
    pub fn read(&self, name: &str) -> Option<&PropertyValue> {
        self.get(name).map(|p| &p.value)
    }

    /// Set the current value. Returns `Some(true)` when the value changed,
    /// `Some(false)` when it was equal, `None` when the property is unknown.
    pub fn write(&mut self, name: &str, value: PropertyValue) -> Option<bool> {
        let prop = self.get_mut(name)?;
        if prop.value == value {
            return Some(false);
        }
        prop.value = value;
        Some(true)
    }

    /// Silent set: updates current and committed value and clears the
    /// modified state of this property.
    pub fn load(&mut self, name: &str, value: PropertyValue) -> bool {
        match self.get_mut(name) {
            Some(prop) => {
                prop.committed = value.clone();
                prop.value = value;
                prop.forced = false;
                true
            }
            None => false,
        }
    }

    /// Mark one property, or all of them, modified without changing values.
    pub fn force_modify(&mut self, name: Option<&str>) -> bool {
        match name {
            Some(name) => match self.get_mut(name) {
                Some(prop) => {
                    prop.forced = true;
                    true
                }
                None => false,
            },
            None => {
                for prop in &mut self.entries {
                    prop.forced = true;
                }
                true
            }
        }
    }

    pub fn is_modified(&self, name: &str) -> bool {
        self.get(name).map(PropertyState::is_modified).unwrap_or(false)
    }

    pub fn any_modified(&self) -> bool {
        self.entries.iter().any(PropertyState::is_modified)
    }

    /// Names of modified properties, in declaration order.
    pub fn modified_names(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|p| p.is_modified())
            .map(|p| p.name.clone())
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Busy counters
    // ─────────────────────────────────────────────────────────────────────────

    pub fn increment_busy(&mut self, names: &[String]) {
        for name in names {
            if let Some(prop) = self.get_mut(name) {
                prop.busy += 1;
            }
        }
    }

    pub fn decrement_busy(&mut self, names: &[String]) {
        for name in names {
            if let Some(prop) = self.get_mut(name) {
                prop.busy = prop.busy.saturating_sub(1);
            }
        }
    }

    pub fn is_busy(&self, name: &str) -> bool {
        self.get(name).map(PropertyState::is_busy).unwrap_or(false)
    }

    pub fn any_busy(&self) -> bool {
        self.entries.iter().any(PropertyState::is_busy)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Messages
    // ─────────────────────────────────────────────────────────────────────────

    /// Replace every message previously produced by `rule` with `messages`.
    ///
    /// Messages targeting unknown properties are dropped.
    pub fn replace_rule_messages(&mut self, rule: &str, messages: Vec<RuleMessage>) {
        for prop in &mut self.entries {
            prop.messages.retain(|m| m.rule != rule);
        }
        for message in messages {
            if let Some(prop) = self.get_mut(&message.property) {
                prop.messages.push(message);
            }
        }
    }

    /// Set `message` as the only message its rule holds on its property.
    /// Messages from the same rule on other properties are kept.
    pub fn set_message(&mut self, message: RuleMessage) {
        if let Some(prop) = self.get_mut(&message.property) {
            prop.messages.retain(|m| m.rule != message.rule);
            prop.messages.push(message);
        }
    }

    pub fn messages(&self, name: &str) -> &[RuleMessage] {
        self.get(name).map(PropertyState::messages).unwrap_or(&[])
    }

    /// All messages, in property declaration order.
    pub fn all_messages(&self) -> Vec<RuleMessage> {
        self.entries
            .iter()
            .flat_map(|p| p.messages.iter().cloned())
            .collect()
    }

    pub fn has_errors(&self) -> bool {
        self.entries.iter().any(PropertyState::has_errors)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Transfer
    // ─────────────────────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> Vec<PropertySnapshot> {
        self.entries
            .iter()
            .map(|p| PropertySnapshot {
                name: p.name.clone(),
                value: p.value.clone(),
                committed: p.committed.clone(),
                forced: p.forced,
                messages: p.messages.clone(),
            })
            .collect()
    }

    /// Restore values, committed values, and force marks. Busy counters are
    /// process-local and stay untouched; messages are recomputed by rules.
    pub fn restore(&mut self, snapshot: &[PropertySnapshot]) {
        for entry in snapshot {
            if let Some(prop) = self.get_mut(&entry.name) {
                prop.value = entry.value.clone();
                prop.committed = entry.committed.clone();
                prop.forced = entry.forced;
            }
        }
    }

    /// Current values keyed by name.
    pub fn values(&self) -> HashMap<String, PropertyValue> {
        self.entries
            .iter()
            .map(|p| (p.name.clone(), p.value.clone()))
            .collect()
    }
}
