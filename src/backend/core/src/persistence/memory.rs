//! In-memory persistence hooks.
//!
//! Rows are keyed by entity type and an integer key generated on insert and
//! stored under a configurable key property. Every call is logged, and
//! failures can be injected per operation and entity type, which makes this
//! store the workhorse of the save tests.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::entity::Entity;
use crate::error::BoxError;
use crate::property::PropertyValue;

use super::hooks::{HookContext, PersistenceHooks};
use super::state::PersistedState;

const DEFAULT_KEY_PROPERTY: &str = "id";

/// Hook operation recorded in the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HookOp {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for HookOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        })
    }
}

/// One hook invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HookCall {
    pub op: HookOp,
    pub entity_type: String,
    pub key: Option<u64>,
    /// Modified property names passed to `update`; empty otherwise.
    pub modified: Vec<String>,
    /// Key of the parent as persisted earlier in the same save.
    pub parent_key: Option<u64>,
    pub at: DateTime<Utc>,
}

/// A stored row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRow {
    pub values: BTreeMap<String, PropertyValue>,
    pub parent_key: Option<u64>,
    pub updated_at: DateTime<Utc>,
}

/// Injected hook failure.
#[derive(Debug, thiserror::Error)]
#[error("injected {op} failure for {entity_type}")]
pub struct InjectedFailure {
    pub op: HookOp,
    pub entity_type: String,
}

/// The row an update or delete targeted does not exist.
#[derive(Debug, thiserror::Error)]
#[error("no {entity_type} row with key {key:?}")]
pub struct MissingRow {
    pub entity_type: String,
    pub key: Option<u64>,
}

#[derive(Default)]
struct StoreState {
    rows: BTreeMap<(String, u64), StoredRow>,
    calls: Vec<HookCall>,
    failures: HashSet<(HookOp, String)>,
}

/// [`PersistenceHooks`] backed by a map.
pub struct InMemoryStore {
    key_property: String,
    next_key: AtomicU64,
    state: Mutex<StoreState>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_key_property(DEFAULT_KEY_PROPERTY)
    }

    /// Store generated keys under `name` instead of `"id"`.
    pub fn with_key_property(name: impl Into<String>) -> Self {
        Self {
            key_property: name.into(),
            next_key: AtomicU64::new(1),
            state: Mutex::new(StoreState::default()),
        }
    }

    pub fn key_property(&self) -> &str {
        &self.key_property
    }

    /// Make every `op` on `entity_type` fail until cleared.
    pub fn fail_on(&self, op: HookOp, entity_type: impl Into<String>) {
        self.state.lock().failures.insert((op, entity_type.into()));
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    pub fn calls(&self) -> Vec<HookCall> {
        self.state.lock().calls.clone()
    }

    pub fn calls_for(&self, op: HookOp) -> Vec<HookCall> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.op == op)
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn row(&self, entity_type: &str, key: u64) -> Option<StoredRow> {
        self.state
            .lock()
            .rows
            .get(&(entity_type.to_string(), key))
            .cloned()
    }

    pub fn row_count(&self, entity_type: &str) -> usize {
        self.state
            .lock()
            .rows
            .keys()
            .filter(|(t, _)| t == entity_type)
            .count()
    }

    /// Key held by a node or a persisted state, if any.
    pub fn key_of(&self, values: &BTreeMap<String, PropertyValue>) -> Option<u64> {
        values.get(&self.key_property).and_then(PropertyValue::as_u64)
    }

    fn record(
        &self,
        state: &mut StoreState,
        op: HookOp,
        node: &Entity,
        key: Option<u64>,
        modified: &[String],
        ctx: HookContext<'_>,
    ) -> Result<(), BoxError> {
        let entity_type = node.entity_type().to_string();
        state.calls.push(HookCall {
            op,
            entity_type: entity_type.clone(),
            key,
            modified: modified.to_vec(),
            parent_key: ctx.parent.and_then(|p| self.key_of(&p.values)),
            at: Utc::now(),
        });
        if state.failures.contains(&(op, entity_type.clone())) {
            return Err(Box::new(InjectedFailure { op, entity_type }));
        }
        Ok(())
    }
}

#[async_trait]
impl PersistenceHooks for InMemoryStore {
    async fn insert(&self, node: &Entity, ctx: HookContext<'_>) -> Result<PersistedState, BoxError> {
        let mut values = node.values();
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);

        let mut state = self.state.lock();
        self.record(&mut state, HookOp::Insert, node, Some(key), &[], ctx)?;

        if node.schema().has_property(&self.key_property) {
            values.insert(self.key_property.clone(), PropertyValue::from(key));
        }
        let parent_key = ctx.parent.and_then(|p| self.key_of(&p.values));
        state.rows.insert(
            (node.entity_type().to_string(), key),
            StoredRow {
                values: values.clone(),
                parent_key,
                updated_at: Utc::now(),
            },
        );
        debug!(entity_type = %node.entity_type(), key, "Inserted row");

        Ok(PersistedState {
            values,
            children: BTreeMap::new(),
        })
    }

    async fn update(
        &self,
        node: &Entity,
        modified: &[String],
        ctx: HookContext<'_>,
    ) -> Result<PersistedState, BoxError> {
        let values = node.values();
        let key = self.key_of(&values);
        let parent_key = ctx.parent.and_then(|p| self.key_of(&p.values));

        let mut state = self.state.lock();
        self.record(&mut state, HookOp::Update, node, key, modified, ctx)?;

        if let Some(key) = key {
            let row = state
                .rows
                .get_mut(&(node.entity_type().to_string(), key))
                .ok_or_else(|| MissingRow {
                    entity_type: node.entity_type().to_string(),
                    key: Some(key),
                })?;
            row.values = values.clone();
            row.parent_key = parent_key;
            row.updated_at = Utc::now();
        }
        debug!(entity_type = %node.entity_type(), key, modified = modified.len(), "Updated row");

        Ok(PersistedState {
            values,
            children: BTreeMap::new(),
        })
    }

    async fn delete(&self, node: &Entity, ctx: HookContext<'_>) -> Result<(), BoxError> {
        let key = self.key_of(&node.values());

        let mut state = self.state.lock();
        self.record(&mut state, HookOp::Delete, node, key, &[], ctx)?;

        if let Some(key) = key {
            state.rows.remove(&(node.entity_type().to_string(), key));
        }
        debug!(entity_type = %node.entity_type(), key, "Deleted row");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntitySchema;

    fn person() -> EntitySchema {
        EntitySchema::builder("Person")
            .properties(["id", "name"])
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_insert_assigns_key() {
        let store = InMemoryStore::new();
        let node = person().create();
        node.set("name", "Ada").unwrap();

        let saved = store.insert(&node, HookContext::root()).await.unwrap();
        assert_eq!(saved.value("id"), Some(&PropertyValue::from(1u64)));
        assert_eq!(store.row_count("Person"), 1);
        assert_eq!(store.calls_for(HookOp::Insert).len(), 1);
    }

    #[tokio::test]
    async fn test_injected_failure_is_logged() {
        let store = InMemoryStore::new();
        store.fail_on(HookOp::Insert, "Person");
        let node = person().create();

        let err = store.insert(&node, HookContext::root()).await.unwrap_err();
        assert!(err.to_string().contains("injected insert failure"));
        assert_eq!(store.calls().len(), 1);
        assert_eq!(store.row_count("Person"), 0);
    }

    #[tokio::test]
    async fn test_update_missing_row_fails() {
        let store = InMemoryStore::new();
        let node = person().create();
        node.set("id", 42).unwrap();

        let err = store
            .update(&node, &["name".to_string()], HookContext::root())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no Person row"));
    }
}
