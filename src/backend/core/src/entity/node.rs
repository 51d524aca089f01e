//! The entity node: one property store, its rules, lifecycle flags, and its
//! place in an aggregate.
//!
//! # Locking
//!
//! Each node has a core mutex (properties, lifecycle, rule bookkeeping), a
//! links lock (parent back-reference), a status lock (cached state), and one
//! lock per child slot. Locks are taken ancestor before descendant, status
//! before core, and no lock is held while rules run or while a parent is
//! refreshed.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::aggregate::{state, EntityList, EntityState, NodeState};
use crate::error::{NotSavableReason, Result, TrellisError};
use crate::property::{
    from_value, to_value, PropertyStore, PropertyValue, RuleMessage,
};
use crate::rules::{engine, PendingTracker, RuleId, RuleRegistration, RuleRegistry, RuleScope};

use super::events::EntityEvent;
use super::schema::{EntitySchema, SlotKind};

// ═══════════════════════════════════════════════════════════════════════════════
// Internal State
// ═══════════════════════════════════════════════════════════════════════════════

pub(crate) struct EntityInner {
    pub(crate) id: Uuid,
    pub(crate) schema: EntitySchema,
    pub(crate) core: Mutex<EntityCore>,
    pub(crate) links: RwLock<Links>,
    /// One list per schema slot, in schema order
    pub(crate) slots: Vec<EntityList>,
    pub(crate) status: RwLock<EntityState>,
    pub(crate) events: broadcast::Sender<EntityEvent>,
    pub(crate) pending: Arc<PendingTracker>,
}

pub(crate) struct EntityCore {
    pub(crate) properties: PropertyStore,
    pub(crate) is_new: bool,
    pub(crate) deleted: bool,
    /// Entity-level force mark (moves, `force_modify(None)`)
    pub(crate) forced: bool,
    /// Set by a cancelled wait; cleared by a full rule run
    pub(crate) indeterminate: bool,
    pub(crate) pause_depth: usize,
    /// Properties written while paused, in first-write order
    pub(crate) deferred: Vec<String>,
    pub(crate) cascade_depth: usize,
    pub(crate) instance_rules: RuleRegistry,
    pub(crate) generations: HashMap<RuleId, u64>,
    pub(crate) running: HashMap<RuleId, CancellationToken>,
}

#[derive(Default)]
pub(crate) struct Links {
    pub(crate) parent: Option<Weak<EntityInner>>,
    pub(crate) slot: Option<String>,
    pub(crate) child_of_collection: bool,
    /// Purged after a deletion was persisted; can no longer be attached
    pub(crate) disposed: bool,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Entity Handle
// ═══════════════════════════════════════════════════════════════════════════════

/// Shared handle to an entity node. Clones refer to the same node.
#[derive(Clone)]
pub struct Entity {
    pub(crate) inner: Arc<EntityInner>,
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Entity {}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("type", &self.entity_type())
            .field("id", &self.inner.id)
            .finish()
    }
}

impl Entity {
    pub(crate) fn new(schema: EntitySchema, is_new: bool) -> Self {
        Self::with_id(schema, is_new, Uuid::new_v4())
    }

    pub(crate) fn with_id(schema: EntitySchema, is_new: bool, id: Uuid) -> Self {
        let (events, _) = broadcast::channel(schema.config().event_buffer.max(1));
        let properties = PropertyStore::new(schema.properties());

        let inner = Arc::new_cyclic(|weak: &Weak<EntityInner>| {
            let slots = schema
                .slots()
                .iter()
                .map(|def| EntityList::new(def.name.clone(), def.kind, def.schema.clone(), weak.clone()))
                .collect();

            EntityInner {
                id,
                schema: schema.clone(),
                core: Mutex::new(EntityCore {
                    properties,
                    is_new,
                    deleted: false,
                    forced: false,
                    indeterminate: false,
                    pause_depth: 0,
                    deferred: Vec::new(),
                    cascade_depth: 0,
                    instance_rules: RuleRegistry::new(RuleScope::Instance),
                    generations: HashMap::new(),
                    running: HashMap::new(),
                }),
                links: RwLock::new(Links::default()),
                slots,
                status: RwLock::new(EntityState::default()),
                events,
                pending: Arc::new(PendingTracker::new()),
            }
        });

        let entity = Self { inner };
        state::refresh(&entity);
        entity
    }

    pub(crate) fn from_inner(inner: Arc<EntityInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<EntityInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn entity_type(&self) -> &str {
        self.inner.schema.name()
    }

    pub fn schema(&self) -> &EntitySchema {
        &self.inner.schema
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Property Access
    // ─────────────────────────────────────────────────────────────────────────

    /// Current value of a property.
    pub fn get(&self, name: &str) -> Result<PropertyValue> {
        self.inner
            .core
            .lock()
            .properties
            .read(name)
            .cloned()
            .ok_or_else(|| TrellisError::property_not_found(self.entity_type(), name))
    }

    pub fn get_as<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        from_value(name, self.get(name)?)
    }

    /// Write a property through the rule-scheduling path.
    ///
    /// Returns whether the value changed. Outside a paused scope, dependent
    /// synchronous rules have run and asynchronous ones have been started
    /// before this returns.
    pub fn write(&self, name: &str, value: PropertyValue) -> Result<bool> {
        engine::write(self, name, value)
    }

    /// Typed [`write`](Self::write).
    pub fn set<T: Serialize>(&self, name: &str, value: T) -> Result<bool> {
        self.write(name, to_value(value)?)
    }

    /// Silent set: current and committed value, no modified flag, no rules,
    /// no notification.
    pub fn load(&self, name: &str, value: PropertyValue) -> Result<()> {
        let loaded = self.inner.core.lock().properties.load(name, value);
        if !loaded {
            return Err(TrellisError::property_not_found(self.entity_type(), name));
        }
        state::refresh(self);
        Ok(())
    }

    /// Mark one property, or the whole entity, modified without changing
    /// any value.
    pub fn force_modify(&self, name: Option<&str>) -> Result<()> {
        {
            let mut core = self.inner.core.lock();
            match name {
                Some(name) => {
                    if !core.properties.force_modify(Some(name)) {
                        return Err(TrellisError::property_not_found(self.entity_type(), name));
                    }
                }
                None => {
                    core.properties.force_modify(None);
                    core.forced = true;
                }
            }
        }
        state::refresh(self);
        Ok(())
    }

    pub fn is_property_modified(&self, name: &str) -> bool {
        self.inner.core.lock().properties.is_modified(name)
    }

    pub fn is_property_busy(&self, name: &str) -> bool {
        self.inner.core.lock().properties.is_busy(name)
    }

    /// Names of modified properties, in declaration order.
    pub fn modified_properties(&self) -> Vec<String> {
        self.inner.core.lock().properties.modified_names()
    }

    /// Messages on one property.
    pub fn messages_for(&self, name: &str) -> Vec<RuleMessage> {
        self.inner.core.lock().properties.messages(name).to_vec()
    }

    /// All messages on this entity.
    pub fn messages(&self) -> Vec<RuleMessage> {
        self.inner.core.lock().properties.all_messages()
    }

    /// Error-severity messages across the whole aggregate below this node.
    pub fn broken_rules(&self) -> Vec<RuleMessage> {
        let mut out: Vec<RuleMessage> = self
            .messages()
            .into_iter()
            .filter(RuleMessage::is_error)
            .collect();
        for child in self.children() {
            out.extend(child.broken_rules());
        }
        out
    }

    /// Current values keyed by name.
    pub fn values(&self) -> BTreeMap<String, PropertyValue> {
        self.inner
            .core
            .lock()
            .properties
            .iter()
            .map(|p| (p.name().to_string(), p.value().clone()))
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    pub fn is_new(&self) -> bool {
        self.inner.core.lock().is_new
    }

    pub fn is_deleted(&self) -> bool {
        self.inner.core.lock().deleted
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.links.read().disposed
    }

    /// Mark for deletion. On a live collection member this is `remove` on
    /// the owning collection. Idempotent.
    pub fn delete(&self) -> Result<()> {
        if let Some(list) = self.owning_list() {
            if list.contains(self) {
                list.remove(self)?;
                return Ok(());
            }
        }

        let changed = {
            let mut core = self.inner.core.lock();
            let changed = !core.deleted;
            core.deleted = true;
            changed
        };
        if changed {
            debug!(entity = %self.id(), entity_type = %self.entity_type(), "Entity deleted");
            state::refresh(self);
        }
        Ok(())
    }

    /// Clear the deletion mark. A tombstoned collection member goes back to
    /// the live list. No-op when not deleted.
    pub fn undelete(&self) -> Result<()> {
        if !self.is_deleted() {
            return Ok(());
        }

        if let Some(list) = self.owning_list() {
            if list.is_tombstoned(self) {
                return list.restore(self);
            }
        }

        self.inner.core.lock().deleted = false;
        state::refresh(self);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Derived State
    // ─────────────────────────────────────────────────────────────────────────

    /// State computed from this node's own store, never cached.
    pub fn self_state(&self) -> NodeState {
        state::self_state(self)
    }

    pub fn is_self_valid(&self) -> bool {
        self.self_state().valid
    }

    pub fn is_self_modified(&self) -> bool {
        self.self_state().modified
    }

    pub fn is_self_busy(&self) -> bool {
        self.self_state().busy
    }

    /// Aggregate state: this node combined with its live descendants.
    pub fn aggregate_state(&self) -> NodeState {
        state::aggregate_state(self)
    }

    /// Self and aggregate state together.
    pub fn state(&self) -> EntityState {
        EntityState {
            own: self.self_state(),
            aggregate: self.aggregate_state(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.aggregate_state().valid
    }

    pub fn is_modified(&self) -> bool {
        self.aggregate_state().modified
    }

    pub fn is_busy(&self) -> bool {
        self.aggregate_state().busy
    }

    /// True after a cancelled wait until rules are re-run in full.
    pub fn is_indeterminate(&self) -> bool {
        self.aggregate_state().indeterminate
    }

    /// Failed conjuncts of the save gate; empty when savable.
    pub fn savable_reasons(&self) -> Vec<NotSavableReason> {
        let agg = self.aggregate_state();
        let mut reasons = Vec::new();
        if !agg.modified {
            reasons.push(NotSavableReason::NotModified);
        }
        if !agg.valid {
            reasons.push(NotSavableReason::Invalid);
        }
        if agg.indeterminate {
            reasons.push(NotSavableReason::Indeterminate);
        }
        if agg.busy {
            reasons.push(NotSavableReason::Busy);
        }
        if self.has_parent() {
            reasons.push(NotSavableReason::IsChild);
        }
        reasons
    }

    pub fn is_savable(&self) -> bool {
        self.savable_reasons().is_empty()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Ownership
    // ─────────────────────────────────────────────────────────────────────────

    pub fn parent(&self) -> Option<Entity> {
        self.inner
            .links
            .read()
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
            .map(Entity::from_inner)
    }

    pub(crate) fn has_parent(&self) -> bool {
        self.parent().is_some()
    }

    /// Top of the parent chain, or `None` when this node has no parent.
    pub fn root(&self) -> Option<Entity> {
        let mut current = self.parent()?;
        while let Some(parent) = current.parent() {
            current = parent;
        }
        Some(current)
    }

    /// The node identifying this node's aggregate: `root()` or itself.
    pub fn aggregate_root(&self) -> Entity {
        self.root().unwrap_or_else(|| self.clone())
    }

    /// Whether `self` is a strict ancestor of `other`.
    pub fn is_ancestor_of(&self, other: &Entity) -> bool {
        let mut current = other.parent();
        while let Some(node) = current {
            if node == *self {
                return true;
            }
            current = node.parent();
        }
        false
    }

    pub fn is_child_of_collection(&self) -> bool {
        self.inner.links.read().child_of_collection
    }

    /// Slot name under the parent, if attached.
    pub fn slot_name(&self) -> Option<String> {
        self.inner.links.read().slot.clone()
    }

    pub(crate) fn owning_list(&self) -> Option<EntityList> {
        let (parent, slot) = {
            let links = self.inner.links.read();
            (links.parent.as_ref().and_then(Weak::upgrade), links.slot.clone())
        };
        let parent = Entity::from_inner(parent?);
        parent.slot_list(&slot?)
    }

    pub(crate) fn slot_list(&self, name: &str) -> Option<EntityList> {
        let index = self.inner.schema.slot_index(name)?;
        self.inner.slots.get(index).cloned()
    }

    pub(crate) fn slot_lists(&self) -> &[EntityList] {
        &self.inner.slots
    }

    /// The named collection slot.
    pub fn list(&self, name: &str) -> Result<EntityList> {
        match self.slot_list(name) {
            Some(list) if list.kind() == SlotKind::List => Ok(list),
            _ => Err(TrellisError::child_slot_not_found(self.entity_type(), name)),
        }
    }

    /// The child in a single slot.
    pub fn child(&self, name: &str) -> Result<Option<Entity>> {
        match self.slot_list(name) {
            Some(list) if list.kind() == SlotKind::Single => Ok(list.first()),
            _ => Err(TrellisError::child_slot_not_found(self.entity_type(), name)),
        }
    }

    /// Put `child` into a single slot, removing the current occupant.
    pub fn set_child(&self, name: &str, child: &Entity) -> Result<()> {
        let list = match self.slot_list(name) {
            Some(list) if list.kind() == SlotKind::Single => list,
            _ => return Err(TrellisError::child_slot_not_found(self.entity_type(), name)),
        };
        if list.contains(child) {
            return Ok(());
        }
        list.add(child)
    }

    /// Remove the child in a single slot. Returns whether one was present.
    pub fn clear_child(&self, name: &str) -> Result<bool> {
        match self.child(name)? {
            Some(current) => {
                let list = self
                    .slot_list(name)
                    .ok_or_else(|| TrellisError::child_slot_not_found(self.entity_type(), name))?;
                list.remove(&current)
            }
            None => Ok(false),
        }
    }

    /// Live children across all slots, in slot order.
    pub fn children(&self) -> Vec<Entity> {
        self.inner
            .slots
            .iter()
            .flat_map(|list| list.items())
            .collect()
    }

    /// Every live node of the subtree rooted here, breadth-first, in slot
    /// and collection order.
    pub fn descendants_breadth_first(&self) -> Vec<Entity> {
        let mut out = Vec::new();
        let mut queue = VecDeque::from([self.clone()]);
        while let Some(node) = queue.pop_front() {
            queue.extend(node.children());
            out.push(node);
        }
        out
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Rules
    // ─────────────────────────────────────────────────────────────────────────

    /// Register a rule on this instance only. It runs after type rules of
    /// the same kind.
    pub fn add_rule(&self, rule: RuleRegistration) -> Result<RuleId> {
        self.inner.schema.check_rule(&rule)?;
        let id = self.inner.core.lock().instance_rules.register(rule);
        Ok(id)
    }

    /// Run every rule of this node once and clear the indeterminate mark.
    pub fn check_rules(&self) {
        engine::run_all(self);
    }

    /// [`check_rules`](Self::check_rules) over this node and every live
    /// descendant, breadth-first in registration order.
    pub fn check_rules_deep(&self) {
        for node in self.descendants_breadth_first() {
            engine::run_all(&node);
        }
    }

    /// Number of async rule runs of this node still in flight.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.in_flight()
    }

    /// Wait until every async rule run of this node that was scheduled
    /// before the call has completed.
    ///
    /// Cancelling stops the wait but not the runs, and marks validity
    /// indeterminate until the next full rule run.
    pub fn wait_for_pending(
        &self,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<()>> + Send + '_ {
        let horizon = self.inner.pending.horizon();
        let cancel = cancel.clone();
        async move {
            let result = self.inner.pending.wait_until(horizon, &cancel).await;
            if result.is_err() {
                self.mark_indeterminate();
            }
            result
        }
    }

    /// Wait for every node of the subtree rooted here.
    pub fn wait_for_all_pending(
        &self,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<()>> + Send + '_ {
        let targets: Vec<(Entity, u64)> = self
            .descendants_breadth_first()
            .into_iter()
            .map(|node| {
                let horizon = node.inner.pending.horizon();
                (node, horizon)
            })
            .collect();
        let cancel = cancel.clone();

        async move {
            for (node, horizon) in targets {
                if let Err(err) = node.inner.pending.wait_until(horizon, &cancel).await {
                    self.mark_indeterminate();
                    return Err(err);
                }
            }
            Ok(())
        }
    }

    fn mark_indeterminate(&self) {
        self.inner.core.lock().indeterminate = true;
        debug!(entity = %self.id(), "Wait cancelled; validity indeterminate");
        state::refresh(self);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Notifications
    // ─────────────────────────────────────────────────────────────────────────

    pub fn subscribe(&self) -> broadcast::Receiver<EntityEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn emit(&self, event: EntityEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }
}
