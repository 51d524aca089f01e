//! Child slots: ordered collections with a tombstone list.
//!
//! A single-child slot is the same structure holding at most one live item.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::debug;

use crate::entity::{Entity, EntityEvent, EntityInner, EntitySchema, SlotKind};
use crate::error::{Result, TrellisError};

use super::ownership;
use super::state;

#[derive(Default)]
pub(crate) struct ListItems {
    pub(crate) live: Vec<Entity>,
    /// Removed persisted items awaiting a deletion persist
    pub(crate) tombstones: Vec<Entity>,
}

pub(crate) struct ListInner {
    name: String,
    kind: SlotKind,
    schema: EntitySchema,
    owner: Weak<EntityInner>,
    pub(crate) items: RwLock<ListItems>,
}

/// Handle to one child slot of an entity. Clones refer to the same slot.
#[derive(Clone)]
pub struct EntityList {
    pub(crate) inner: Arc<ListInner>,
}

impl fmt::Debug for EntityList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let items = self.inner.items.read();
        f.debug_struct("EntityList")
            .field("name", &self.inner.name)
            .field("live", &items.live.len())
            .field("tombstones", &items.tombstones.len())
            .finish()
    }
}

impl EntityList {
    pub(crate) fn new(
        name: String,
        kind: SlotKind,
        schema: EntitySchema,
        owner: Weak<EntityInner>,
    ) -> Self {
        Self {
            inner: Arc::new(ListInner {
                name,
                kind,
                schema,
                owner,
                items: RwLock::new(ListItems::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kind(&self) -> SlotKind {
        self.inner.kind
    }

    /// Type of the items this slot holds.
    pub fn item_schema(&self) -> &EntitySchema {
        &self.inner.schema
    }

    pub fn owner(&self) -> Option<Entity> {
        self.inner.owner.upgrade().map(Entity::from_inner)
    }

    fn require_owner(&self) -> Result<Entity> {
        self.owner()
            .ok_or_else(|| TrellisError::internal(format!("owner of slot '{}' was dropped", self.name())))
    }

    pub fn len(&self) -> usize {
        self.inner.items.read().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.items.read().live.is_empty()
    }

    /// Live items, in order.
    pub fn items(&self) -> Vec<Entity> {
        self.inner.items.read().live.clone()
    }

    pub fn get(&self, index: usize) -> Option<Entity> {
        self.inner.items.read().live.get(index).cloned()
    }

    pub fn first(&self) -> Option<Entity> {
        self.get(0)
    }

    /// Removed persisted items awaiting deletion.
    pub fn tombstones(&self) -> Vec<Entity> {
        self.inner.items.read().tombstones.clone()
    }

    pub fn contains(&self, item: &Entity) -> bool {
        self.inner.items.read().live.iter().any(|e| e == item)
    }

    pub fn is_tombstoned(&self, item: &Entity) -> bool {
        self.inner.items.read().tombstones.iter().any(|e| e == item)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Mutation
    // ─────────────────────────────────────────────────────────────────────────

    /// Attach `item` at the end of the live list.
    ///
    /// Ownership errors are returned synchronously. A tombstoned item of the
    /// same aggregate is reattached with its deletion mark cleared; a live
    /// item of a sibling slot is moved. Persisted items are marked modified.
    pub fn add(&self, item: &Entity) -> Result<()> {
        let owner = self.require_owner()?;
        ownership::check_attach(&owner, self, item)?;

        if self.kind() == SlotKind::Single {
            if let Some(current) = self.first() {
                self.remove(&current)?;
            }
        }

        let former_parent = ownership::detach(item);

        self.inner.items.write().live.push(item.clone());
        {
            let mut links = item.inner.links.write();
            links.parent = Some(owner.downgrade());
            links.slot = Some(self.name().to_string());
            links.child_of_collection = self.kind() == SlotKind::List;
        }
        let was_new = {
            let mut core = item.inner.core.lock();
            if !core.is_new {
                core.forced = true;
            }
            core.is_new
        };

        debug!(
            entity = %item.id(),
            owner = %owner.id(),
            slot = %self.name(),
            was_new,
            moved = former_parent.is_some(),
            "Attached to slot"
        );

        self.children_changed(&owner);
        state::refresh(item);
        state::refresh(&owner);
        Ok(())
    }

    /// Create a new item of this slot's type and attach it.
    ///
    /// The create-time rule pass runs after attaching, so async rules it
    /// starts do not make the item busy before the ownership checks.
    pub fn add_new(&self) -> Result<Entity> {
        let schema = &self.inner.schema;
        let item = schema.create_unchecked();
        self.add(&item)?;
        if schema.config().check_rules_on_create {
            item.check_rules();
        }
        Ok(item)
    }

    /// Remove a live item. New items are dropped; persisted items move to
    /// the tombstone list with their deletion mark set. Returns whether the
    /// item was live here.
    pub fn remove(&self, item: &Entity) -> Result<bool> {
        let owner = self.require_owner()?;

        let is_new = item.is_new();
        {
            let mut items = self.inner.items.write();
            let Some(position) = items.live.iter().position(|e| e == item) else {
                return Ok(false);
            };
            items.live.remove(position);
            if !is_new {
                items.tombstones.push(item.clone());
            }
        }

        if is_new {
            ownership::clear_links(item);
        } else {
            item.inner.core.lock().deleted = true;
        }

        debug!(
            entity = %item.id(),
            owner = %owner.id(),
            slot = %self.name(),
            tombstoned = !is_new,
            "Removed from slot"
        );

        self.children_changed(&owner);
        state::refresh(item);
        state::refresh(&owner);
        Ok(true)
    }

    /// Move a tombstoned item back to the live list.
    pub(crate) fn restore(&self, item: &Entity) -> Result<()> {
        let owner = self.require_owner()?;
        {
            let mut items = self.inner.items.write();
            if self.kind() == SlotKind::Single && !items.live.is_empty() {
                return Err(TrellisError::duplicate_item(item.id(), self.name()));
            }
            let Some(position) = items.tombstones.iter().position(|e| e == item) else {
                return Ok(());
            };
            items.tombstones.remove(position);
            items.live.push(item.clone());
        }
        item.inner.core.lock().deleted = false;

        self.children_changed(&owner);
        state::refresh(item);
        state::refresh(&owner);
        Ok(())
    }

    /// Attach without ownership checks or modification marks. Used when
    /// rebuilding a graph from persisted state.
    pub(crate) fn attach_loaded(&self, item: &Entity, owner: &Entity) {
        {
            let mut links = item.inner.links.write();
            links.parent = Some(owner.downgrade());
            links.slot = Some(self.name().to_string());
            links.child_of_collection = self.kind() == SlotKind::List;
        }
        self.inner.items.write().live.push(item.clone());
    }

    /// Attach a tombstone without checks. Used when restoring a snapshot.
    pub(crate) fn attach_tombstone(&self, item: &Entity, owner: &Entity) {
        {
            let mut links = item.inner.links.write();
            links.parent = Some(owner.downgrade());
            links.slot = Some(self.name().to_string());
            links.child_of_collection = self.kind() == SlotKind::List;
        }
        self.inner.items.write().tombstones.push(item.clone());
    }

    /// Dispose every tombstoned item. Called after their deletion persisted.
    pub(crate) fn dispose_tombstones(&self) {
        for item in self.inner.items.read().tombstones.iter() {
            item.inner.links.write().disposed = true;
        }
    }

    fn children_changed(&self, owner: &Entity) {
        owner.emit(EntityEvent::ChildrenChanged {
            entity: owner.id(),
            slot: self.name().to_string(),
        });
    }
}
