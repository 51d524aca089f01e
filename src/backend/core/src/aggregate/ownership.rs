//! Single-aggregate ownership checks and detachment.

use tracing::debug;

use crate::entity::{Entity, EntityEvent};
use crate::error::{Result, TrellisError};
use crate::telemetry::OwnershipMetrics;

use super::list::EntityList;
use super::state;

/// Reasons an attach is refused, in check order.
fn reject(item: &Entity, reason: &'static str, err: TrellisError) -> TrellisError {
    OwnershipMetrics::rejected(reason);
    debug!(
        entity = %item.id(),
        reason,
        "Attach rejected"
    );
    err
}

/// Verify that `item` may be attached to `list`, owned by `owner`.
///
/// Rejects disposed items, wrong types, duplicates, busy items, ownership
/// cycles, and items owned by a different aggregate unless the target
/// aggregate is paused.
pub(crate) fn check_attach(owner: &Entity, list: &EntityList, item: &Entity) -> Result<()> {
    if item.is_disposed() {
        return Err(reject(item, "null_item", TrellisError::null_item()));
    }
    if !list.item_schema().same_type(item.schema()) {
        return Err(reject(
            item,
            "schema_mismatch",
            TrellisError::schema_mismatch(list.item_schema().name(), item.entity_type()),
        ));
    }
    if list.contains(item) {
        return Err(reject(
            item,
            "duplicate",
            TrellisError::duplicate_item(item.id(), list.name()),
        ));
    }
    if item.is_busy() {
        return Err(reject(item, "busy", TrellisError::item_busy(item.id())));
    }
    if item == owner || item.is_ancestor_of(owner) {
        return Err(reject(item, "cycle", TrellisError::ownership_cycle(item.id())));
    }
    if !owner.is_paused() {
        if let Some(item_root) = item.root() {
            if item_root != owner.aggregate_root() {
                return Err(reject(
                    item,
                    "cross_aggregate",
                    TrellisError::cross_aggregate(item.id(), list.name()),
                ));
            }
        }
    }
    Ok(())
}

/// Take `item` out of whatever slot currently holds it, live or tombstoned.
///
/// A tombstoned item gets its deletion mark cleared. Returns the former
/// parent, already refreshed.
pub(crate) fn detach(item: &Entity) -> Option<Entity> {
    let list = item.owning_list()?;
    let parent = list.owner();

    let was_tombstoned = {
        let mut items = list.inner.items.write();
        items.live.retain(|e| e != item);
        let before = items.tombstones.len();
        items.tombstones.retain(|e| e != item);
        items.tombstones.len() != before
    };

    if was_tombstoned {
        item.inner.core.lock().deleted = false;
    }
    clear_links(item);

    if let Some(parent) = &parent {
        debug!(
            entity = %item.id(),
            parent = %parent.id(),
            slot = %list.name(),
            was_tombstoned,
            "Detached from slot"
        );
        parent.emit(EntityEvent::ChildrenChanged {
            entity: parent.id(),
            slot: list.name().to_string(),
        });
        state::refresh(parent);
    }
    parent
}

pub(crate) fn clear_links(item: &Entity) {
    let mut links = item.inner.links.write();
    links.parent = None;
    links.slot = None;
    links.child_of_collection = false;
}
