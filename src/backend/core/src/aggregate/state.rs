//! Self and aggregate state, refreshed incrementally.
//!
//! Each node caches its own state and its aggregate state. A refresh
//! recomputes the node from its core and its children's *cached* aggregate
//! state, then walks up only while the aggregate state keeps changing.
//! Paused nodes are not refreshed; their state is computed on the fly until
//! the outermost pause ends.

use serde::Serialize;

use crate::entity::{Entity, EntityEvent};

/// Validity, modification, and activity flags of a node or subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NodeState {
    pub valid: bool,
    pub modified: bool,
    pub busy: bool,
    /// A wait was cancelled; validity unknown until rules re-run in full
    pub indeterminate: bool,
}

impl Default for NodeState {
    fn default() -> Self {
        Self {
            valid: true,
            modified: false,
            busy: false,
            indeterminate: false,
        }
    }
}

impl NodeState {
    /// Fold a live child's aggregate state into this one.
    pub fn combine(self, child: NodeState) -> NodeState {
        NodeState {
            valid: self.valid && child.valid,
            modified: self.modified || child.modified,
            busy: self.busy || child.busy,
            indeterminate: self.indeterminate || child.indeterminate,
        }
    }
}

/// Cached state of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct EntityState {
    /// From this node's own property store and lifecycle flags
    pub own: NodeState,
    /// `own` combined with every live child's aggregate state
    pub aggregate: NodeState,
}

/// Self-state, straight from the node's core.
pub(crate) fn self_state(entity: &Entity) -> NodeState {
    let core = entity.inner.core.lock();
    NodeState {
        valid: !core.properties.has_errors(),
        modified: core.is_new
            || core.deleted
            || core.forced
            || core.properties.any_modified(),
        busy: core.properties.any_busy(),
        indeterminate: core.indeterminate,
    }
}

/// Aggregate state: cached, or computed on the fly while paused.
pub(crate) fn aggregate_state(entity: &Entity) -> NodeState {
    if entity.is_paused() {
        compute_fresh(entity)
    } else {
        entity.inner.status.read().aggregate
    }
}

fn compute_fresh(entity: &Entity) -> NodeState {
    combine_children(entity, self_state(entity), compute_fresh)
}

fn combine_children(
    entity: &Entity,
    own: NodeState,
    child_state: impl Fn(&Entity) -> NodeState,
) -> NodeState {
    let mut aggregate = own;
    for list in entity.slot_lists() {
        let items = list.inner.items.read();
        if !items.tombstones.is_empty() {
            aggregate.modified = true;
        }
        for child in &items.live {
            aggregate = aggregate.combine(child_state(child));
        }
    }
    aggregate
}

fn cached_aggregate(entity: &Entity) -> NodeState {
    entity.inner.status.read().aggregate
}

/// Recompute one node from its core and its children's cached state.
/// Returns whether the aggregate state changed.
fn recompute(entity: &Entity) -> bool {
    let (changed, aggregate_changed, state) = {
        let mut status = entity.inner.status.write();
        let own = self_state(entity);
        let aggregate = combine_children(entity, own, cached_aggregate);
        let state = EntityState { own, aggregate };
        let changed = *status != state;
        let aggregate_changed = status.aggregate != aggregate;
        *status = state;
        (changed, aggregate_changed, state)
    };

    if changed {
        entity.emit(EntityEvent::StateChanged {
            entity: entity.id(),
            state,
        });
    }
    aggregate_changed
}

/// Refresh a node and propagate upward while the aggregate changes.
pub(crate) fn refresh(entity: &Entity) {
    if entity.is_paused() {
        return;
    }
    let mut current = entity.clone();
    while recompute(&current) {
        match current.parent() {
            Some(parent) if !parent.is_paused() => current = parent,
            _ => break,
        }
    }
}

/// Recompute a whole subtree bottom-up, then propagate upward.
pub(crate) fn refresh_subtree(entity: &Entity) {
    if entity.is_paused() {
        return;
    }
    recompute_descendants(entity);
    refresh(entity);
}

fn recompute_descendants(entity: &Entity) {
    for child in entity.children() {
        recompute_descendants(&child);
        recompute(&child);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine() {
        let own = NodeState {
            modified: false,
            ..NodeState::default()
        };
        let child = NodeState {
            valid: false,
            busy: true,
            ..NodeState::default()
        };
        let agg = own.combine(child);
        assert!(!agg.valid);
        assert!(agg.busy);
        assert!(!agg.modified);
        assert!(!agg.indeterminate);
    }
}
