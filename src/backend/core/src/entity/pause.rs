//! Paused scopes for bulk loads and batched edits.
//!
//! While a node or any of its ancestors is paused, writes store values and
//! remember the property name but schedule no rules and publish no
//! notifications. When the outermost pause ends, each written property's
//! rules run once and the subtree's state is recomputed bottom-up.

use tracing::debug;

use crate::aggregate::state;
use crate::rules::engine;

use super::node::Entity;

/// Scoped pause. Resumes when the outermost guard drops.
#[must_use = "the pause ends when the guard is dropped"]
pub struct PauseGuard {
    entity: Entity,
}

impl Entity {
    /// Enter a paused scope. Nested pauses stack.
    pub fn pause(&self) -> PauseGuard {
        self.inner.core.lock().pause_depth += 1;
        PauseGuard {
            entity: self.clone(),
        }
    }

    /// Whether this node or any ancestor is inside a paused scope.
    pub fn is_paused(&self) -> bool {
        if self.inner.core.lock().pause_depth > 0 {
            return true;
        }
        let mut current = self.parent();
        while let Some(node) = current {
            if node.inner.core.lock().pause_depth > 0 {
                return true;
            }
            current = node.parent();
        }
        false
    }
}

impl PauseGuard {
    pub fn entity(&self) -> &Entity {
        &self.entity
    }
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        let outermost = {
            let mut core = self.entity.inner.core.lock();
            core.pause_depth = core.pause_depth.saturating_sub(1);
            core.pause_depth == 0
        };
        if !outermost || self.entity.is_paused() {
            return;
        }

        debug!(entity = %self.entity.id(), "Resuming paused scope");
        resume(&self.entity);
    }
}

fn resume(entity: &Entity) {
    // Nodes still holding their own pause keep their deferred writes.
    for node in entity.descendants_breadth_first() {
        if node.inner.core.lock().pause_depth == 0 {
            engine::flush_deferred(&node);
        }
    }
    state::refresh_subtree(entity);
}

#[cfg(test)]
mod tests {
    use crate::entity::EntitySchema;
    use crate::property::PropertyDef;
    use crate::rules::{RuleKind, RuleRegistration};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_nested_pause_runs_rules_once_on_outermost_exit() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let schema = EntitySchema::builder("Person")
            .properties(["first", "last"])
            .rule(
                RuleRegistration::from_fn("count", RuleKind::Validation, move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .triggered_by(["first", "last"]),
            )
            .build()
            .unwrap();

        let person = schema.create();
        let baseline = runs.load(Ordering::SeqCst);
        {
            let _outer = person.pause();
            {
                let _inner = person.pause();
                person.set("first", "Jane").unwrap();
                person.set("last", "Doe").unwrap();
            }
            assert!(person.is_paused());
            person.set("first", "Janet").unwrap();
            assert_eq!(runs.load(Ordering::SeqCst), baseline);
        }
        assert!(!person.is_paused());
        assert_eq!(runs.load(Ordering::SeqCst), baseline + 1);
    }
}
