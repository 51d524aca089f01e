//! Save orchestration: the savable gate, hook routing, and rebuilding the
//! graph from what was persisted.

use std::fmt;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::entity::{Entity, SlotKind};
use crate::error::{Result, TrellisError};
use crate::telemetry::SaveTimer;

use super::hooks::{HookContext, PersistenceHooks};
use super::state::{PersistedChild, PersistedState};

/// Which hook a node is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveRoute {
    Insert,
    Update,
    Delete,
}

impl SaveRoute {
    /// Route by lifecycle: deleted, then new, then update.
    pub fn for_node(node: &Entity) -> Self {
        if node.is_deleted() {
            Self::Delete
        } else if node.is_new() {
            Self::Insert
        } else {
            Self::Update
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for SaveRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Saves aggregates through a [`PersistenceHooks`] collaborator.
///
/// A successful save returns a new graph rebuilt from the persisted state.
/// The graph passed in is left as it was (apart from purged tombstones
/// being disposed) and must be discarded by the caller.
#[derive(Clone)]
pub struct SaveOrchestrator {
    hooks: Arc<dyn PersistenceHooks>,
}

impl SaveOrchestrator {
    pub fn new(hooks: Arc<dyn PersistenceHooks>) -> Self {
        Self { hooks }
    }

    pub fn hooks(&self) -> &Arc<dyn PersistenceHooks> {
        &self.hooks
    }

    /// Save an aggregate root.
    ///
    /// Cancellation is honored only before the first hook runs.
    #[instrument(skip_all, fields(entity = %root.id(), entity_type = %root.entity_type()))]
    pub async fn save(&self, root: &Entity, cancel: &CancellationToken) -> Result<Entity> {
        let reasons = root.savable_reasons();
        if !reasons.is_empty() {
            let err = TrellisError::not_savable(reasons);
            err.log();
            return Err(err);
        }
        if cancel.is_cancelled() {
            return Err(TrellisError::cancelled("save"));
        }

        let route = SaveRoute::for_node(root);
        info!(route = %route, "Saving aggregate");

        let timer = SaveTimer::start(route.as_str());
        let result = self.persist_root(root, route).await;
        timer.finish(result.is_ok());

        match result {
            Ok(saved) => {
                dispose_purged(root);
                Ok(saved)
            }
            Err(err) => {
                err.log();
                Err(err)
            }
        }
    }

    /// Wait for every pending async rule of the aggregate, then save.
    pub async fn save_when_idle(&self, root: &Entity, cancel: &CancellationToken) -> Result<Entity> {
        root.wait_for_all_pending(cancel).await?;
        self.save(root, cancel).await
    }

    async fn persist_root(&self, root: &Entity, route: SaveRoute) -> Result<Entity> {
        let mut persisted = match route {
            SaveRoute::Delete => {
                if !root.is_new() {
                    self.hooks
                        .delete(root, HookContext::root())
                        .await
                        .map_err(|e| TrellisError::persistence("delete", e))?;
                }
                root.inner.links.write().disposed = true;
                return Ok(root.schema().create());
            }
            SaveRoute::Insert => self
                .hooks
                .insert(root, HookContext::root())
                .await
                .map_err(|e| TrellisError::persistence("insert", e))?,
            SaveRoute::Update => {
                let modified = root.modified_properties();
                self.hooks
                    .update(root, &modified, HookContext::root())
                    .await
                    .map_err(|e| TrellisError::persistence("update", e))?
            }
        };

        self.persist_children(root, &mut persisted).await?;
        root.schema().fetch(&persisted)
    }

    /// Children depth-first, after their parent: tombstones are deleted,
    /// new members inserted, self-modified members updated, and unchanged
    /// members carried over as they are.
    fn persist_children<'a>(
        &'a self,
        node: &'a Entity,
        persisted: &'a mut PersistedState,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            for list in node.slot_lists() {
                let slot = list.name().to_string();

                for gone in list.tombstones() {
                    if gone.is_new() {
                        continue;
                    }
                    self.hooks
                        .delete(&gone, HookContext::child(persisted, &slot))
                        .await
                        .map_err(|e| TrellisError::persistence("delete", e))?;
                }

                let mut saved = Vec::new();
                for child in list.items() {
                    let ctx = HookContext::child(persisted, &slot);
                    let action = if child.is_new() {
                        "insert"
                    } else if child.is_self_modified() {
                        "update"
                    } else {
                        "unchanged"
                    };
                    let mut child_state = if child.is_new() {
                        self.hooks
                            .insert(&child, ctx)
                            .await
                            .map_err(|e| TrellisError::persistence("insert", e))?
                    } else if child.is_self_modified() {
                        let modified = child.modified_properties();
                        self.hooks
                            .update(&child, &modified, ctx)
                            .await
                            .map_err(|e| TrellisError::persistence("update", e))?
                    } else {
                        child.persisted_values()
                    };
                    debug!(entity = %child.id(), slot = %slot, action, "Persisted child");

                    self.persist_children(&child, &mut child_state).await?;
                    saved.push(child_state);
                }

                let entry = match list.kind() {
                    SlotKind::List => PersistedChild::List(saved),
                    SlotKind::Single => PersistedChild::Single(saved.into_iter().next().map(Box::new)),
                };
                persisted.children.insert(slot, entry);
            }
            Ok(())
        }
        .boxed()
    }
}

/// Tombstoned members were deleted by this save; they can no longer be
/// attached anywhere.
fn dispose_purged(root: &Entity) {
    for node in root.descendants_breadth_first() {
        for list in node.slot_lists() {
            list.dispose_tombstones();
        }
    }
}
