//! The persistence collaborator interface.

use async_trait::async_trait;

use crate::entity::Entity;
use crate::error::BoxError;

use super::state::PersistedState;

/// Where in the aggregate a hook call happens.
#[derive(Debug, Clone, Copy)]
pub struct HookContext<'a> {
    /// State of the parent as persisted during this save (for example with a
    /// freshly generated key). `None` for the root.
    pub parent: Option<&'a PersistedState>,
    /// Slot of the node under its parent.
    pub slot: Option<&'a str>,
}

impl<'a> HookContext<'a> {
    pub fn root() -> Self {
        Self {
            parent: None,
            slot: None,
        }
    }

    pub fn child(parent: &'a PersistedState, slot: &'a str) -> Self {
        Self {
            parent: Some(parent),
            slot: Some(slot),
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// Storage operations supplied by the host.
///
/// Hooks return the node's own values as stored; the orchestrator assembles
/// children. Errors are opaque to the engine and reach the caller as the
/// `source` of a `PersistenceFailed` error.
#[async_trait]
pub trait PersistenceHooks: Send + Sync {
    async fn insert(
        &self,
        node: &Entity,
        ctx: HookContext<'_>,
    ) -> Result<PersistedState, BoxError>;

    async fn update(
        &self,
        node: &Entity,
        modified: &[String],
        ctx: HookContext<'_>,
    ) -> Result<PersistedState, BoxError>;

    async fn delete(&self, node: &Entity, ctx: HookContext<'_>) -> Result<(), BoxError>;
}
