//! Persistence: the hook interface, persisted state, save orchestration,
//! and snapshots.
//!
//! - **`hooks`**: the `PersistenceHooks` collaborator trait.
//! - **`state`**: stored node state and graph reconstruction (`fetch`).
//! - **`orchestrator`**: the savable gate and depth-first hook routing.
//! - **`snapshot`**: full-fidelity graph transfer.
//! - **`memory`**: an in-memory hook implementation.

pub mod hooks;
pub mod memory;
pub mod orchestrator;
pub mod snapshot;
pub mod state;

pub use hooks::{HookContext, PersistenceHooks};
pub use memory::{HookCall, HookOp, InMemoryStore, InjectedFailure, MissingRow, StoredRow};
pub use orchestrator::{SaveOrchestrator, SaveRoute};
pub use snapshot::{EntitySnapshot, SlotSnapshot};
pub use state::{PersistedChild, PersistedState};
