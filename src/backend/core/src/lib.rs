#![allow(clippy::result_large_err)]
//! # Trellis Core
//!
//! Reactive entity state, business rules, and aggregate saves.
//!
//! ## Architecture
//!
//! - **Property**: per-entity values with committed copies, busy counters, and messages
//! - **Rules**: shape, validation, and derivation rules triggered by property changes,
//!   synchronous or asynchronous, with stale-result discard
//! - **Entity**: schema-defined nodes with lifecycle flags, pause scopes, and change events
//! - **Aggregate**: child slots with tombstones, ownership checks, and incrementally
//!   maintained aggregate state
//! - **Persistence**: savable gating, depth-first hook routing, reconstruction, and snapshots
//! - **Telemetry**: structured logging and engine metrics

pub mod aggregate;
pub mod config;
pub mod entity;
pub mod error;
pub mod persistence;
pub mod property;
pub mod rules;
pub mod telemetry;

pub use error::{
    BoxError, ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, NotSavableReason, Result,
    TrellisError,
};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::aggregate::{EntityList, EntityState, NodeState};
    pub use crate::config::EngineConfig;
    pub use crate::entity::{Entity, EntityEvent, EntitySchema, PauseGuard, SlotKind};
    pub use crate::error::{
        ErrorCode, ErrorContext, NotSavableReason, Result, TrellisError,
    };
    pub use crate::persistence::{
        EntitySnapshot, HookContext, InMemoryStore, PersistedChild, PersistedState,
        PersistenceHooks, SaveOrchestrator,
    };
    pub use crate::property::{PropertyDef, PropertyValue, RuleMessage, Severity};
    pub use crate::rules::{
        AsyncFn, AsyncRule, AsyncRuleInput, RuleContext, RuleKind, RuleOutcome,
        RuleRegistration, ShapeConstraint,
    };
    pub use tokio_util::sync::CancellationToken;
}
