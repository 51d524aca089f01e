//! Rule engine: registrations, the trigger index, scheduling, and async
//! run tracking.
//!
//! Rules are stateless registrations owned by an entity type or a single
//! instance. A rule runs when one of its trigger properties changes, and
//! only then. For one change, rules run by kind (shape, validation,
//! derivation), then type rules before instance rules, then in registration
//! order.

pub mod engine;
mod graph;
mod pending;
mod registry;
mod rule;
mod shape;

pub use engine::CASCADE_LIMIT_RULE;
pub use graph::DependencyGraph;
pub use pending::PendingTracker;
pub use registry::{RuleRegistry, RunList};
pub use rule::{
    AsyncFn, AsyncRule, AsyncRuleInput, RuleBody, RuleContext, RuleId, RuleKind, RuleOutcome,
    RuleRegistration, RuleScope, SyncRule,
};
pub use shape::{ShapeConstraint, ShapeViolation};
