//! Aggregate tree: child slots, ownership rules, and combined state.
//!
//! An aggregate is a tree of entities saved as one unit through its root.
//! Parents own children strongly; children refer to their parent through a
//! weak back-reference that never extends the parent's lifetime.

pub(crate) mod list;
pub(crate) mod ownership;
pub(crate) mod state;

pub use list::EntityList;
pub use state::{EntityState, NodeState};
