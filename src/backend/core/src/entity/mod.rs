//! Entity nodes and the types that create them.

mod events;
mod node;
mod pause;
mod schema;

pub use events::EntityEvent;
pub use node::Entity;
pub(crate) use node::EntityInner;
pub use pause::PauseGuard;
pub use schema::{ChildSlotDef, EntitySchema, EntitySchemaBuilder, SlotKind};
