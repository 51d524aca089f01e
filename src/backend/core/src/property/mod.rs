//! Property store: per-entity values, change flags, busy counters, and
//! validation messages.
//!
//! - **`value`**: dynamic property values and property definitions.
//! - **`message`**: rule messages with severity.
//! - **`store`**: the `PropertyStore` itself.

pub mod message;
pub mod store;
pub mod value;

pub use message::{RuleMessage, Severity};
pub use store::{PropertySnapshot, PropertyState, PropertyStore};
pub use value::{from_value, to_value, PropertyDef, PropertyValue};
