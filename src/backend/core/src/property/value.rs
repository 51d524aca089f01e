//! Dynamic property values.
//!
//! Values are `serde_json::Value` so that any serializable Rust type can be
//! stored, compared, and shipped across a process boundary without a
//! per-type registry. Typed access goes through [`to_value`] / [`from_value`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrellisError};

/// The value held by a property.
pub type PropertyValue = serde_json::Value;

/// Convert a typed value into a property value.
pub fn to_value<T: Serialize>(value: T) -> Result<PropertyValue> {
    Ok(serde_json::to_value(value)?)
}

/// Convert a property value into a typed value.
pub fn from_value<T: DeserializeOwned>(name: &str, value: PropertyValue) -> Result<T> {
    serde_json::from_value(value).map_err(|e| TrellisError::type_mismatch(name, e))
}

/// Declaration of one property on an entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDef {
    /// Property name, unique within the entity type
    pub name: String,
    /// Value a freshly created entity starts with
    #[serde(default)]
    pub default: PropertyValue,
}

impl PropertyDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: PropertyValue::Null,
        }
    }

    /// Set the default value.
    pub fn default_value(mut self, value: impl Into<PropertyValue>) -> Self {
        self.default = value.into();
        self
    }
}

impl From<&str> for PropertyDef {
    fn from(name: &str) -> Self {
        PropertyDef::new(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_typed_round_trip() {
        let v = to_value(vec![1, 2, 3]).unwrap();
        assert_eq!(v, json!([1, 2, 3]));
        let back: Vec<i32> = from_value("numbers", v).unwrap();
        assert_eq!(back, vec![1, 2, 3]);
    }

    #[test]
    fn test_type_mismatch() {
        let err = from_value::<i64>("age", json!("forty")).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::TypeMismatch);
    }

    #[test]
    fn test_property_def_default() {
        let def = PropertyDef::new("count").default_value(0);
        assert_eq!(def.default, json!(0));
        let plain: PropertyDef = "name".into();
        assert!(plain.default.is_null());
    }
}
