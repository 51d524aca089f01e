//! Data-shape constraints over property values.
//!
//! Constraints run as `Shape` rules, before custom validation that shares a
//! trigger. A constraint that does not apply to the value's JSON type (for
//! example `MinLength` on a number) passes; pair it with a type-specific
//! rule if that matters.

use std::fmt;

use regex::Regex;

use crate::property::PropertyValue;

/// A simple per-field constraint.
#[derive(Debug, Clone)]
pub enum ShapeConstraint {
    /// Not null, not an empty or blank string, not an empty array
    Required,
    /// Minimum string length in characters, or minimum array size
    MinLength(usize),
    /// Maximum string length in characters, or maximum array size
    MaxLength(usize),
    MinValue(f64),
    MaxValue(f64),
    /// Inclusive numeric range
    Range { min: f64, max: f64 },
    /// String must match
    Pattern(Regex),
    /// Value must equal one of the allowed values
    OneOf(Vec<PropertyValue>),
}

impl ShapeConstraint {
    /// Build a `Pattern` constraint.
    pub fn pattern(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self::Pattern(Regex::new(pattern)?))
    }

    pub fn one_of<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<PropertyValue>,
    {
        Self::OneOf(values.into_iter().map(Into::into).collect())
    }

    /// Short name, used in rule names.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Required => "required",
            Self::MinLength(_) => "min_length",
            Self::MaxLength(_) => "max_length",
            Self::MinValue(_) => "min_value",
            Self::MaxValue(_) => "max_value",
            Self::Range { .. } => "range",
            Self::Pattern(_) => "pattern",
            Self::OneOf(_) => "one_of",
        }
    }

    /// Check a value, returning the violation if any.
    pub fn check(&self, value: &PropertyValue) -> Option<ShapeViolation> {
        match self {
            Self::Required => {
                let missing = match value {
                    PropertyValue::Null => true,
                    PropertyValue::String(s) => s.trim().is_empty(),
                    PropertyValue::Array(items) => items.is_empty(),
                    _ => false,
                };
                missing.then_some(ShapeViolation::Required)
            }
            Self::MinLength(min) => {
                let actual = length(value)?;
                (actual < *min).then_some(ShapeViolation::MinLength { min: *min, actual })
            }
            Self::MaxLength(max) => {
                let actual = length(value)?;
                (actual > *max).then_some(ShapeViolation::MaxLength { max: *max, actual })
            }
            Self::MinValue(min) => {
                let actual = value.as_f64()?;
                (actual < *min).then_some(ShapeViolation::MinValue { min: *min, actual })
            }
            Self::MaxValue(max) => {
                let actual = value.as_f64()?;
                (actual > *max).then_some(ShapeViolation::MaxValue { max: *max, actual })
            }
            Self::Range { min, max } => {
                let actual = value.as_f64()?;
                (actual < *min || actual > *max).then_some(ShapeViolation::Range {
                    min: *min,
                    max: *max,
                    actual,
                })
            }
            Self::Pattern(regex) => {
                let s = value.as_str()?;
                (!regex.is_match(s)).then(|| ShapeViolation::Pattern {
                    pattern: regex.as_str().to_string(),
                })
            }
            Self::OneOf(allowed) => {
                if value.is_null() || allowed.contains(value) {
                    None
                } else {
                    Some(ShapeViolation::NotInSet {
                        allowed: allowed.iter().map(ToString::to_string).collect(),
                    })
                }
            }
        }
    }
}

fn length(value: &PropertyValue) -> Option<usize> {
    match value {
        PropertyValue::String(s) => Some(s.chars().count()),
        PropertyValue::Array(items) => Some(items.len()),
        _ => None,
    }
}

/// Why a value failed a shape constraint.
#[derive(Debug, Clone, PartialEq)]
pub enum ShapeViolation {
    Required,
    MinLength { min: usize, actual: usize },
    MaxLength { max: usize, actual: usize },
    MinValue { min: f64, actual: f64 },
    MaxValue { max: f64, actual: f64 },
    Range { min: f64, max: f64, actual: f64 },
    Pattern { pattern: String },
    NotInSet { allowed: Vec<String> },
}

impl ShapeViolation {
    /// Machine-readable code stored on the rule message.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Required => "REQUIRED",
            Self::MinLength { .. } => "MIN_LENGTH",
            Self::MaxLength { .. } => "MAX_LENGTH",
            Self::MinValue { .. } => "MIN_VALUE",
            Self::MaxValue { .. } => "MAX_VALUE",
            Self::Range { .. } => "OUT_OF_RANGE",
            Self::Pattern { .. } => "PATTERN_MISMATCH",
            Self::NotInSet { .. } => "NOT_IN_SET",
        }
    }
}

impl fmt::Display for ShapeViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Required => write!(f, "field is required"),
            Self::MinLength { min, actual } => {
                write!(f, "length must be at least {} (got {})", min, actual)
            }
            Self::MaxLength { max, actual } => {
                write!(f, "length must be at most {} (got {})", max, actual)
            }
            Self::MinValue { min, actual } => {
                write!(f, "value must be at least {} (got {})", min, actual)
            }
            Self::MaxValue { max, actual } => {
                write!(f, "value must be at most {} (got {})", max, actual)
            }
            Self::Range { min, max, actual } => {
                write!(f, "value must be between {} and {} (got {})", min, max, actual)
            }
            Self::Pattern { pattern } => write!(f, "value must match pattern '{}'", pattern),
            Self::NotInSet { allowed } => {
                write!(f, "value must be one of: {}", allowed.join(", "))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_required() {
        let c = ShapeConstraint::Required;
        assert_eq!(c.check(&json!(null)), Some(ShapeViolation::Required));
        assert_eq!(c.check(&json!("   ")), Some(ShapeViolation::Required));
        assert_eq!(c.check(&json!([])), Some(ShapeViolation::Required));
        assert!(c.check(&json!("x")).is_none());
        assert!(c.check(&json!(0)).is_none());
    }

    #[test]
    fn test_length_counts_chars() {
        let c = ShapeConstraint::MaxLength(3);
        assert!(c.check(&json!("äöü")).is_none());
        assert_eq!(
            c.check(&json!("abcd")),
            Some(ShapeViolation::MaxLength { max: 3, actual: 4 })
        );
        assert!(ShapeConstraint::MinLength(2).check(&json!(5)).is_none());
    }

    #[test]
    fn test_range() {
        let c = ShapeConstraint::Range { min: 0.0, max: 120.0 };
        assert!(c.check(&json!(42)).is_none());
        assert_eq!(c.check(&json!(-1)).map(|v| v.code()), Some("OUT_OF_RANGE"));
    }

    #[test]
    fn test_pattern_and_one_of() {
        let c = ShapeConstraint::pattern(r"^[A-Z]{3}$").unwrap();
        assert!(c.check(&json!("USD")).is_none());
        assert!(c.check(&json!("usd")).is_some());

        let c = ShapeConstraint::one_of(["draft", "final"]);
        assert!(c.check(&json!("draft")).is_none());
        assert!(c.check(&json!(null)).is_none());
        let violation = c.check(&json!("other")).unwrap();
        assert!(violation.to_string().contains("\"draft\""));
    }
}
