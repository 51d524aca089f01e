//! Rule messages attached to properties.
//!
//! Messages are not errors: they accumulate per property and only the
//! `Error` severity blocks saving.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity of a rule message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Information,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Information => write!(f, "information"),
        }
    }
}

/// A single message produced by a rule for a property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleMessage {
    /// Property the message is attached to
    pub property: String,
    /// Message severity
    pub severity: Severity,
    /// Human-readable text
    pub text: String,
    /// Name of the rule that produced it
    pub rule: String,
    /// Optional machine-readable code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl RuleMessage {
    pub fn new(
        property: impl Into<String>,
        severity: Severity,
        text: impl Into<String>,
        rule: impl Into<String>,
    ) -> Self {
        Self {
            property: property.into(),
            severity,
            text: text.into(),
            rule: rule.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for RuleMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.property, self.severity, self.text)
    }
}
