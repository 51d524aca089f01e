//! Error handling for Trellis Core.
//!
//! This module provides:
//! - A single error type with a machine-readable code and structured details
//! - Categories, severities, and retry classification per code
//! - Structured save-precondition reasons (`NotSavableReason`)
//! - Error logging with tracing integration
//! - Metrics integration for error tracking
//!
//! Validation messages are *not* errors; they live on properties (see
//! [`crate::property::RuleMessage`]). The errors here are the ones callers must
//! react to: ownership violations, save preconditions, persistence failures,
//! and cancellation.
//!
//! # Usage
//!
//! ```rust,ignore
//! use trellis_core::error::{TrellisError, Result, ErrorCode};
//!
//! fn attach(list: &EntityList, item: &Entity) -> Result<()> {
//!     list.add(item)?;
//!     Ok(())
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Trellis operations.
pub type Result<T> = std::result::Result<T, TrellisError>;

/// Opaque error returned by persistence collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Ownership Errors (1000-1099)
    NullItem,
    DuplicateItem,
    ItemBusy,
    CrossAggregateMove,
    OwnershipCycle,
    ChildSlotNotFound,
    SchemaMismatch,

    // Property Errors (1100-1199)
    PropertyNotFound,
    TypeMismatch,

    // Rule Errors (1200-1299)
    CascadeLimitExceeded,
    RuntimeUnavailable,
    RuleTimeout,

    // Save Errors (2000-2099)
    NotSavable,
    PersistenceFailed,
    ReconstructionFailed,

    // Cancellation (3000-3099)
    Cancelled,

    // Serialization Errors (4000-4099)
    SerializationError,

    // Configuration Errors (5000-5099)
    ConfigurationError,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::NullItem => 1000,
            Self::DuplicateItem => 1001,
            Self::ItemBusy => 1002,
            Self::CrossAggregateMove => 1003,
            Self::OwnershipCycle => 1004,
            Self::ChildSlotNotFound => 1005,
            Self::SchemaMismatch => 1006,

            Self::PropertyNotFound => 1100,
            Self::TypeMismatch => 1101,

            Self::CascadeLimitExceeded => 1200,
            Self::RuntimeUnavailable => 1201,
            Self::RuleTimeout => 1202,

            Self::NotSavable => 2000,
            Self::PersistenceFailed => 2001,
            Self::ReconstructionFailed => 2002,

            Self::Cancelled => 3000,

            Self::SerializationError => 4000,

            Self::ConfigurationError => 5000,

            Self::InternalError => 9000,
        }
    }

    /// Check if this error is retryable by the engine.
    ///
    /// Ownership and precondition errors are caller-correctable. Persistence
    /// failures are classified by the collaborator, so the engine never
    /// reports them as retryable on its own.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::RuleTimeout)
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "ownership",
            1100..=1199 => "property",
            1200..=1299 => "rule",
            2000..=2099 => "save",
            3000..=3099 => "cancellation",
            4000..=4099 => "serialization",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller errors (ownership, preconditions, cancellation)
    Low,
    /// Operational issues (timeouts, cascade limits)
    Medium,
    /// Collaborator or system failures
    High,
    /// Engine bugs
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::NullItem
            | ErrorCode::DuplicateItem
            | ErrorCode::ItemBusy
            | ErrorCode::CrossAggregateMove
            | ErrorCode::OwnershipCycle
            | ErrorCode::ChildSlotNotFound
            | ErrorCode::SchemaMismatch
            | ErrorCode::PropertyNotFound
            | ErrorCode::TypeMismatch
            | ErrorCode::NotSavable
            | ErrorCode::Cancelled => Self::Low,

            ErrorCode::CascadeLimitExceeded
            | ErrorCode::RuntimeUnavailable
            | ErrorCode::RuleTimeout => Self::Medium,

            ErrorCode::PersistenceFailed
            | ErrorCode::ReconstructionFailed
            | ErrorCode::SerializationError
            | ErrorCode::ConfigurationError => Self::High,

            ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Save Preconditions
// ═══════════════════════════════════════════════════════════════════════════════

/// One failed conjunct of the `savable` gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotSavableReason {
    /// Nothing in the aggregate changed.
    NotModified,
    /// At least one error-severity message exists in the aggregate.
    Invalid,
    /// Validity is unknown after a cancelled wait; re-run rules to recover.
    Indeterminate,
    /// Asynchronous rules are still in flight.
    Busy,
    /// The node is a child and must be saved through its root.
    IsChild,
}

impl fmt::Display for NotSavableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NotModified => "not modified",
            Self::Invalid => "invalid",
            Self::Indeterminate => "validity indeterminate",
            Self::Busy => "busy",
            Self::IsChild => "is a child",
        };
        f.write_str(text)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Failed save conjuncts, for `NotSavable`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<NotSavableReason>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    pub fn with_reasons(mut self, reasons: Vec<NotSavableReason>) -> Self {
        self.reasons = reasons;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Trellis Core.
#[derive(Error, Debug)]
pub struct TrellisError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-facing error message
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<BoxError>,
}

impl fmt::Display for TrellisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl TrellisError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add an already boxed source error.
    pub fn with_boxed_source(mut self, source: BoxError) -> Self {
        self.source = Some(source);
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    /// Failed save conjuncts when this is a `NotSavable` error.
    pub fn not_savable_reasons(&self) -> &[NotSavableReason] {
        &self.details.reasons
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == ErrorCode::Cancelled
    }

    pub fn is_ownership(&self) -> bool {
        self.code.category() == "ownership"
    }

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical | ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    source = ?self.source,
                    "Trellis error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Trellis error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Trellis error"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            "trellis_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with error code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| TrellisError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| TrellisError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| TrellisError::internal(message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| TrellisError::new(code, "Value not present"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<serde_json::Error> for TrellisError {
    fn from(error: serde_json::Error) -> Self {
        TrellisError::with_internal(
            ErrorCode::SerializationError,
            "Failed to convert a property value",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<config::ConfigError> for TrellisError {
    fn from(error: config::ConfigError) -> Self {
        TrellisError::with_internal(
            ErrorCode::ConfigurationError,
            "Invalid engine configuration",
            error.to_string(),
        )
        .with_source(error)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Domain-Specific Error Constructors
// ═══════════════════════════════════════════════════════════════════════════════

impl TrellisError {
    /// Adding a disposed node (the null-item case).
    pub fn null_item() -> Self {
        Self::new(ErrorCode::NullItem, "Cannot add a disposed entity")
    }

    pub fn duplicate_item(entity_id: impl fmt::Display, list: &str) -> Self {
        Self::new(
            ErrorCode::DuplicateItem,
            format!("Entity {} is already in list '{}'", entity_id, list),
        )
        .with_context("list", list)
    }

    pub fn item_busy(entity_id: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::ItemBusy,
            format!("Entity {} has asynchronous rules in flight", entity_id),
        )
    }

    pub fn cross_aggregate(entity_id: impl fmt::Display, target: &str) -> Self {
        Self::new(
            ErrorCode::CrossAggregateMove,
            format!(
                "Entity {} belongs to another aggregate and cannot be attached to '{}'",
                entity_id, target
            ),
        )
        .with_context("target", target)
    }

    pub fn ownership_cycle(entity_id: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::OwnershipCycle,
            format!("Entity {} cannot become a descendant of itself", entity_id),
        )
    }

    pub fn child_slot_not_found(entity_type: &str, slot: &str) -> Self {
        Self::new(
            ErrorCode::ChildSlotNotFound,
            format!("Entity type '{}' has no child slot '{}'", entity_type, slot),
        )
    }

    pub fn schema_mismatch(expected: &str, actual: &str) -> Self {
        Self::new(
            ErrorCode::SchemaMismatch,
            format!("Expected an entity of type '{}', got '{}'", expected, actual),
        )
    }

    pub fn property_not_found(entity_type: &str, name: &str) -> Self {
        Self::new(
            ErrorCode::PropertyNotFound,
            format!("Entity type '{}' has no property '{}'", entity_type, name),
        )
        .with_details(ErrorDetails::new().with_context("property", name))
    }

    pub fn type_mismatch(name: &str, error: serde_json::Error) -> Self {
        Self::with_internal(
            ErrorCode::TypeMismatch,
            format!("Property '{}' does not hold the requested type", name),
            error.to_string(),
        )
        .with_source(error)
    }

    pub fn cascade_limit(name: &str, depth: usize) -> Self {
        Self::new(
            ErrorCode::CascadeLimitExceeded,
            format!("Rule cascade from '{}' exceeded depth {}", name, depth),
        )
    }

    pub fn runtime_unavailable(rule: &str) -> Self {
        Self::new(
            ErrorCode::RuntimeUnavailable,
            format!("Async rule '{}' needs a Tokio runtime", rule),
        )
    }

    pub fn not_savable(reasons: Vec<NotSavableReason>) -> Self {
        let text = reasons
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        Self::new(ErrorCode::NotSavable, format!("Object is not savable: {}", text))
            .with_details(ErrorDetails::new().with_reasons(reasons))
    }

    pub fn persistence(operation: &str, source: BoxError) -> Self {
        Self::with_internal(
            ErrorCode::PersistenceFailed,
            format!("Persistence {} failed", operation),
            source.to_string(),
        )
        .with_boxed_source(source)
    }

    pub fn reconstruction(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::ReconstructionFailed,
            "Failed to rebuild the object graph from persisted state",
            message,
        )
    }

    pub fn cancelled(operation: &str) -> Self {
        Self::new(ErrorCode::Cancelled, format!("{} was cancelled", operation))
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::ConfigurationError, "Invalid engine configuration", message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_categories() {
        assert_eq!(ErrorCode::DuplicateItem.category(), "ownership");
        assert_eq!(ErrorCode::NotSavable.category(), "save");
        assert_eq!(ErrorCode::Cancelled.category(), "cancellation");
        assert_eq!(ErrorCode::CascadeLimitExceeded.category(), "rule");
    }

    #[test]
    fn test_ownership_errors_are_not_retryable() {
        assert!(!ErrorCode::CrossAggregateMove.is_retryable());
        assert!(!ErrorCode::NotSavable.is_retryable());
        assert!(!ErrorCode::PersistenceFailed.is_retryable());
        assert!(ErrorCode::RuleTimeout.is_retryable());
    }

    #[test]
    fn test_not_savable_carries_reasons() {
        let err = TrellisError::not_savable(vec![NotSavableReason::Invalid, NotSavableReason::Busy]);
        assert_eq!(err.code(), ErrorCode::NotSavable);
        assert_eq!(
            err.not_savable_reasons(),
            &[NotSavableReason::Invalid, NotSavableReason::Busy]
        );
        assert!(err.user_message().contains("invalid, busy"));
    }

    #[test]
    fn test_persistence_error_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err = TrellisError::persistence("insert", Box::new(io));
        let source = std::error::Error::source(&err).expect("source");
        assert!(source.downcast_ref::<std::io::Error>().is_some());
        assert_eq!(err.severity(), ErrorSeverity::High);
    }

    #[test]
    fn test_error_context_on_option() {
        let missing: Option<u32> = None;
        let err = missing.with_error_code(ErrorCode::PropertyNotFound).unwrap_err();
        assert_eq!(err.code(), ErrorCode::PropertyNotFound);
    }

    #[test]
    fn test_error_display() {
        let err = TrellisError::cancelled("save");
        assert_eq!(err.to_string(), "[Cancelled] save was cancelled");
        assert!(err.is_cancelled());
    }
}
