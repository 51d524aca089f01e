//! Rule declarations: kinds, bodies, contexts, and outcomes.
//!
//! A rule is a stateless registration. Synchronous rules receive a
//! [`RuleContext`] bound to the entity and write through the normal property
//! path. Asynchronous rules receive an [`AsyncRuleInput`] snapshot and return
//! a [`RuleOutcome`] that the engine applies on completion.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::entity::Entity;
use crate::error::{Result, TrellisError};
use crate::property::{from_value, PropertyValue, RuleMessage, Severity};

use super::shape::ShapeConstraint;

// ═══════════════════════════════════════════════════════════════════════════════
// Rule Identity
// ═══════════════════════════════════════════════════════════════════════════════

/// Rule kind. Variant order is execution order for a shared trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    /// Simple per-field constraints
    Shape,
    /// Custom validation
    Validation,
    /// Derived values
    Derivation,
}

impl RuleKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Shape => "shape",
            Self::Validation => "validation",
            Self::Derivation => "derivation",
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a rule was registered. Type rules order before instance rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RuleScope {
    Type,
    Instance,
}

/// Stable identity of a registration within one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RuleId {
    pub scope: RuleScope,
    pub index: usize,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Rule Bodies
// ═══════════════════════════════════════════════════════════════════════════════

/// A rule that runs to completion on the writing thread.
pub trait SyncRule: Send + Sync {
    fn execute(&self, ctx: &mut RuleContext<'_>) -> Result<()>;
}

impl<F> SyncRule for F
where
    F: Fn(&mut RuleContext<'_>) -> Result<()> + Send + Sync,
{
    fn execute(&self, ctx: &mut RuleContext<'_>) -> Result<()> {
        self(ctx)
    }
}

/// A rule whose computation runs out-of-band on the Tokio runtime.
#[async_trait]
pub trait AsyncRule: Send + Sync {
    async fn execute(&self, input: AsyncRuleInput) -> RuleOutcome;
}

/// Adapter turning an async closure into an [`AsyncRule`].
pub struct AsyncFn<F>(pub F);

#[async_trait]
impl<F, Fut> AsyncRule for AsyncFn<F>
where
    F: Fn(AsyncRuleInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RuleOutcome> + Send + 'static,
{
    async fn execute(&self, input: AsyncRuleInput) -> RuleOutcome {
        (self.0)(input).await
    }
}

#[derive(Clone)]
pub enum RuleBody {
    Sync(Arc<dyn SyncRule>),
    Async(Arc<dyn AsyncRule>),
}

impl RuleBody {
    pub const fn mode(&self) -> &'static str {
        match self {
            Self::Sync(_) => "sync",
            Self::Async(_) => "async",
        }
    }
}

impl fmt::Debug for RuleBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mode())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Registration
// ═══════════════════════════════════════════════════════════════════════════════

/// A rule plus its trigger set.
#[derive(Debug, Clone)]
pub struct RuleRegistration {
    /// Name, also the key under which the rule's messages are stored
    pub name: String,
    pub kind: RuleKind,
    /// Properties whose change schedules this rule
    pub triggers: Vec<String>,
    /// Properties the rule's messages target (marked busy while async)
    pub affected: Vec<String>,
    /// Properties the rule writes; used for dependency diagnostics only
    pub outputs: Vec<String>,
    pub body: RuleBody,
}

impl RuleRegistration {
    pub fn sync(name: impl Into<String>, kind: RuleKind, rule: impl SyncRule + 'static) -> Self {
        Self::with_body(name, kind, RuleBody::Sync(Arc::new(rule)))
    }

    pub fn asynchronous(
        name: impl Into<String>,
        kind: RuleKind,
        rule: impl AsyncRule + 'static,
    ) -> Self {
        Self::with_body(name, kind, RuleBody::Async(Arc::new(rule)))
    }

    /// Synchronous rule from a closure.
    pub fn from_fn<F>(name: impl Into<String>, kind: RuleKind, f: F) -> Self
    where
        F: Fn(&mut RuleContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        Self::sync(name, kind, f)
    }

    /// Asynchronous rule from an async closure.
    pub fn from_async_fn<F, Fut>(name: impl Into<String>, kind: RuleKind, f: F) -> Self
    where
        F: Fn(AsyncRuleInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RuleOutcome> + Send + 'static,
    {
        Self::asynchronous(name, kind, AsyncFn(f))
    }

    /// A data-shape constraint on a single property.
    pub fn shape(property: impl Into<String>, constraint: ShapeConstraint) -> Self {
        let property = property.into();
        let name = format!("{}:{}", property, constraint.name());
        Self::sync(name, RuleKind::Shape, ShapeRule::new(property.clone(), constraint))
            .triggered_by([property])
    }

    /// A derivation writing `output` from the current values of `triggers`.
    pub fn derive<F>(
        name: impl Into<String>,
        triggers: impl IntoIterator<Item = impl Into<String>>,
        output: impl Into<String>,
        compute: F,
    ) -> Self
    where
        F: Fn(&RuleContext<'_>) -> Result<PropertyValue> + Send + Sync + 'static,
    {
        let output = output.into();
        let target = output.clone();
        Self::from_fn(name, RuleKind::Derivation, move |ctx| {
            let value = compute(ctx)?;
            ctx.set(&target, value)
        })
        .triggered_by(triggers)
        .writes([output])
    }

    fn with_body(name: impl Into<String>, kind: RuleKind, body: RuleBody) -> Self {
        Self {
            name: name.into(),
            kind,
            triggers: Vec::new(),
            affected: Vec::new(),
            outputs: Vec::new(),
            body,
        }
    }

    pub fn triggered_by(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        for name in names {
            let name = name.into();
            if !self.triggers.contains(&name) {
                self.triggers.push(name);
            }
        }
        self
    }

    pub fn affects(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        for name in names {
            let name = name.into();
            if !self.affected.contains(&name) {
                self.affected.push(name);
            }
        }
        self
    }

    pub fn writes(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        for name in names {
            let name = name.into();
            if !self.outputs.contains(&name) {
                self.outputs.push(name);
            }
        }
        self
    }

    /// Properties that receive this rule's messages and busy marks.
    /// Defaults to the trigger set.
    pub fn targets(&self) -> &[String] {
        if self.affected.is_empty() {
            &self.triggers
        } else {
            &self.affected
        }
    }

    pub fn is_async(&self) -> bool {
        matches!(self.body, RuleBody::Async(_))
    }

    /// Every property name the registration references.
    pub fn referenced(&self) -> impl Iterator<Item = &String> {
        self.triggers
            .iter()
            .chain(self.affected.iter())
            .chain(self.outputs.iter())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Sync Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Access to the entity for the duration of one synchronous rule run.
pub struct RuleContext<'a> {
    entity: &'a Entity,
    rule: &'a str,
    targets: &'a [String],
    messages: Vec<RuleMessage>,
}

impl<'a> RuleContext<'a> {
    pub(crate) fn new(entity: &'a Entity, rule: &'a str, targets: &'a [String]) -> Self {
        Self {
            entity,
            rule,
            targets,
            messages: Vec::new(),
        }
    }

    pub fn entity(&self) -> &Entity {
        self.entity
    }

    pub fn rule_name(&self) -> &str {
        self.rule
    }

    /// Current value of a property on this entity.
    pub fn value(&self, name: &str) -> Result<PropertyValue> {
        self.entity.get(name)
    }

    pub fn get_as<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        self.entity.get_as(name)
    }

    /// Write through the normal path; dependent rules cascade.
    pub fn set(&mut self, name: &str, value: impl Into<PropertyValue>) -> Result<()> {
        self.entity.write(name, value.into()).map(|_| ())
    }

    /// Silent write; never triggers rules.
    pub fn load(&mut self, name: &str, value: impl Into<PropertyValue>) -> Result<()> {
        self.entity.load(name, value.into())
    }

    pub fn error(&mut self, property: &str, text: impl Into<String>) {
        self.push(property, Severity::Error, text.into());
    }

    pub fn warning(&mut self, property: &str, text: impl Into<String>) {
        self.push(property, Severity::Warning, text.into());
    }

    pub fn info(&mut self, property: &str, text: impl Into<String>) {
        self.push(property, Severity::Information, text.into());
    }

    /// Error on the rule's first target property.
    pub fn fail(&mut self, text: impl Into<String>) {
        if let Some(target) = self.targets.first() {
            let target = target.clone();
            self.push(&target, Severity::Error, text.into());
        }
    }

    pub fn push_message(&mut self, mut message: RuleMessage) {
        message.rule = self.rule.to_string();
        self.messages.push(message);
    }

    fn push(&mut self, property: &str, severity: Severity, text: String) {
        self.messages
            .push(RuleMessage::new(property, severity, text, self.rule));
    }

    pub(crate) fn into_messages(self) -> Vec<RuleMessage> {
        self.messages
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Async Input / Outcome
// ═══════════════════════════════════════════════════════════════════════════════

/// Snapshot handed to an async rule when its run starts.
#[derive(Debug, Clone)]
pub struct AsyncRuleInput {
    pub entity_id: Uuid,
    pub entity_type: String,
    /// Property values at scheduling time
    pub values: HashMap<String, PropertyValue>,
    /// Cancelled when a newer run of the same rule starts
    pub cancel: CancellationToken,
}

impl AsyncRuleInput {
    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.values.get(name)
    }

    pub fn get_as<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let value = self
            .values
            .get(name)
            .cloned()
            .ok_or_else(|| TrellisError::property_not_found(&self.entity_type, name))?;
        from_value(name, value)
    }

    pub fn is_superseded(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Result of an async rule run, applied by the engine if still current.
#[derive(Debug, Clone, Default)]
pub struct RuleOutcome {
    pub messages: Vec<RuleMessage>,
    /// Writes applied through the normal property path
    pub writes: Vec<(String, PropertyValue)>,
}

impl RuleOutcome {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error(self, property: &str, text: impl Into<String>) -> Self {
        self.message(property, Severity::Error, text)
    }

    pub fn warning(self, property: &str, text: impl Into<String>) -> Self {
        self.message(property, Severity::Warning, text)
    }

    pub fn info(self, property: &str, text: impl Into<String>) -> Self {
        self.message(property, Severity::Information, text)
    }

    pub fn set(mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.writes.push((name.into(), value.into()));
        self
    }

    fn message(mut self, property: &str, severity: Severity, text: impl Into<String>) -> Self {
        self.messages
            .push(RuleMessage::new(property, severity, text, String::new()));
        self
    }

    /// Stamp every message with the producing rule's name.
    pub(crate) fn stamped(mut self, rule: &str) -> Self {
        for message in &mut self.messages {
            message.rule = rule.to_string();
        }
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Shape Rule
// ═══════════════════════════════════════════════════════════════════════════════

struct ShapeRule {
    property: String,
    constraint: ShapeConstraint,
}

impl ShapeRule {
    fn new(property: String, constraint: ShapeConstraint) -> Self {
        Self {
            property,
            constraint,
        }
    }
}

impl SyncRule for ShapeRule {
    fn execute(&self, ctx: &mut RuleContext<'_>) -> Result<()> {
        let value = ctx.value(&self.property)?;
        if let Some(violation) = self.constraint.check(&value) {
            let message = RuleMessage::new(&self.property, Severity::Error, violation.to_string(), "")
                .with_code(violation.code());
            ctx.push_message(message);
        }
        Ok(())
    }
}
