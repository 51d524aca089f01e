//! Rule scheduling and execution.
//!
//! Every write, including writes made by rule bodies and by async rule
//! completions, enters through [`write`], so cascades re-enter the same
//! scheduling path. Synchronous rules run on the writing thread before the
//! write returns. Asynchronous rules mark their target properties busy,
//! run on the Tokio runtime, and apply their outcome only if no newer run
//! of the same rule started meanwhile.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::aggregate::state;
use crate::entity::{Entity, EntityEvent};
use crate::error::{Result, TrellisError};
use crate::property::{PropertyValue, RuleMessage, Severity};
use crate::telemetry::RuleMetrics;

use super::registry::RunList;
use super::rule::{
    AsyncRule, AsyncRuleInput, RuleBody, RuleContext, RuleId, RuleOutcome, RuleRegistration,
    SyncRule,
};

/// Message key for cascade-limit errors. Cleared by a full rule run.
pub const CASCADE_LIMIT_RULE: &str = "cascade-limit";

// ═══════════════════════════════════════════════════════════════════════════════
// Write Path
// ═══════════════════════════════════════════════════════════════════════════════

/// Compare, store, notify, and schedule dependent rules.
pub(crate) fn write(entity: &Entity, name: &str, value: PropertyValue) -> Result<bool> {
    let max_depth = entity.schema().config().max_cascade_depth;
    let paused = entity.is_paused();

    let old = {
        let mut core = entity.inner.core.lock();
        let current = core
            .properties
            .read(name)
            .cloned()
            .ok_or_else(|| TrellisError::property_not_found(entity.entity_type(), name))?;
        if current == value {
            return Ok(false);
        }
        core.properties.write(name, value.clone());

        if paused {
            if !core.deferred.iter().any(|n| n == name) {
                core.deferred.push(name.to_string());
            }
            return Ok(true);
        }

        if core.cascade_depth >= max_depth {
            let err = TrellisError::cascade_limit(name, max_depth);
            warn!(
                entity = %entity.id(),
                property = %name,
                depth = core.cascade_depth,
                "Cascade depth limit reached; dependent rules not scheduled"
            );
            RuleMetrics::cascade_limit();
            core.properties.set_message(
                RuleMessage::new(name, Severity::Error, err.user_message(), CASCADE_LIMIT_RULE)
                    .with_code(err.code().to_string()),
            );
            drop(core);
            entity.emit(EntityEvent::PropertyChanged {
                entity: entity.id(),
                property: name.to_string(),
                old: current,
                new: value,
            });
            state::refresh(entity);
            return Ok(true);
        }

        core.cascade_depth += 1;
        current
    };

    entity.emit(EntityEvent::PropertyChanged {
        entity: entity.id(),
        property: name.to_string(),
        old,
        new: value,
    });

    on_property_changed(entity, &[name.to_string()]);

    {
        let mut core = entity.inner.core.lock();
        core.cascade_depth = core.cascade_depth.saturating_sub(1);
    }
    state::refresh(entity);
    Ok(true)
}

/// Schedule every rule triggered by any of `names`, each exactly once.
pub(crate) fn on_property_changed(entity: &Entity, names: &[String]) {
    let run = {
        let core = entity.inner.core.lock();
        RunList::triggered(&[entity.schema().rules(), &core.instance_rules], names)
    };
    for (id, rule) in run.into_vec() {
        execute(entity, id, &rule);
    }
}

/// Run every rule of the entity and clear the indeterminate mark.
pub(crate) fn run_all(entity: &Entity) {
    let run = {
        let mut core = entity.inner.core.lock();
        core.indeterminate = false;
        core.properties
            .replace_rule_messages(CASCADE_LIMIT_RULE, Vec::new());
        RunList::all(&[entity.schema().rules(), &core.instance_rules])
    };
    debug!(entity = %entity.id(), rules = run.len(), "Running all rules");
    for (id, rule) in run.into_vec() {
        execute(entity, id, &rule);
    }
    state::refresh(entity);
}

/// Run rules for properties written during a paused scope.
pub(crate) fn flush_deferred(entity: &Entity) {
    let names = std::mem::take(&mut entity.inner.core.lock().deferred);
    if names.is_empty() {
        return;
    }
    entity.emit(EntityEvent::BatchChanged {
        entity: entity.id(),
        properties: names.clone(),
    });
    entity.inner.core.lock().cascade_depth += 1;
    on_property_changed(entity, &names);
    {
        let mut core = entity.inner.core.lock();
        core.cascade_depth = core.cascade_depth.saturating_sub(1);
    }
}

fn execute(entity: &Entity, id: RuleId, rule: &Arc<RuleRegistration>) {
    match &rule.body {
        RuleBody::Sync(body) => run_sync(entity, rule, body.as_ref()),
        RuleBody::Async(body) => spawn_async(entity, id, rule, body),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Synchronous Rules
// ═══════════════════════════════════════════════════════════════════════════════

fn run_sync(entity: &Entity, rule: &RuleRegistration, body: &dyn SyncRule) {
    debug!(
        entity = %entity.id(),
        rule = %rule.name,
        kind = %rule.kind,
        "Running rule"
    );

    let mut ctx = RuleContext::new(entity, &rule.name, rule.targets());
    let result = body.execute(&mut ctx);
    let mut messages = ctx.into_messages();

    if let Err(err) = result {
        warn!(
            entity = %entity.id(),
            rule = %rule.name,
            error = %err,
            "Rule failed"
        );
        messages.extend(failure_message(rule, &err));
    }

    entity
        .inner
        .core
        .lock()
        .properties
        .replace_rule_messages(&rule.name, messages);
    RuleMetrics::run(rule.kind.as_str(), "sync");
}

fn failure_message(rule: &RuleRegistration, err: &TrellisError) -> Option<RuleMessage> {
    rule.targets().first().map(|target| {
        RuleMessage::new(target, Severity::Error, err.user_message(), &rule.name)
            .with_code(err.code().to_string())
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Asynchronous Rules
// ═══════════════════════════════════════════════════════════════════════════════

fn spawn_async(
    entity: &Entity,
    id: RuleId,
    rule: &Arc<RuleRegistration>,
    body: &Arc<dyn AsyncRule>,
) {
    let handle = match Handle::try_current() {
        Ok(handle) => handle,
        Err(_) => {
            let err = TrellisError::runtime_unavailable(&rule.name);
            err.log();
            let messages = failure_message(rule, &err).into_iter().collect();
            entity
                .inner
                .core
                .lock()
                .properties
                .replace_rule_messages(&rule.name, messages);
            return;
        }
    };

    let cancel = CancellationToken::new();
    let (generation, input) = {
        let mut core = entity.inner.core.lock();
        let generation = {
            let counter = core.generations.entry(id).or_insert(0);
            *counter += 1;
            *counter
        };
        if let Some(previous) = core.running.insert(id, cancel.clone()) {
            previous.cancel();
        }
        core.properties.increment_busy(rule.targets());

        let input = AsyncRuleInput {
            entity_id: entity.id(),
            entity_type: entity.entity_type().to_string(),
            values: core.properties.values(),
            cancel,
        };
        (generation, input)
    };

    let seq = entity.inner.pending.begin();
    RuleMetrics::run(rule.kind.as_str(), "async");
    debug!(
        entity = %entity.id(),
        rule = %rule.name,
        generation,
        "Started async rule"
    );

    let weak = entity.downgrade();
    let pending = Arc::clone(&entity.inner.pending);
    let timeout = entity.schema().config().async_rule_timeout;
    let rule = Arc::clone(rule);
    let body = Arc::clone(body);

    handle.spawn(async move {
        let outcome = match tokio::time::timeout(timeout, body.execute(input)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                RuleMetrics::timeout(&rule.name);
                warn!(rule = %rule.name, ?timeout, "Async rule timed out");
                match rule.targets().first() {
                    Some(target) => RuleOutcome::new().error(
                        target,
                        format!("Rule '{}' timed out after {:?}", rule.name, timeout),
                    ),
                    None => RuleOutcome::new(),
                }
            }
        };

        if let Some(inner) = weak.upgrade() {
            complete_async(&Entity::from_inner(inner), id, generation, &rule, outcome);
        }
        pending.finish(seq);
    });

    state::refresh(entity);
}

/// Apply a finished run if it is still the latest one for its rule.
fn complete_async(
    entity: &Entity,
    id: RuleId,
    generation: u64,
    rule: &RuleRegistration,
    outcome: RuleOutcome,
) {
    let outcome = outcome.stamped(&rule.name);

    let current = {
        let mut core = entity.inner.core.lock();
        core.properties.decrement_busy(rule.targets());
        let latest = core.generations.get(&id).copied().unwrap_or(0);
        let current = latest == generation;
        if current {
            core.running.remove(&id);
            core.properties
                .replace_rule_messages(&rule.name, outcome.messages);
        }
        current
    };

    if !current {
        RuleMetrics::stale(&rule.name);
        warn!(
            entity = %entity.id(),
            rule = %rule.name,
            generation,
            "Discarding stale async rule result"
        );
        state::refresh(entity);
        return;
    }

    for (name, value) in outcome.writes {
        if let Err(err) = write(entity, &name, value) {
            err.log();
        }
    }
    state::refresh(entity);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::entity::EntitySchema;
    use crate::property::PropertyDef;
    use crate::rules::{RuleKind, RuleRegistration};
    use serde_json::json;

    #[test]
    fn test_cascade_limit_records_error() {
        let config = EngineConfig {
            max_cascade_depth: 3,
            ..EngineConfig::default()
        };
        // Each write to `n` below 5 writes `n + 1`.
        let schema = EntitySchema::builder("Counter")
            .property(PropertyDef::new("n").default_value(0))
            .rule(
                RuleRegistration::from_fn("bump", RuleKind::Derivation, |ctx| {
                    let n: i64 = ctx.get_as("n")?;
                    if n < 5 {
                        ctx.set("n", n + 1)?;
                    }
                    Ok(())
                })
                .triggered_by(["n"])
                .writes(["n"]),
            )
            .config(Arc::new(config))
            .build()
            .unwrap();

        let entity = schema.create();
        entity.set("n", 1).unwrap();
        assert_eq!(entity.get_as::<i64>("n").unwrap(), 4);
        let messages = entity.messages_for("n");
        assert!(messages.iter().any(|m| m.rule == CASCADE_LIMIT_RULE));
        assert!(!entity.is_valid());

        entity.check_rules();
        assert_eq!(entity.get_as::<i64>("n").unwrap(), 5);
        assert!(entity
            .messages_for("n")
            .iter()
            .all(|m| m.rule != CASCADE_LIMIT_RULE));
    }

    #[test]
    fn test_async_rule_without_runtime() {
        let schema = EntitySchema::builder("Lookup")
            .property(PropertyDef::new("code").default_value(""))
            .rule(
                RuleRegistration::from_async_fn("remote", RuleKind::Validation, |_input| async {
                    RuleOutcome::new()
                })
                .triggered_by(["code"]),
            )
            .build()
            .unwrap();

        let entity = schema.create();
        entity.set("code", "X").unwrap();
        let messages = entity.messages_for("code");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].code.as_deref(), Some("RuntimeUnavailable"));
        assert!(!entity.is_busy());
    }

    #[test]
    fn test_failing_rule_becomes_message() {
        let schema = EntitySchema::builder("Thing")
            .property(PropertyDef::new("x").default_value(0))
            .rule(
                RuleRegistration::from_fn("typed", RuleKind::Validation, |ctx| {
                    let _: String = ctx.get_as("x")?;
                    Ok(())
                })
                .triggered_by(["x"]),
            )
            .build()
            .unwrap();

        let entity = schema.create();
        entity.write("x", json!(5)).unwrap();
        let messages = entity.messages_for("x");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].code.as_deref(), Some("TypeMismatch"));
    }
}
