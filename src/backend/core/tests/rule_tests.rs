//! Integration tests for rule scheduling, async rules, and pending waits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use trellis_core::config::EngineConfig;
use trellis_core::entity::EntitySchema;
use trellis_core::rules::{
    RuleKind, RuleOutcome, RuleRegistration, ShapeConstraint, CASCADE_LIMIT_RULE,
};
use trellis_core::{ErrorCode, NotSavableReason};

fn account_schema() -> EntitySchema {
    EntitySchema::builder("Account")
        .properties(["email", "name"])
        .build()
        .unwrap()
}

fn gated_rule(name: &str, gate: Arc<Notify>) -> RuleRegistration {
    RuleRegistration::from_async_fn(name, RuleKind::Validation, move |_input| {
        let gate = Arc::clone(&gate);
        async move {
            gate.notified().await;
            RuleOutcome::new()
        }
    })
    .triggered_by(["email"])
}

#[test]
fn test_rules_run_by_kind_then_scope_then_registration() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let recorder = |label: &'static str, kind: RuleKind| {
        let log = Arc::clone(&log);
        RuleRegistration::from_fn(label, kind, move |_| {
            log.lock().push(label);
            Ok(())
        })
        .triggered_by(["email"])
    };

    let schema = EntitySchema::builder("Account")
        .property("email")
        .rule(recorder("derive", RuleKind::Derivation))
        .rule(recorder("validate-a", RuleKind::Validation))
        .rule(recorder("shape", RuleKind::Shape))
        .rule(recorder("validate-b", RuleKind::Validation))
        .build()
        .unwrap();

    let account = schema.create();
    account
        .add_rule(recorder("instance-validate", RuleKind::Validation))
        .unwrap();
    log.lock().clear();

    account.set("email", "a@example.com").unwrap();
    assert_eq!(
        *log.lock(),
        vec!["shape", "validate-a", "validate-b", "instance-validate", "derive"]
    );
}

#[test]
fn test_rules_run_only_for_their_triggers() {
    let log = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&log);
    let schema = EntitySchema::builder("Account")
        .properties(["email", "name"])
        .rule(
            RuleRegistration::from_fn("email-only", RuleKind::Validation, move |_| {
                *counter.lock() += 1;
                Ok(())
            })
            .triggered_by(["email"]),
        )
        .build()
        .unwrap();

    let account = schema.create();
    let baseline = *log.lock();
    account.set("name", "Ada").unwrap();
    assert_eq!(*log.lock(), baseline);
    account.set("email", "ada@example.com").unwrap();
    assert_eq!(*log.lock(), baseline + 1);
}

#[test]
fn test_shape_rule_controls_validity() {
    let schema = EntitySchema::builder("Account")
        .property("email")
        .shape("email", ShapeConstraint::Required)
        .shape("email", ShapeConstraint::pattern(r"^[^@]+@[^@]+$").unwrap())
        .build()
        .unwrap();

    let account = schema.create();
    assert!(!account.is_valid());
    assert!(account
        .savable_reasons()
        .contains(&NotSavableReason::Invalid));

    account.set("email", "not-an-address").unwrap();
    assert!(!account.is_valid());
    assert_eq!(account.broken_rules().len(), 1);

    account.set("email", "ada@example.com").unwrap();
    assert!(account.is_valid());
    assert!(account.broken_rules().is_empty());
}

#[tokio::test]
async fn test_async_rule_busy_until_wait_completes() {
    let gate = Arc::new(Notify::new());
    let account = account_schema().create();
    account
        .add_rule(gated_rule("email-unique", Arc::clone(&gate)))
        .unwrap();

    account.set("email", "ada@example.com").unwrap();
    assert!(account.is_busy());
    assert!(account.is_property_busy("email"));
    assert_eq!(account.pending_count(), 1);
    assert!(!account.is_savable());
    assert!(account.savable_reasons().contains(&NotSavableReason::Busy));

    gate.notify_one();
    account
        .wait_for_pending(&CancellationToken::new())
        .await
        .unwrap();

    assert!(!account.is_busy());
    assert_eq!(account.pending_count(), 0);
    assert!(account.is_savable());
}

#[tokio::test]
async fn test_async_rule_messages_applied() {
    let account = account_schema().create();
    account
        .add_rule(
            RuleRegistration::from_async_fn("email-format", RuleKind::Validation, |input| async move {
                let email: Option<String> = input.get_as("email").ok();
                match email {
                    Some(email) if email.contains('@') => RuleOutcome::new(),
                    _ => RuleOutcome::new().error("email", "Email address is malformed"),
                }
            })
            .triggered_by(["email"]),
        )
        .unwrap();
    let cancel = CancellationToken::new();

    account.set("email", "nope").unwrap();
    account.wait_for_pending(&cancel).await.unwrap();
    assert!(!account.is_valid());
    let messages = account.messages_for("email");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].rule, "email-format");

    account.set("email", "ada@example.com").unwrap();
    account.wait_for_pending(&cancel).await.unwrap();
    assert!(account.is_valid());
    assert!(account.messages_for("email").is_empty());
}

#[tokio::test]
async fn test_superseded_async_result_is_discarded() {
    let superseded = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&superseded);
    let account = account_schema().create();
    account
        .add_rule(
            RuleRegistration::from_async_fn("email-lookup", RuleKind::Validation, move |input| {
                let flag = Arc::clone(&flag);
                async move {
                    if input.get("email").and_then(|v| v.as_str()) == Some("slow@example.com") {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        flag.store(input.is_superseded(), Ordering::SeqCst);
                        return RuleOutcome::new().error("email", "stale verdict");
                    }
                    RuleOutcome::new()
                }
            })
            .triggered_by(["email"]),
        )
        .unwrap();

    account.set("email", "slow@example.com").unwrap();
    account.set("email", "fast@example.com").unwrap();
    account
        .wait_for_pending(&CancellationToken::new())
        .await
        .unwrap();

    assert!(superseded.load(Ordering::SeqCst));
    assert!(account.is_valid());
    assert!(!account.is_busy());
    assert!(account.messages_for("email").is_empty());
}

#[tokio::test]
async fn test_cancelled_wait_marks_indeterminate() {
    let gate = Arc::new(Notify::new());
    let account = account_schema().create();
    account
        .add_rule(gated_rule("email-unique", Arc::clone(&gate)))
        .unwrap();
    account.set("email", "ada@example.com").unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = account.wait_for_pending(&cancel).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::Cancelled);
    assert!(account.is_indeterminate());
    assert!(account
        .savable_reasons()
        .contains(&NotSavableReason::Indeterminate));

    account.check_rules();
    assert!(!account.is_indeterminate());
}

#[tokio::test]
async fn test_wait_ignores_runs_started_later() {
    let first_gate = Arc::new(Notify::new());
    let second_gate = Arc::new(Notify::new());
    let account = account_schema().create();
    account
        .add_rule(gated_rule("first", Arc::clone(&first_gate)))
        .unwrap();

    account.set("email", "ada@example.com").unwrap();
    let wait = account.wait_for_pending(&CancellationToken::new());

    account
        .add_rule(
            RuleRegistration::from_async_fn("second", RuleKind::Validation, {
                let gate = Arc::clone(&second_gate);
                move |_input| {
                    let gate = Arc::clone(&gate);
                    async move {
                        gate.notified().await;
                        RuleOutcome::new()
                    }
                }
            })
            .triggered_by(["name"]),
        )
        .unwrap();
    account.set("name", "Ada").unwrap();
    assert_eq!(account.pending_count(), 2);

    first_gate.notify_one();
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("wait should not depend on the later run")
        .unwrap();
    assert_eq!(account.pending_count(), 1);

    second_gate.notify_one();
}

#[tokio::test]
async fn test_async_rule_timeout_becomes_error() {
    let config = EngineConfig {
        async_rule_timeout: Duration::from_millis(50),
        ..EngineConfig::default()
    };
    let schema = EntitySchema::builder("Account")
        .property("email")
        .config(Arc::new(config))
        .build()
        .unwrap();
    let account = schema.create();
    account
        .add_rule(
            RuleRegistration::from_async_fn("never", RuleKind::Validation, |_input| async {
                futures::future::pending::<()>().await;
                RuleOutcome::new()
            })
            .triggered_by(["email"]),
        )
        .unwrap();

    account.set("email", "ada@example.com").unwrap();
    account
        .wait_for_pending(&CancellationToken::new())
        .await
        .unwrap();

    assert!(!account.is_busy());
    assert!(!account.is_valid());
    assert!(account.messages_for("email")[0].text.contains("timed out"));
}

fn pair_schema(config: EngineConfig, back: RuleRegistration) -> EntitySchema {
    EntitySchema::builder("Pair")
        .properties(["a", "b"])
        .rule(RuleRegistration::derive("ab", ["a"], "b", |ctx| ctx.value("a")))
        .rule(back)
        .config(Arc::new(config))
        .build()
        .unwrap()
}

#[test]
fn test_silent_load_breaks_write_cycle() {
    let back = RuleRegistration::from_fn("ba", RuleKind::Derivation, |ctx| {
        let b = ctx.value("b")?;
        ctx.load("a", b)
    })
    .triggered_by(["b"]);
    let pair = pair_schema(EngineConfig::default(), back).create();

    pair.set("a", 7).unwrap();
    assert_eq!(pair.get("a").unwrap(), serde_json::json!(7));
    assert_eq!(pair.get("b").unwrap(), serde_json::json!(7));
    assert!(pair.is_valid());
    assert!(pair
        .broken_rules()
        .iter()
        .all(|m| m.rule != CASCADE_LIMIT_RULE));
}

#[test]
fn test_cascade_limit_keeps_one_message_per_property() {
    let config = EngineConfig {
        max_cascade_depth: 1,
        ..EngineConfig::default()
    };
    let noop = RuleRegistration::from_fn("noop", RuleKind::Validation, |_| Ok(()))
        .triggered_by(["b"]);
    let pair = pair_schema(config, noop).create();

    for n in 1..=5 {
        pair.set("a", n).unwrap();
    }
    assert_eq!(pair.get("b").unwrap(), serde_json::json!(5));
    let limits: Vec<_> = pair
        .messages_for("b")
        .into_iter()
        .filter(|m| m.rule == CASCADE_LIMIT_RULE)
        .collect();
    assert_eq!(limits.len(), 1);
    assert!(!pair.is_valid());
}
