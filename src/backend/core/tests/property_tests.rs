//! Integration tests for property access, change tracking, derivations,
//! and change notifications.

use serde_json::json;
use trellis_core::entity::{EntityEvent, EntitySchema};
use trellis_core::property::PropertyDef;
use trellis_core::rules::{RuleContext, RuleRegistration};
use trellis_core::ErrorCode;

fn full_name(ctx: &RuleContext<'_>) -> trellis_core::Result<serde_json::Value> {
    let parts: Vec<String> = ["first", "last"]
        .iter()
        .filter_map(|name| ctx.value(name).ok())
        .filter_map(|value| value.as_str().map(str::to_string))
        .filter(|part| !part.is_empty())
        .collect();
    Ok(json!(parts.join(" ")))
}

fn person_schema() -> EntitySchema {
    EntitySchema::builder("Person")
        .properties(["first", "last", "full"])
        .property(PropertyDef::new("age").default_value(0))
        .rule(RuleRegistration::derive("full-name", ["first", "last"], "full", full_name))
        .build()
        .unwrap()
}

#[test]
fn test_derived_property_follows_inputs() {
    let person = person_schema().create();

    person.set("first", "Jane").unwrap();
    assert_eq!(person.get("full").unwrap(), json!("Jane"));

    person.set("last", "Doe").unwrap();
    assert_eq!(person.get("full").unwrap(), json!("Jane Doe"));
    assert!(person.is_property_modified("full"));
}

#[test]
fn test_default_values() {
    let person = person_schema().create();
    assert_eq!(person.get_as::<i64>("age").unwrap(), 0);
    assert!(person.get("first").unwrap().is_null());
}

#[test]
fn test_writing_back_committed_value_clears_modified() {
    let person = person_schema().create();
    person.load("first", json!("Ada")).unwrap();
    assert!(!person.is_property_modified("first"));

    person.set("first", "Grace").unwrap();
    assert!(person.is_property_modified("first"));

    person.set("first", "Ada").unwrap();
    assert!(!person.is_property_modified("first"));
}

#[test]
fn test_force_modify_marks_without_changing_values() {
    let person = person_schema().create();
    person.load("age", json!(30)).unwrap();

    person.force_modify(Some("age")).unwrap();
    assert!(person.is_property_modified("age"));
    assert_eq!(person.get_as::<i64>("age").unwrap(), 30);

    person.force_modify(None).unwrap();
    assert_eq!(person.modified_properties().len(), 4);
}

#[test]
fn test_unknown_property_and_type_errors() {
    let person = person_schema().create();

    let err = person.set("nickname", "Al").unwrap_err();
    assert_eq!(err.code(), ErrorCode::PropertyNotFound);

    person.set("age", "forty").unwrap();
    let err = person.get_as::<u32>("age").unwrap_err();
    assert_eq!(err.code(), ErrorCode::TypeMismatch);
}

#[test]
fn test_property_change_event() {
    let person = person_schema().create();
    let mut events = person.subscribe();

    assert!(person.set("age", 41).unwrap());

    let first = events.try_recv().unwrap();
    assert_eq!(
        first,
        EntityEvent::PropertyChanged {
            entity: person.id(),
            property: "age".into(),
            old: json!(0),
            new: json!(41),
        }
    );
}

#[test]
fn test_unchanged_write_publishes_nothing() {
    let person = person_schema().create();
    person.set("age", 41).unwrap();
    let mut events = person.subscribe();

    assert!(!person.set("age", 41).unwrap());
    assert!(events.try_recv().is_err());
}

#[test]
fn test_paused_writes_batch_on_resume() {
    let person = person_schema().create();
    let mut events = person.subscribe();

    {
        let _pause = person.pause();
        person.set("first", "Jane").unwrap();
        person.set("last", "Doe").unwrap();
        assert_eq!(person.get("full").unwrap(), json!(""));
        assert!(events.try_recv().is_err());
    }

    assert_eq!(person.get("full").unwrap(), json!("Jane Doe"));

    let mut saw_batch = false;
    while let Ok(event) = events.try_recv() {
        if let EntityEvent::BatchChanged { properties, .. } = event {
            assert!(properties.contains(&"first".to_string()));
            assert!(properties.contains(&"last".to_string()));
            saw_batch = true;
        }
    }
    assert!(saw_batch);
}
