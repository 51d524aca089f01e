//! Trigger-set index from property name to rule registrations.

use std::collections::HashMap;
use std::sync::Arc;

use super::rule::{RuleId, RuleRegistration, RuleScope};

/// Registered rules of one scope, indexed by trigger property.
#[derive(Debug, Clone)]
pub struct RuleRegistry {
    scope: RuleScope,
    rules: Vec<Arc<RuleRegistration>>,
    by_trigger: HashMap<String, Vec<usize>>,
}

impl RuleRegistry {
    pub fn new(scope: RuleScope) -> Self {
        Self {
            scope,
            rules: Vec::new(),
            by_trigger: HashMap::new(),
        }
    }

    /// Register a rule under each of its triggers.
    pub fn register(&mut self, rule: RuleRegistration) -> RuleId {
        let index = self.rules.len();
        for trigger in &rule.triggers {
            self.by_trigger.entry(trigger.clone()).or_default().push(index);
        }
        self.rules.push(Arc::new(rule));
        RuleId {
            scope: self.scope,
            index,
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<RuleRegistration>> {
        self.rules.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (RuleId, &Arc<RuleRegistration>)> {
        let scope = self.scope;
        self.rules
            .iter()
            .enumerate()
            .map(move |(index, rule)| (RuleId { scope, index }, rule))
    }

    /// Rules triggered by `name`, in registration order.
    pub fn triggered_by<'a>(
        &'a self,
        name: &str,
    ) -> impl Iterator<Item = (RuleId, &'a Arc<RuleRegistration>)> + 'a {
        let scope = self.scope;
        self.by_trigger
            .get(name)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
            .iter()
            .map(move |&index| (RuleId { scope, index }, &self.rules[index]))
    }
}

/// An ordered, de-duplicated run list.
///
/// Order: rule kind, then scope (type before instance), then registration.
#[derive(Debug, Default)]
pub struct RunList {
    entries: Vec<(RuleId, Arc<RuleRegistration>)>,
}

impl RunList {
    /// Collect the rules of `registries` triggered by any of `names`.
    pub fn triggered(registries: &[&RuleRegistry], names: &[String]) -> Self {
        let mut list = Self::default();
        for registry in registries {
            for name in names {
                for (id, rule) in registry.triggered_by(name) {
                    list.push(id, rule);
                }
            }
        }
        list.sort();
        list
    }

    /// Every rule of `registries`.
    pub fn all(registries: &[&RuleRegistry]) -> Self {
        let mut list = Self::default();
        for registry in registries {
            for (id, rule) in registry.iter() {
                list.push(id, rule);
            }
        }
        list.sort();
        list
    }

    fn push(&mut self, id: RuleId, rule: &Arc<RuleRegistration>) {
        if !self.entries.iter().any(|(existing, _)| *existing == id) {
            self.entries.push((id, Arc::clone(rule)));
        }
    }

    fn sort(&mut self) {
        self.entries.sort_by_key(|(id, rule)| (rule.kind, *id));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_vec(self) -> Vec<(RuleId, Arc<RuleRegistration>)> {
        self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::rule::RuleKind;

    fn rule(name: &str, kind: RuleKind, triggers: &[&str]) -> RuleRegistration {
        RuleRegistration::from_fn(name, kind, |_| Ok(())).triggered_by(triggers.iter().copied())
    }

    #[test]
    fn test_triggered_by_index() {
        let mut reg = RuleRegistry::new(RuleScope::Type);
        reg.register(rule("a", RuleKind::Validation, &["x"]));
        reg.register(rule("b", RuleKind::Validation, &["x", "y"]));
        reg.register(rule("c", RuleKind::Validation, &["y"]));

        let names: Vec<_> = reg.triggered_by("x").map(|(_, r)| r.name.clone()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(reg.triggered_by("z").count(), 0);
    }

    #[test]
    fn test_run_list_dedupes_and_orders() {
        let mut types = RuleRegistry::new(RuleScope::Type);
        types.register(rule("derive", RuleKind::Derivation, &["x"]));
        types.register(rule("check", RuleKind::Validation, &["x", "y"]));
        types.register(rule("shape", RuleKind::Shape, &["y"]));

        let mut instance = RuleRegistry::new(RuleScope::Instance);
        instance.register(rule("local", RuleKind::Validation, &["x"]));

        let names = vec!["x".to_string(), "y".to_string()];
        let run = RunList::triggered(&[&types, &instance], &names);
        let order: Vec<_> = run.into_vec().into_iter().map(|(_, r)| r.name.clone()).collect();
        assert_eq!(order, vec!["shape", "check", "local", "derive"]);
    }

    #[test]
    fn test_run_list_all() {
        let mut types = RuleRegistry::new(RuleScope::Type);
        types.register(rule("one", RuleKind::Validation, &["x"]));
        types.register(rule("two", RuleKind::Shape, &[]));
        let run = RunList::all(&[&types]);
        assert_eq!(run.len(), 2);
    }
}
