//! Property dependency graph built from rule trigger sets and outputs.
//!
//! An edge `a -> b` means a rule triggered by `a` writes `b`. Strongly
//! connected components with more than one property (or a self-loop) are
//! cascade cycles. They are reported, not rejected: `load` is the escape
//! hatch a rule uses to break one.

use std::collections::HashMap;

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};

use super::rule::RuleRegistration;

/// Directed graph over property names.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    graph: DiGraph<String, String>,
    index: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a set of registrations.
    pub fn from_rules<'a>(rules: impl IntoIterator<Item = &'a RuleRegistration>) -> Self {
        let mut graph = Self::new();
        for rule in rules {
            graph.add_rule(rule);
        }
        graph
    }

    pub fn add_rule(&mut self, rule: &RuleRegistration) {
        for trigger in &rule.triggers {
            for output in &rule.outputs {
                let from = self.node(trigger);
                let to = self.node(output);
                self.graph.add_edge(from, to, rule.name.clone());
            }
        }
    }

    fn node(&mut self, name: &str) -> NodeIndex {
        if let Some(&idx) = self.index.get(name) {
            return idx;
        }
        let idx = self.graph.add_node(name.to_string());
        self.index.insert(name.to_string(), idx);
        idx
    }

    /// Properties whose change can write `name`, directly.
    pub fn writers_of(&self, name: &str) -> Vec<String> {
        let Some(&idx) = self.index.get(name) else {
            return Vec::new();
        };
        let mut names: Vec<String> = self
            .graph
            .neighbors_directed(idx, petgraph::Direction::Incoming)
            .map(|n| self.graph[n].clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Cascade cycles, each as a sorted list of property names.
    pub fn cycles(&self) -> Vec<Vec<String>> {
        let mut cycles: Vec<Vec<String>> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|component| {
                component.len() > 1
                    || component
                        .first()
                        .map(|&n| self.graph.find_edge(n, n).is_some())
                        .unwrap_or(false)
            })
            .map(|component| {
                let mut names: Vec<String> =
                    component.into_iter().map(|n| self.graph[n].clone()).collect();
                names.sort();
                names
            })
            .collect();
        cycles.sort();
        cycles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::rule::RuleKind;

    fn writes(name: &str, from: &[&str], to: &[&str]) -> RuleRegistration {
        RuleRegistration::from_fn(name, RuleKind::Derivation, |_| Ok(()))
            .triggered_by(from.iter().copied())
            .writes(to.iter().copied())
    }

    #[test]
    fn test_acyclic() {
        let rules = vec![
            writes("full", &["first", "last"], &["full"]),
            writes("initials", &["full"], &["initials"]),
        ];
        let graph = DependencyGraph::from_rules(&rules);
        assert!(graph.cycles().is_empty());
        assert_eq!(graph.writers_of("full"), vec!["first", "last"]);
    }

    #[test]
    fn test_alternating_cycle() {
        let rules = vec![
            writes("a_to_b", &["a"], &["b"]),
            writes("b_to_a", &["b"], &["a"]),
            writes("c", &["c"], &["c"]),
        ];
        let graph = DependencyGraph::from_rules(&rules);
        assert_eq!(
            graph.cycles(),
            vec![vec!["a".to_string(), "b".to_string()], vec!["c".to_string()]]
        );
    }
}
