//! Dependency graph with a deterministic topological order.
//!
//! Used twice: for modules (declared dependencies) and for entity types (table foreign keys).

use crate::error::CloudrowError;
use std::collections::{BTreeMap, BTreeSet};

/// Edges point from dependent to dependency: if A depends on B, B sorts before A.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// node -> nodes it depends on
    edges: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, id: impl Into<String>) {
        self.edges.entry(id.into()).or_default();
    }

    /// Declare that `from` depends on `to`. Edges to nodes never added are ignored by the sort.
    pub fn add_edge(&mut self, from: &str, to: &str) {
        self.edges
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string());
    }

    pub fn contains(&self, id: &str) -> bool {
        self.edges.contains_key(id)
    }

    pub fn dependencies_of(&self, id: &str) -> impl Iterator<Item = &str> {
        self.edges
            .get(id)
            .into_iter()
            .flatten()
            .filter(|d| self.edges.contains_key(*d))
            .map(String::as_str)
    }

    /// Kahn's algorithm; among nodes ready at the same time the smallest name goes first.
    pub fn topological_sort(&self) -> Result<Vec<String>, CloudrowError> {
        let mut remaining: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for id in self.edges.keys() {
            let deps: Vec<&str> = self.dependencies_of(id).filter(|d| *d != id).collect();
            remaining.insert(id.as_str(), deps.len());
            for dep in deps {
                dependents.entry(dep).or_default().push(id.as_str());
            }
        }

        let mut ready: BTreeSet<&str> = remaining
            .iter()
            .filter(|&(_, &n)| n == 0)
            .map(|(&id, _)| id)
            .collect();
        let mut order = Vec::with_capacity(self.edges.len());

        while let Some(current) = ready.pop_first() {
            order.push(current.to_string());
            for &dependent in dependents.get(current).into_iter().flatten() {
                if let Some(n) = remaining.get_mut(dependent) {
                    *n -= 1;
                    if *n == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }

        if order.len() != self.edges.len() {
            let sorted: BTreeSet<&str> = order.iter().map(String::as_str).collect();
            let participants = self
                .edges
                .keys()
                .filter(|id| !sorted.contains(id.as_str()))
                .cloned()
                .collect();
            return Err(CloudrowError::DependencyCycle { participants });
        }
        Ok(order)
    }
}
