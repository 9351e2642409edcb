//! Dependency ordering between independently reconciled resources.
//!
//! A cluster cannot be created before the role, instance profile and security
//! groups it references exist. Those resources can be reconciled concurrently
//! by the caller as long as each one starts only after everything it depends
//! on has completed. [`DependencyGraph`] computes that schedule; the
//! per-resource precondition is [`unmet_dependencies`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;

use thiserror::Error;

/// The graph contains a cycle, so no valid order exists.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("dependency cycle among {remaining:?}")]
pub struct CycleError<K: Debug> {
    /// Nodes that could not be scheduled.
    pub remaining: Vec<K>,
}

/// Returns the entries of `required` that are not yet in `completed`,
/// preserving the order of `required`.
pub fn unmet_dependencies<K: Ord + Clone>(required: &[K], completed: &BTreeSet<K>) -> Vec<K> {
    required
        .iter()
        .filter(|k| !completed.contains(k))
        .cloned()
        .collect()
}

/// Directed graph of "depends on" edges.
#[derive(Debug, Clone)]
pub struct DependencyGraph<K> {
    /// node -> the nodes it depends on
    edges: BTreeMap<K, BTreeSet<K>>,
}

impl<K> Default for DependencyGraph<K> {
    fn default() -> Self {
        Self {
            edges: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Clone + Debug> DependencyGraph<K> {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node without dependencies. Idempotent.
    pub fn add_node(&mut self, node: K) {
        self.edges.entry(node).or_default();
    }

    /// Record that `dependent` must wait for `dependency`.
    pub fn add_dependency(&mut self, dependent: K, dependency: K) {
        self.add_node(dependency.clone());
        self.edges.entry(dependent).or_default().insert(dependency);
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    /// Returns true if the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Direct dependencies of a node.
    pub fn dependencies_of(&self, node: &K) -> impl Iterator<Item = &K> {
        self.edges.get(node).into_iter().flatten()
    }

    /// Nodes not yet completed whose dependencies have all completed.
    pub fn ready(&self, completed: &BTreeSet<K>) -> Vec<K> {
        self.edges
            .iter()
            .filter(|(node, deps)| !completed.contains(*node) && deps.is_subset(completed))
            .map(|(node, _)| node.clone())
            .collect()
    }

    /// Group nodes into waves; every node's dependencies lie in earlier waves.
    pub fn topological_order(&self) -> Result<Vec<Vec<K>>, CycleError<K>> {
        let mut completed = BTreeSet::new();
        let mut waves = Vec::new();

        while completed.len() < self.edges.len() {
            let wave = self.ready(&completed);
            if wave.is_empty() {
                let remaining = self
                    .edges
                    .keys()
                    .filter(|k| !completed.contains(*k))
                    .cloned()
                    .collect();
                return Err(CycleError { remaining });
            }
            completed.extend(wave.iter().cloned());
            waves.push(wave);
        }

        Ok(waves)
    }
}
