//! Dependency graph over resource declarations.
//!
//! Edges are inferred from output references when a node is added: an edge
//! `A -> B` means `B` reads an output of `A`. The graph must be validated
//! before execution; validation rejects references to undeclared resources
//! and dependency cycles.

use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::error::GraphError;

use super::node::ResourceNode;

/// Visit state for the depth-first cycle check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    /// On the current DFS path.
    Gray,
    /// Fully explored.
    Black,
}

/// The set of declared resources and their dependency edges.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// Nodes in declaration order.
    nodes: Vec<ResourceNode>,
    /// Name to position in `nodes`.
    index: HashMap<String, usize>,
    /// Node name to the names it depends on.
    dependencies: HashMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node, inferring its edges from the references it holds.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::DuplicateName`] if the name is already declared.
    pub fn add_node(&mut self, node: ResourceNode) -> Result<(), GraphError> {
        if self.index.contains_key(node.name()) {
            return Err(GraphError::DuplicateName {
                name: node.name().to_string(),
            });
        }

        let deps = node.dependencies();
        debug!(
            "Declared {} ({}) with {} dependencies",
            node.name(),
            node.kind(),
            deps.len()
        );

        self.index.insert(node.name().to_string(), self.nodes.len());
        self.dependencies.insert(node.name().to_string(), deps);
        self.nodes.push(node);
        Ok(())
    }

    /// Returns a node by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ResourceNode> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    /// Returns true if the graph declares `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Iterates nodes in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &ResourceNode> {
        self.nodes.iter()
    }

    /// Returns the number of declared nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if nothing is declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns the names a node depends on.
    #[must_use]
    pub fn dependencies_of(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.dependencies.get(name)
    }

    /// Returns the names of nodes that read from `name`, in declaration order.
    #[must_use]
    pub fn dependents_of(&self, name: &str) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| {
                self.dependencies
                    .get(n.name())
                    .is_some_and(|deps| deps.contains(name))
            })
            .map(ResourceNode::name)
            .collect()
    }

    /// Checks that every reference targets a declared node and that the
    /// graph is acyclic.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::UnknownReference`] or
    /// [`GraphError::CyclicDependency`] naming the cycle.
    pub fn validate(&self) -> Result<(), GraphError> {
        for node in &self.nodes {
            for dep in &self.dependencies[node.name()] {
                if !self.contains(dep) {
                    return Err(GraphError::UnknownReference {
                        from: node.name().to_string(),
                        target: dep.clone(),
                    });
                }
            }
        }

        let mut colors: HashMap<&str, Color> = HashMap::with_capacity(self.nodes.len());
        let mut path: Vec<&str> = Vec::new();

        for node in &self.nodes {
            if !colors.contains_key(node.name()) {
                self.visit(node.name(), &mut colors, &mut path)?;
            }
        }

        Ok(())
    }

    fn visit<'a>(
        &'a self,
        name: &'a str,
        colors: &mut HashMap<&'a str, Color>,
        path: &mut Vec<&'a str>,
    ) -> Result<(), GraphError> {
        colors.insert(name, Color::Gray);
        path.push(name);

        for dep in &self.dependencies[name] {
            match colors.get(dep.as_str()) {
                Some(Color::Gray) => {
                    let start = path.iter().position(|p| *p == dep.as_str()).unwrap_or(0);
                    let mut cycle: Vec<&str> = path[start..].to_vec();
                    cycle.push(dep);
                    return Err(GraphError::CyclicDependency {
                        cycle: cycle.join(" -> "),
                    });
                }
                Some(Color::Black) => {}
                None => self.visit(dep, colors, path)?,
            }
        }

        path.pop();
        colors.insert(name, Color::Black);
        Ok(())
    }

    /// Returns the graph's topological batches.
    ///
    /// Each batch holds every node whose dependencies all lie in earlier
    /// batches. Nodes caught in a cycle are never emitted, so callers must
    /// run [`validate`](Self::validate) first.
    #[must_use]
    pub fn topological_batches(&self) -> TopologicalBatches {
        TopologicalBatches::new(
            self.nodes.iter().map(|n| n.name().to_string()).collect(),
            |name| {
                self.dependencies
                    .get(name)
                    .map(|deps| deps.iter().cloned().collect())
                    .unwrap_or_default()
            },
        )
    }
}

/// Lazy, finite, single-pass sequence of dependency layers.
///
/// Batches are computed one at a time as the iterator advances; names within
/// a batch keep declaration order.
#[derive(Debug)]
pub struct TopologicalBatches {
    /// Declaration position per name.
    position: HashMap<String, usize>,
    /// Name to the names that depend on it.
    dependents: HashMap<String, Vec<String>>,
    /// Unsatisfied dependency count per name.
    pending: HashMap<String, usize>,
    /// The next batch to emit.
    ready: Vec<String>,
}

impl TopologicalBatches {
    /// Builds batches over `names` using `dependencies_of` for the edges.
    ///
    /// Dependencies outside `names` are ignored.
    pub fn new<F>(names: Vec<String>, dependencies_of: F) -> Self
    where
        F: Fn(&str) -> Vec<String>,
    {
        let position: HashMap<String, usize> = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();

        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        let mut pending: HashMap<String, usize> = HashMap::new();

        for name in &names {
            let deps: BTreeSet<String> = dependencies_of(name)
                .into_iter()
                .filter(|d| position.contains_key(d))
                .collect();
            for dep in &deps {
                dependents.entry(dep.clone()).or_default().push(name.clone());
            }
            pending.insert(name.clone(), deps.len());
        }

        let ready = names
            .iter()
            .filter(|name| pending.get(*name).copied() == Some(0))
            .cloned()
            .collect();

        Self {
            position,
            dependents,
            pending,
            ready,
        }
    }
}

impl Iterator for TopologicalBatches {
    type Item = Vec<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.ready.is_empty() {
            return None;
        }

        let batch = std::mem::take(&mut self.ready);
        let mut next = Vec::new();

        for name in &batch {
            let Some(children) = self.dependents.get(name) else {
                continue;
            };
            for child in children {
                if let Some(count) = self.pending.get_mut(child) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        next.push(child.clone());
                    }
                }
            }
        }

        next.sort_by_key(|name| self.position.get(name).copied().unwrap_or(usize::MAX));
        self.ready = next;
        Some(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::node::OutputRef;

    fn node(name: &str, deps: &[&str]) -> ResourceNode {
        deps.iter().fold(ResourceNode::new(name, "test:thing"), |n, dep| {
            n.with_property(format!("from_{dep}"), OutputRef::new(*dep, "id"))
        })
    }

    fn graph(nodes: Vec<ResourceNode>) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        for n in nodes {
            graph.add_node(n).expect("unique names");
        }
        graph
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut graph = DependencyGraph::new();
        graph.add_node(node("instance", &[])).expect("first add");

        let err = graph.add_node(node("instance", &[])).expect_err("duplicate");
        assert_eq!(
            err,
            GraphError::DuplicateName {
                name: String::from("instance")
            }
        );
    }

    #[test]
    fn test_independent_nodes_share_a_batch() {
        let graph = graph(vec![
            node("instance", &[]),
            node("volume", &["instance"]),
            node("network", &[]),
        ]);
        graph.validate().expect("acyclic");

        let batches: Vec<Vec<String>> = graph.topological_batches().collect();
        assert_eq!(
            batches,
            vec![
                vec![String::from("instance"), String::from("network")],
                vec![String::from("volume")],
            ]
        );
    }

    #[test]
    fn test_batches_never_precede_dependencies() {
        let graph = graph(vec![
            node("record", &["domain", "instance"]),
            node("container", &["volume", "network"]),
            node("volume", &["instance"]),
            node("domain", &[]),
            node("network", &[]),
            node("instance", &[]),
        ]);
        graph.validate().expect("acyclic");

        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut total = 0;
        for batch in graph.topological_batches() {
            for name in &batch {
                for dep in graph.dependencies_of(name).expect("declared") {
                    assert!(seen.contains(dep), "{name} scheduled before {dep}");
                }
            }
            total += batch.len();
            seen.extend(batch);
        }
        assert_eq!(total, graph.len());
    }

    #[test]
    fn test_cycle_is_named() {
        let graph = graph(vec![
            node("a", &["c"]),
            node("b", &["a"]),
            node("c", &["b"]),
        ]);

        let err = graph.validate().expect_err("cycle");
        assert_eq!(
            err,
            GraphError::CyclicDependency {
                cycle: String::from("a -> c -> b -> a")
            }
        );
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let graph = graph(vec![node("a", &["a"])]);
        assert!(matches!(
            graph.validate(),
            Err(GraphError::CyclicDependency { .. })
        ));
    }

    #[test]
    fn test_unknown_reference_rejected() {
        let graph = graph(vec![node("volume", &["instance"])]);
        assert_eq!(
            graph.validate(),
            Err(GraphError::UnknownReference {
                from: String::from("volume"),
                target: String::from("instance"),
            })
        );
    }

    #[test]
    fn test_forward_references_are_allowed() {
        let graph = graph(vec![node("volume", &["instance"]), node("instance", &[])]);
        graph.validate().expect("acyclic");

        let batches: Vec<Vec<String>> = graph.topological_batches().collect();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0], vec![String::from("instance")]);
        assert_eq!(graph.dependents_of("instance"), vec!["volume"]);
    }
}
