//! Declaration hashing for change detection.
//!
//! This module provides deterministic hashing of resource declarations so
//! that recorded state can be compared with the current stack cheaply.

use sha2::{Digest, Sha256};

use crate::graph::{DependencyGraph, ResourceNode};

/// Hasher for computing declaration hashes.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the whole declared stack.
    ///
    /// The hash changes when any node is added, removed or altered.
    #[must_use]
    pub fn hash_stack(&self, name: &str, graph: &DependencyGraph) -> String {
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());

        // Sorted by name so declaration order does not matter
        let mut nodes: Vec<&ResourceNode> = graph.nodes().collect();
        nodes.sort_by(|a, b| a.name().cmp(b.name()));
        for node in nodes {
            hasher.update(node.name().as_bytes());
            hasher.update(self.hash_node(node).as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a hash for a single declaration.
    ///
    /// Covers the kind and the canonical properties, where references are
    /// hashed by what they point to rather than by value.
    #[must_use]
    pub fn hash_node(&self, node: &ResourceNode) -> String {
        let mut hasher = Sha256::new();

        hasher.update(node.kind().as_bytes());
        hasher.update([0u8]);

        // BTreeMap keys serialize in order, so the JSON is canonical
        for (key, value) in node.declared() {
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            hasher.update(value.to_string().as_bytes());
            hasher.update([0u8]);
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::OutputRef;

    fn volume(size: i64) -> ResourceNode {
        ResourceNode::new("seafileVolume", "linode:volume")
            .with_property("size", size)
            .with_property("linodeId", OutputRef::new("seafileInstance", "id"))
    }

    #[test]
    fn test_node_hash_deterministic() {
        let hasher = ConfigHasher::new();
        assert_eq!(hasher.hash_node(&volume(50)), hasher.hash_node(&volume(50)));
    }

    #[test]
    fn test_changed_property_changes_hash() {
        let hasher = ConfigHasher::new();
        assert_ne!(hasher.hash_node(&volume(50)), hasher.hash_node(&volume(100)));
    }

    #[test]
    fn test_kind_is_hashed() {
        let hasher = ConfigHasher::new();
        let a = ResourceNode::new("x", "linode:volume");
        let b = ResourceNode::new("x", "linode:instance");
        assert_ne!(hasher.hash_node(&a), hasher.hash_node(&b));
    }

    #[test]
    fn test_stack_hash_ignores_declaration_order() {
        let hasher = ConfigHasher::new();

        let mut first = DependencyGraph::new();
        first.add_node(ResourceNode::new("a", "linode:instance")).expect("add");
        first.add_node(ResourceNode::new("b", "docker:network")).expect("add");

        let mut second = DependencyGraph::new();
        second.add_node(ResourceNode::new("b", "docker:network")).expect("add");
        second.add_node(ResourceNode::new("a", "linode:instance")).expect("add");

        assert_eq!(
            hasher.hash_stack("seafile", &first),
            hasher.hash_stack("seafile", &second)
        );
        assert_ne!(
            hasher.hash_stack("seafile", &first),
            hasher.hash_stack("other", &first)
        );
    }

    #[test]
    fn test_short_hash() {
        let hasher = ConfigHasher::new();
        let full_hash = "abcdef1234567890abcdef1234567890";
        let short = hasher.short_hash(full_hash);

        assert_eq!(short, "abcdef12");
        assert_eq!(short.len(), 8);
    }
}
