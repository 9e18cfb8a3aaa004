//! Declaration context for building a stack.
//!
//! A [`StackBuilder`] collects resource declarations and exports for one run.
//! Each builder owns its own graph, so independent stacks can be declared
//! side by side.

use tracing::debug;

use crate::config::StackConfig;
use crate::error::{GraphError, Result};
use crate::export::Exporter;

use super::dependency::DependencyGraph;
use super::node::{OutputRef, PropertyValue, ResourceNode};

/// Handle to a declared resource, used to reference its outputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceHandle {
    /// Logical name of the declared resource.
    name: String,
}

impl ResourceHandle {
    /// Returns the resource's logical name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// References one of the resource's outputs.
    #[must_use]
    pub fn output(&self, attribute: &str) -> OutputRef {
        OutputRef::new(&self.name, attribute)
    }

    /// References the provider-assigned id.
    #[must_use]
    pub fn id(&self) -> OutputRef {
        self.output("id")
    }
}

/// A validated stack ready for planning.
#[derive(Debug)]
pub struct DeclaredStack {
    /// The validated dependency graph.
    pub graph: DependencyGraph,
    /// Exports bound to the graph's output cells.
    pub exporter: Exporter,
}

/// Collects declarations for one stack.
#[derive(Debug, Default)]
pub struct StackBuilder {
    /// Declared resources.
    graph: DependencyGraph,
    /// Requested exports, bound at build time.
    exports: Vec<(String, OutputRef)>,
}

impl StackBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a resource.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::DuplicateName`] if the name is taken.
    pub fn declare(&mut self, node: ResourceNode) -> std::result::Result<ResourceHandle, GraphError> {
        let name = node.name().to_string();
        self.graph.add_node(node)?;
        Ok(ResourceHandle { name })
    }

    /// Requests that an output be published under `name` after the run.
    pub fn export(&mut self, name: impl Into<String>, source: OutputRef) {
        self.exports.push((name.into(), source));
    }

    /// Builds a builder from a parsed stack file.
    ///
    /// # Errors
    ///
    /// Returns an error if a property holds a malformed reference or a
    /// resource name is declared twice.
    pub fn from_config(config: &StackConfig) -> Result<Self> {
        let mut builder = Self::new();

        for resource in &config.resources {
            let mut node = ResourceNode::new(&resource.name, &resource.kind);
            for (key, value) in &resource.properties {
                node.set_property(key, PropertyValue::from_json(value.clone())?);
            }
            builder.declare(node)?;
        }

        for (name, expression) in &config.outputs {
            let source = OutputRef::parse_expression(expression)?.ok_or_else(|| {
                crate::error::ConfigError::InvalidReference {
                    reference: expression.clone(),
                }
            })?;
            builder.export(name, source);
        }

        debug!(
            "Loaded {} declarations and {} exports from stack '{}'",
            builder.graph.len(),
            builder.exports.len(),
            config.stack.name
        );

        Ok(builder)
    }

    /// Validates the graph and binds exports to output cells.
    ///
    /// # Errors
    ///
    /// Returns a graph error for unknown references or cycles, or an export
    /// error if an export targets an undeclared resource.
    pub fn build(self) -> Result<DeclaredStack> {
        self.graph.validate()?;

        let mut exporter = Exporter::new();
        for (name, source) in self.exports {
            exporter.export(name, source, &self.graph)?;
        }

        Ok(DeclaredStack {
            graph: self.graph,
            exporter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StratumError;

    #[test]
    fn test_handles_wire_dependencies() {
        let mut stack = StackBuilder::new();
        let instance = stack
            .declare(ResourceNode::new("seafileInstance", "linode:instance"))
            .expect("declare instance");
        stack
            .declare(
                ResourceNode::new("seafileVolume", "linode:volume")
                    .with_property("size", 50_i64)
                    .with_property("linodeId", instance.id()),
            )
            .expect("declare volume");
        stack.export("instanceIpAddress", instance.output("ipAddress"));

        let declared = stack.build().expect("valid stack");
        let deps = declared
            .graph
            .dependencies_of("seafileVolume")
            .expect("declared");
        assert!(deps.contains("seafileInstance"));
        assert_eq!(declared.exporter.len(), 1);
    }

    #[test]
    fn test_builders_are_independent() {
        let mut first = StackBuilder::new();
        let mut second = StackBuilder::new();

        first
            .declare(ResourceNode::new("network", "docker:network"))
            .expect("declare in first");
        second
            .declare(ResourceNode::new("network", "docker:network"))
            .expect("same name in a separate builder");

        assert_eq!(first.build().expect("valid").graph.len(), 1);
        assert_eq!(second.build().expect("valid").graph.len(), 1);
    }

    #[test]
    fn test_build_rejects_cycles() {
        let mut stack = StackBuilder::new();
        stack
            .declare(ResourceNode::new("a", "t:x").with_property("p", OutputRef::new("b", "id")))
            .expect("declare a");
        stack
            .declare(ResourceNode::new("b", "t:x").with_property("p", OutputRef::new("a", "id")))
            .expect("declare b");

        let err = stack.build().expect_err("cycle");
        assert!(matches!(
            err,
            StratumError::Graph(GraphError::CyclicDependency { .. })
        ));
    }
}
