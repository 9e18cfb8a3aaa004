//! Resource declarations and their dependency graph.
//!
//! This module holds the declaration side of the engine: output cells that
//! carry values produced by providers, resource nodes whose properties
//! reference those cells, and the graph that orders nodes for execution.

mod builder;
mod cell;
mod dependency;
mod node;

pub use builder::{DeclaredStack, ResourceHandle, StackBuilder};
pub use cell::{CellState, OutputCell};
pub use dependency::{DependencyGraph, TopologicalBatches};
pub use node::{OutputRef, Outputs, PropertyValue, ResourceNode};
