//! Publication of resolved outputs.
//!
//! The exporter binds export names to resource output cells when the stack
//! is built, and collects the final values once the scheduler is done.

use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tokio::fs;
use tracing::{debug, info};

use crate::error::{ExportError, Result, StateError};
use crate::graph::{DependencyGraph, OutputCell, OutputRef, Outputs};

/// A single export bound to its source cell.
#[derive(Debug, Clone)]
struct ExportBinding {
    /// Published name.
    name: String,
    /// Resource attribute being exported.
    source: OutputRef,
    /// Output cell of the source resource.
    cell: OutputCell<Outputs>,
}

/// Collects named outputs for publication.
#[derive(Debug, Default)]
pub struct Exporter {
    bindings: Vec<ExportBinding>,
}

impl Exporter {
    /// Creates an exporter with no bindings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name` as an export of `source`.
    ///
    /// # Errors
    ///
    /// Returns an error if `source` names a resource the graph lacks.
    pub fn export(
        &mut self,
        name: impl Into<String>,
        source: OutputRef,
        graph: &DependencyGraph,
    ) -> std::result::Result<(), ExportError> {
        let name = name.into();
        let node = graph
            .get(&source.resource)
            .ok_or_else(|| ExportError::UnknownResource {
                name: name.clone(),
                resource: source.resource.clone(),
            })?;

        debug!("Export {name} bound to {source}");
        self.bindings.push(ExportBinding {
            name,
            cell: node.cell().clone(),
            source,
        });
        Ok(())
    }

    /// Returns the number of registered exports.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Returns true if nothing is exported.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Returns the registered export names.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.bindings.iter().map(|b| b.name.as_str()).collect()
    }

    /// Waits for every bound cell and returns the name-to-value mapping.
    ///
    /// # Errors
    ///
    /// Fails if any source resource failed or lacks the exported attribute.
    pub async fn collect(&self) -> std::result::Result<BTreeMap<String, Value>, ExportError> {
        let mut values = BTreeMap::new();

        for binding in &self.bindings {
            let outputs = binding
                .cell
                .wait()
                .await
                .map_err(|cause| ExportError::ExportFailed {
                    name: binding.name.clone(),
                    cause,
                })?;

            let value = outputs.get(&binding.source.attribute).cloned().ok_or_else(|| {
                ExportError::MissingAttribute {
                    name: binding.name.clone(),
                    resource: binding.source.resource.clone(),
                    attribute: binding.source.attribute.clone(),
                }
            })?;

            values.insert(binding.name.clone(), value);
        }

        Ok(values)
    }
}

/// Writes exported outputs as a flat JSON object.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub async fn write_outputs(path: &Path, outputs: &BTreeMap<String, Value>) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }

    let content = serde_json::to_string_pretty(outputs)
        .map_err(|e| StateError::serialization(format!("Failed to serialize outputs: {e}")))?;
    fs::write(path, content).await?;

    info!("Wrote {} outputs to {}", outputs.len(), path.display());
    Ok(())
}
