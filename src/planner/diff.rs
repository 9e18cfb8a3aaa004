//! Diff engine for comparing declarations against recorded state.
//!
//! This module computes, per logical name, how the declared stack differs
//! from the state recorded by the last run.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::debug;

use crate::graph::{DependencyGraph, OutputRef, ResourceNode};
use crate::state::{ResourceRecord, StateSnapshot};

/// Engine for computing diffs between declared and recorded states.
#[derive(Debug, Default)]
pub struct DiffEngine;

/// Difference for a single resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceDiff {
    /// Resource name.
    pub name: String,
    /// Resource kind (declared, or recorded for deletes and retirements).
    pub kind: String,
    /// Type of difference.
    pub diff_type: DiffType,
    /// Recorded kind when a replacement changes it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recorded_kind: Option<String>,
    /// Field-level differences.
    pub details: Vec<DiffDetail>,
}

/// Type of difference detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffType {
    /// Resource needs to be created.
    Create,
    /// Resource needs to be updated.
    Update,
    /// Resource changed kind and needs a new resource.
    Replace,
    /// Resource needs to be deleted.
    Delete,
    /// A replaced record still needs to be torn down.
    Retire,
    /// Resource is unchanged.
    NoChange,
}

/// Detail about a specific difference.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiffDetail {
    /// Property that differs.
    pub field: String,
    /// Recorded value.
    pub old_value: Option<Value>,
    /// Declared value, or the input it now resolves to.
    pub new_value: Option<Value>,
}

/// Complete diff result.
#[derive(Debug)]
pub struct DiffResult {
    /// Diffs: declared resources in declaration order, then removed
    /// resources sorted by name, then retirements sorted by name and kind.
    pub diffs: Vec<ResourceDiff>,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the diff between the declared graph and recorded state.
    #[must_use]
    pub fn compute_diff(&self, graph: &DependencyGraph, state: &StateSnapshot) -> DiffResult {
        let mut diffs = Vec::with_capacity(graph.len());

        for node in graph.nodes() {
            diffs.push(Self::compute_node_diff(node, state));
        }

        // BTreeMap iteration yields removed resources sorted by name
        for record in state.resources.values() {
            if !graph.contains(&record.name) {
                debug!("Resource {} was removed from the stack", record.name);
                diffs.push(ResourceDiff {
                    name: record.name.clone(),
                    kind: record.kind.clone(),
                    diff_type: DiffType::Delete,
                    recorded_kind: None,
                    details: Vec::new(),
                });
            }
        }

        let mut retirements: BTreeSet<(String, String)> = state
            .retired
            .iter()
            .map(|r| (r.name.clone(), r.kind.clone()))
            .collect();
        for diff in &diffs {
            if let Some(kind) = &diff.recorded_kind {
                retirements.insert((diff.name.clone(), kind.clone()));
            }
        }
        for (name, kind) in retirements {
            diffs.push(ResourceDiff {
                name,
                kind,
                diff_type: DiffType::Retire,
                recorded_kind: None,
                details: Vec::new(),
            });
        }

        DiffResult { diffs }
    }

    /// Computes the diff for a single declared node.
    fn compute_node_diff(node: &ResourceNode, state: &StateSnapshot) -> ResourceDiff {
        let mut diff = ResourceDiff {
            name: node.name().to_string(),
            kind: node.kind().to_string(),
            diff_type: DiffType::Create,
            recorded_kind: None,
            details: Vec::new(),
        };

        let Some(record) = state.get(node.name()) else {
            debug!("Resource {} needs to be created", node.name());
            return diff;
        };

        diff.details = Self::compute_detailed_diff(node, record);

        if node.kind() != record.kind {
            debug!(
                "Resource {} changed kind from {} to {}",
                node.name(),
                record.kind,
                node.kind()
            );
            diff.diff_type = DiffType::Replace;
            diff.recorded_kind = Some(record.kind.clone());
            return diff;
        }

        if diff.details.is_empty() {
            diff.details = Self::stale_inputs(node, record, state);
        }

        diff.diff_type = if diff.details.is_empty() {
            DiffType::NoChange
        } else {
            debug!(
                "Resource {} changed: {}",
                node.name(),
                diff.details.iter().map(|d| d.field.as_str()).collect::<Vec<_>>().join(", ")
            );
            DiffType::Update
        };
        diff
    }

    /// Compares canonical declared properties, field by field.
    ///
    /// Details come back sorted by field name.
    fn compute_detailed_diff(node: &ResourceNode, record: &ResourceRecord) -> Vec<DiffDetail> {
        let declared = node.declared();

        let fields: BTreeSet<&String> = declared.keys().chain(record.declared.keys()).collect();
        fields
            .into_iter()
            .filter_map(|field| {
                let old_value = record.declared.get(field);
                let new_value = declared.get(field);
                (old_value != new_value).then(|| DiffDetail {
                    field: field.clone(),
                    old_value: old_value.cloned(),
                    new_value: new_value.cloned(),
                })
            })
            .collect()
    }

    /// Finds referencing properties whose recorded input no longer matches
    /// the recorded output it reads.
    ///
    /// This catches a dependent left behind when its upstream changed but
    /// its own update did not go through.
    fn stale_inputs(node: &ResourceNode, record: &ResourceRecord, state: &StateSnapshot) -> Vec<DiffDetail> {
        let lookup = |reference: &OutputRef| {
            state
                .get(&reference.resource)
                .and_then(|upstream| upstream.outputs.get(&reference.attribute).cloned())
        };

        node.properties()
            .iter()
            .filter_map(|(key, value)| {
                let mut references = Vec::new();
                value.collect_references(&mut references);
                if references.is_empty() {
                    return None;
                }

                // Unrecorded upstreams are settled at run time
                let current = value.resolve(&lookup).ok()?;
                let recorded = record.inputs.get(key);
                (recorded != Some(&current)).then(|| DiffDetail {
                    field: key.clone(),
                    old_value: recorded.cloned(),
                    new_value: Some(current),
                })
            })
            .collect()
    }
}

impl std::fmt::Display for DiffType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::Retire => "retire",
            Self::NoChange => "no change",
        };
        write!(f, "{s}")
    }
}
