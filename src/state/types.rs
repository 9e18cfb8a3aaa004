//! State types for tracking provisioned resources.
//!
//! These types represent the last-known state of a stack, used for planning
//! and idempotent re-execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::graph::Outputs;

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Number of history entries kept in a snapshot.
const MAX_HISTORY: usize = 100;

/// The complete recorded state of a stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// State format version.
    pub version: String,
    /// Stack name.
    pub stack: String,
    /// Environment name.
    pub environment: String,
    /// Hash of the last applied declarations.
    #[serde(default)]
    pub stack_hash: String,
    /// Provisioned resources by logical name.
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceRecord>,
    /// Records replaced by a resource of another kind, still to be torn down.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retired: Vec<ResourceRecord>,
    /// Exported outputs from the last successful collection.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Run history (recent entries).
    #[serde(default)]
    pub history: Vec<RunHistoryEntry>,
}

/// Recorded state of a single resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// Logical name.
    pub name: String,
    /// Kind, `provider:type`.
    pub kind: String,
    /// Provider-assigned id.
    #[serde(default)]
    pub id: Option<String>,
    /// Declared properties in canonical form.
    #[serde(default)]
    pub declared: BTreeMap<String, Value>,
    /// Resolved inputs last sent to the provider.
    #[serde(default)]
    pub inputs: Outputs,
    /// Outputs reported by the provider.
    #[serde(default)]
    pub outputs: Outputs,
    /// Resources this one read from when applied.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// Hash of the declaration when applied.
    #[serde(default)]
    pub config_hash: String,
    /// When the resource was created.
    pub created_at: DateTime<Utc>,
    /// When the resource was last updated.
    pub updated_at: DateTime<Utc>,
}

/// A single entry in the run history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHistoryEntry {
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Type of run.
    pub operation: RunOperation,
    /// Stack hash at time of the run.
    pub stack_hash: String,
    /// Resources touched by the run.
    pub resources: Vec<String>,
    /// Whether every resource converged.
    pub success: bool,
    /// Optional error summary.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOperation {
    /// Converge the stack to its declarations.
    Apply,
    /// Tear every recorded resource down.
    Destroy,
}

impl StateSnapshot {
    /// Creates a new empty snapshot.
    #[must_use]
    pub fn new(stack: &str, environment: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            stack: stack.to_string(),
            environment: environment.to_string(),
            stack_hash: String::new(),
            resources: BTreeMap::new(),
            retired: Vec::new(),
            outputs: BTreeMap::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Gets a resource by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ResourceRecord> {
        self.resources.get(name)
    }

    /// Adds or replaces a resource record.
    pub fn set(&mut self, record: ResourceRecord) {
        self.resources.insert(record.name.clone(), record);
        self.last_updated = Utc::now();
    }

    /// Removes a resource by name.
    pub fn remove(&mut self, name: &str) -> Option<ResourceRecord> {
        let result = self.resources.remove(name);
        if result.is_some() {
            self.last_updated = Utc::now();
        }
        result
    }

    /// Moves a replaced record to the retired list.
    pub fn retire(&mut self, record: ResourceRecord) {
        self.retired
            .retain(|r| !(r.name == record.name && r.kind == record.kind));
        self.retired.push(record);
        self.last_updated = Utc::now();
    }

    /// Gets the retired record for `name` with `kind`.
    #[must_use]
    pub fn retired_record(&self, name: &str, kind: &str) -> Option<&ResourceRecord> {
        self.retired
            .iter()
            .find(|r| r.name == name && r.kind == kind)
    }

    /// Drops the retired record for `name` with `kind`.
    pub fn remove_retired(&mut self, name: &str, kind: &str) -> Option<ResourceRecord> {
        let index = self
            .retired
            .iter()
            .position(|r| r.name == name && r.kind == kind)?;
        self.last_updated = Utc::now();
        Some(self.retired.remove(index))
    }

    /// Returns the names of recorded resources that depend on `name`.
    #[must_use]
    pub fn dependents_of(&self, name: &str) -> Vec<&str> {
        self.resources
            .values()
            .filter(|r| r.dependencies.contains(name))
            .map(|r| r.name.as_str())
            .collect()
    }

    /// Adds a history entry, dropping the oldest beyond the cap.
    pub fn add_history(&mut self, entry: RunHistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            let excess = self.history.len() + 1 - MAX_HISTORY;
            self.history.drain(..excess);
        }
        self.history.push(entry);
    }

    /// Returns all resource names.
    #[must_use]
    pub fn resource_names(&self) -> Vec<&str> {
        self.resources.keys().map(String::as_str).collect()
    }

    /// Returns true if no resource, live or retired, is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.retired.is_empty()
    }
}

impl ResourceRecord {
    /// Creates a record for a freshly applied resource.
    #[must_use]
    pub fn new(name: &str, kind: &str) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            id: None,
            declared: BTreeMap::new(),
            inputs: Outputs::new(),
            outputs: Outputs::new(),
            dependencies: BTreeSet::new(),
            config_hash: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Records a provider result, taking the id from the `id` output.
    pub fn record_outputs(&mut self, inputs: Outputs, outputs: Outputs) {
        if let Some(id) = outputs.get("id").and_then(id_string) {
            self.id = Some(id);
        }
        self.inputs = inputs;
        self.outputs = outputs;
        self.updated_at = Utc::now();
    }
}

/// Renders an id output as a string; providers may report numeric ids.
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl RunHistoryEntry {
    /// Creates a new history entry.
    #[must_use]
    pub fn new(operation: RunOperation, stack_hash: &str, resources: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            stack_hash: stack_hash.to_string(),
            resources,
            success: true,
            error: None,
        }
    }

    /// Creates a failed history entry.
    #[must_use]
    pub fn failed(
        operation: RunOperation,
        stack_hash: &str,
        resources: Vec<String>,
        error: &str,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            stack_hash: stack_hash.to_string(),
            resources,
            success: false,
            error: Some(error.to_string()),
        }
    }
}

impl std::fmt::Display for RunOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
        };
        write!(f, "{op}")
    }
}
