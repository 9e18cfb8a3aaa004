//! Execution plan types and construction.
//!
//! A plan lists, for every declared or recorded resource, the action a run
//! will take. It is computed from a diff and consumed by the scheduler.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::graph::DependencyGraph;
use crate::state::StateSnapshot;

use super::diff::{DiffDetail, DiffEngine, DiffType};

/// A complete execution plan.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Planned entries: declared resources in declaration order, then
    /// deletes sorted by name, then retirements sorted by name and kind.
    pub entries: Vec<PlanEntry>,
}

/// The planned action for one resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanEntry {
    /// Logical name.
    pub name: String,
    /// Resource kind.
    pub kind: String,
    /// What the run will do.
    pub action: PlanAction,
    /// Field-level differences behind an update.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<DiffDetail>,
}

/// Actions a plan can schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlanAction {
    /// Resource is declared but not recorded.
    Create,
    /// Resource is recorded with different declarations, or reads an
    /// upstream output that changed since it was applied.
    Update {
        /// Changed property names, sorted.
        changed: Vec<String>,
    },
    /// Resource is recorded with another kind; a new one is created and the
    /// old one retired.
    Replace {
        /// Kind of the record being replaced.
        previous_kind: String,
    },
    /// Resource is recorded but no longer declared.
    Delete,
    /// A replaced record of this kind is torn down after the new resource
    /// converged.
    Retire,
    /// Declarations match the record.
    NoOp,
}

/// Action counts for a plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    /// Resources to create.
    pub create: usize,
    /// Resources to update.
    pub update: usize,
    /// Resources to replace.
    pub replace: usize,
    /// Resources to delete, retirements included.
    pub delete: usize,
    /// Resources left alone.
    pub noop: usize,
}

impl Plan {
    /// Computes the plan that moves `state` to the declarations in `graph`.
    ///
    /// Deterministic: the same inputs always yield the same entries in the
    /// same order.
    #[must_use]
    pub fn compute(graph: &DependencyGraph, state: &StateSnapshot) -> Self {
        let diff = DiffEngine::new().compute_diff(graph, state);

        let entries = diff
            .diffs
            .into_iter()
            .map(|d| {
                let action = match d.diff_type {
                    DiffType::Create => PlanAction::Create,
                    DiffType::Update => PlanAction::Update {
                        changed: d.details.iter().map(|detail| detail.field.clone()).collect(),
                    },
                    DiffType::Replace => PlanAction::Replace {
                        previous_kind: d.recorded_kind.unwrap_or_default(),
                    },
                    DiffType::Delete => PlanAction::Delete,
                    DiffType::Retire => PlanAction::Retire,
                    DiffType::NoChange => PlanAction::NoOp,
                };
                PlanEntry {
                    name: d.name,
                    kind: d.kind,
                    action,
                    details: d.details,
                }
            })
            .collect();

        Self {
            created_at: Utc::now(),
            entries,
        }
    }

    /// Gets the entry for a resource.
    ///
    /// A replaced resource also has a retirement entry; this returns the
    /// declared one.
    #[must_use]
    pub fn entry(&self, name: &str) -> Option<&PlanEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Returns the entries that tear a resource down, in plan order.
    pub fn deletes(&self) -> impl Iterator<Item = &PlanEntry> {
        self.entries.iter().filter(|e| e.action.is_teardown())
    }

    /// Returns true if every entry is a no-op.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.entries.iter().all(|e| e.action == PlanAction::NoOp)
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the plan has no entries at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Counts entries by action.
    #[must_use]
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for entry in &self.entries {
            match entry.action {
                PlanAction::Create => summary.create += 1,
                PlanAction::Update { .. } => summary.update += 1,
                PlanAction::Replace { .. } => summary.replace += 1,
                PlanAction::Delete | PlanAction::Retire => summary.delete += 1,
                PlanAction::NoOp => summary.noop += 1,
            }
        }
        summary
    }
}

impl PlanAction {
    /// Returns a short symbol for listings.
    #[must_use]
    pub const fn symbol(&self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update { .. } => "~",
            Self::Replace { .. } => "±",
            Self::Delete | Self::Retire => "-",
            Self::NoOp => " ",
        }
    }

    /// Returns true for actions that remove a recorded resource.
    #[must_use]
    pub const fn is_teardown(&self) -> bool {
        matches!(self, Self::Delete | Self::Retire)
    }
}

impl std::fmt::Display for PlanAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update { changed } => write!(f, "update ({})", changed.join(", ")),
            Self::Replace { previous_kind } => write!(f, "replace (was {previous_kind})"),
            Self::Delete => write!(f, "delete"),
            Self::Retire => write!(f, "retire"),
            Self::NoOp => write!(f, "no-op"),
        }
    }
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to replace, {} to delete, {} unchanged",
            self.create, self.update, self.replace, self.delete, self.noop
        )
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for entry in &self.entries {
            writeln!(
                f,
                "{} {} ({}): {}",
                entry.action.symbol(),
                entry.name,
                entry.kind,
                entry.action
            )?;
        }
        write!(f, "{}", self.summary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{OutputRef, ResourceNode};
    use crate::state::ResourceRecord;

    fn graph() -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        graph
            .add_node(ResourceNode::new("seafileInstance", "linode:instance").with_property("type", "g6-standard-1"))
            .expect("add");
        graph
            .add_node(
                ResourceNode::new("seafileVolume", "linode:volume")
                    .with_property("size", 50_i64)
                    .with_property("linodeId", OutputRef::new("seafileInstance", "id")),
            )
            .expect("add");
        graph
    }

    fn record(node: &ResourceNode) -> ResourceRecord {
        let mut record = ResourceRecord::new(node.name(), node.kind());
        record.declared = node.declared();
        record
    }

    #[test]
    fn test_fresh_stack_is_all_creates() {
        let plan = Plan::compute(&graph(), &StateSnapshot::new("seafile", "dev"));

        assert_eq!(plan.len(), 2);
        assert!(plan.entries.iter().all(|e| e.action == PlanAction::Create));
        assert_eq!(
            plan.summary(),
            PlanSummary {
                create: 2,
                ..PlanSummary::default()
            }
        );
    }

    #[test]
    fn test_recorded_stack_is_noop() {
        let graph = graph();
        let mut state = StateSnapshot::new("seafile", "dev");
        for node in graph.nodes() {
            state.set(record(node));
        }

        let plan = Plan::compute(&graph, &state);
        assert!(plan.is_noop());
    }

    #[test]
    fn test_update_lists_changed_properties() {
        let graph = graph();
        let mut state = StateSnapshot::new("seafile", "dev");
        for node in graph.nodes() {
            let mut rec = record(node);
            if rec.name == "seafileVolume" {
                rec.declared.insert(String::from("size"), serde_json::json!(20));
            }
            state.set(rec);
        }
        state.set(ResourceRecord::new("seafileDomain", "linode:domain"));

        let plan = Plan::compute(&graph, &state);
        assert_eq!(
            plan.entry("seafileVolume").map(|e| &e.action),
            Some(&PlanAction::Update {
                changed: vec![String::from("size")]
            })
        );
        assert_eq!(
            plan.deletes().map(|e| e.name.as_str()).collect::<Vec<_>>(),
            vec!["seafileDomain"]
        );
        assert_eq!(
            plan.summary().to_string(),
            "0 to create, 1 to update, 0 to replace, 1 to delete, 1 unchanged"
        );
    }

    #[test]
    fn test_kind_change_plans_replace_and_retire() {
        let graph = graph();
        let mut state = StateSnapshot::new("seafile", "dev");
        for node in graph.nodes() {
            let mut rec = record(node);
            if rec.name == "seafileVolume" {
                rec.kind = String::from("linode:legacy-volume");
            }
            state.set(rec);
        }

        let plan = Plan::compute(&graph, &state);
        assert_eq!(
            plan.entry("seafileVolume").map(|e| &e.action),
            Some(&PlanAction::Replace {
                previous_kind: String::from("linode:legacy-volume")
            })
        );

        let retire: Vec<(&str, &str, &PlanAction)> = plan
            .deletes()
            .map(|e| (e.name.as_str(), e.kind.as_str(), &e.action))
            .collect();
        assert_eq!(
            retire,
            vec![("seafileVolume", "linode:legacy-volume", &PlanAction::Retire)]
        );
        assert!(!plan.is_noop());
        assert_eq!((plan.summary().replace, plan.summary().delete), (1, 1));
    }
}
