//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying plans, run
//! reports, state and outputs in text or JSON.

use colored::Colorize;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{ConfigHasher, ValidationResult};
use crate::engine::{ApplyReport, DestroyReport};
use crate::planner::{NodeStatus, Plan, PlanAction, RunOutcome, RunReport};
use crate::state::{LockInfo, StateSnapshot};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan entry row for table display.
#[derive(Tabled)]
struct PlanRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Changes")]
    changes: String,
}

/// Run report row for table display.
#[derive(Tabled)]
struct NodeRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Operation")]
    operation: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Time")]
    time: String,
    #[tabled(rename = "Cause")]
    cause: String,
}

/// Recorded resource row for table display.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Depends on")]
    dependencies: String,
    #[tabled(rename = "Hash")]
    hash: String,
}

/// Output row for table display.
#[derive(Tabled)]
struct OutputRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Value")]
    value: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns true if output is JSON.
    #[must_use]
    pub const fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => to_json(plan),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    /// Formats a plan as text.
    fn format_plan_text(plan: &Plan, detailed: bool) -> String {
        if plan.is_noop() {
            return format!("{} No changes. Stack is up to date.\n", "✓".green());
        }

        let mut output = String::from("\nExecution Plan\n\n");

        let rows: Vec<PlanRow> = plan
            .entries
            .iter()
            .filter(|e| e.action != PlanAction::NoOp)
            .enumerate()
            .map(|(i, e)| PlanRow {
                index: i + 1,
                action: Self::format_action(&e.action),
                resource: e.name.clone(),
                kind: e.kind.clone(),
                changes: match &e.action {
                    PlanAction::Update { changed } => Self::truncate(&changed.join(", "), 40),
                    PlanAction::Replace { previous_kind } => format!("was {previous_kind}"),
                    _ => String::new(),
                },
            })
            .collect();

        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            for entry in plan.entries.iter().filter(|e| !e.details.is_empty()) {
                let _ = writeln!(output, "\n  {} {}", "~".yellow(), entry.name);
                for detail in &entry.details {
                    let _ = writeln!(
                        output,
                        "      {}: {} -> {}",
                        detail.field,
                        render_value(detail.old_value.as_ref()).red(),
                        render_value(detail.new_value.as_ref()).green()
                    );
                }
            }
        }

        let summary = plan.summary();
        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to delete, {} unchanged\n",
            summary.create.to_string().green(),
            summary.update.to_string().yellow(),
            summary.replace.to_string().yellow(),
            summary.delete.to_string().red(),
            summary.noop
        );

        output
    }

    /// Formats the result of an apply.
    #[must_use]
    pub fn format_apply(&self, report: &ApplyReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(report),
            OutputFormat::Text => {
                let mut output = Self::format_run_text(&report.run, "Apply");

                if !report.outputs.is_empty() {
                    output.push_str("\nOutputs:\n");
                    for (name, value) in &report.outputs {
                        let _ = writeln!(output, "   {name} = {}", render_value(Some(value)));
                    }
                }
                if let Some(error) = &report.export_error {
                    let _ = writeln!(output, "\n{} Outputs not published: {error}", "⚠".yellow());
                }

                output
            }
        }
    }

    /// Formats the result of a destroy.
    #[must_use]
    pub fn format_destroy(&self, report: &DestroyReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(report),
            OutputFormat::Text => Self::format_run_text(&report.run, "Destroy"),
        }
    }

    /// Formats a run report as text.
    fn format_run_text(run: &RunReport, verb: &str) -> String {
        let mut output = String::new();

        let rows: Vec<NodeRow> = run
            .nodes
            .iter()
            .filter(|n| n.operation.is_some() || n.status != NodeStatus::Resolved)
            .map(|n| NodeRow {
                resource: n.name.clone(),
                operation: n.operation.map_or_else(|| String::from("-"), |op| op.to_string()),
                status: Self::format_status(n.status),
                time: if n.operation.is_some() {
                    format!("{}ms", n.duration_ms)
                } else {
                    String::new()
                },
                cause: n
                    .cause
                    .as_ref()
                    .map(|c| Self::truncate(&c.to_string(), 50))
                    .unwrap_or_default(),
            })
            .collect();

        if !rows.is_empty() {
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        match &run.outcome {
            RunOutcome::Success => {
                let _ = writeln!(
                    output,
                    "\n{} {verb} complete: {} resources converged",
                    "✓".green(),
                    run.nodes.len()
                );
            }
            RunOutcome::PartialFailure { failures } => {
                let _ = writeln!(
                    output,
                    "\n{} {verb} incomplete: {} of {} resources did not converge",
                    "✗".red(),
                    failures.len(),
                    run.nodes.len()
                );
                if run.cancelled {
                    let _ = writeln!(output, "   Run was cancelled.");
                }
            }
        }

        output
    }

    /// Formats a validation result.
    #[must_use]
    pub fn format_validation(&self, result: &ValidationResult, show_warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => to_json(result),
            OutputFormat::Text => {
                let mut output = if result.is_valid() {
                    format!("{} Stack is valid.\n", "✓".green())
                } else {
                    let mut output = format!("{} Stack is invalid:\n", "✗".red());
                    for error in &result.errors {
                        let _ = writeln!(output, "   - {}: {}", error.field, error.message);
                    }
                    output
                };

                if show_warnings && !result.warnings.is_empty() {
                    let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                } else if result.warning_count() > 0 {
                    let _ = writeln!(
                        output,
                        "   ({} warnings, use --warnings to show)",
                        result.warning_count()
                    );
                }

                output
            }
        }
    }

    /// Formats recorded state.
    #[must_use]
    pub fn format_state(&self, state: &StateSnapshot, lock: Option<&LockInfo>) -> String {
        match self.format {
            OutputFormat::Json => to_json(state),
            OutputFormat::Text => {
                let hasher = ConfigHasher::new();
                let mut output = String::new();

                let _ = write!(output, "\nState: {}/{}\n\n", state.stack, state.environment);
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Stack hash: {}", hasher.short_hash(&state.stack_hash));
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                match lock {
                    Some(lock) if !lock.is_expired() => {
                        let _ = writeln!(
                            output,
                            "   Lock: {} by {} ({}s left)",
                            lock.operation,
                            lock.holder,
                            lock.remaining_secs()
                        );
                    }
                    _ => {
                        let _ = writeln!(output, "   Lock: none");
                    }
                }

                if state.is_empty() {
                    output.push_str("\n   No resources recorded.\n");
                } else {
                    let rows: Vec<ResourceRow> = state
                        .resources
                        .values()
                        .map(|r| ResourceRow {
                            name: r.name.clone(),
                            kind: r.kind.clone(),
                            id: r.id.clone().unwrap_or_default(),
                            dependencies: r
                                .dependencies
                                .iter()
                                .map(String::as_str)
                                .collect::<Vec<_>>()
                                .join(", "),
                            hash: hasher.short_hash(&r.config_hash),
                        })
                        .collect();
                    output.push('\n');
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓".green() } else { "✗".red() };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} ({})",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.resources.join(", ")
                        );
                    }
                }

                output
            }
        }
    }

    /// Formats exported outputs.
    #[must_use]
    pub fn format_outputs(&self, outputs: &BTreeMap<String, Value>) -> String {
        match self.format {
            OutputFormat::Json => to_json(outputs),
            OutputFormat::Text => {
                if outputs.is_empty() {
                    return String::from("No outputs recorded. Run 'stratum apply' first.\n");
                }
                let rows: Vec<OutputRow> = outputs
                    .iter()
                    .map(|(name, value)| OutputRow {
                        name: name.clone(),
                        value: render_value(Some(value)),
                    })
                    .collect();
                format!("{}\n", Table::new(rows))
            }
        }
    }

    /// Formats lock information.
    #[must_use]
    pub fn format_lock(&self, lock: &LockInfo) -> String {
        match self.format {
            OutputFormat::Json => to_json(lock),
            OutputFormat::Text => format!(
                "{} State locked: {} (holder {}, expires {})\n",
                "✓".green(),
                lock.lock_id,
                lock.holder,
                lock.expires_at.format("%Y-%m-%d %H:%M:%S")
            ),
        }
    }

    /// Formats a plan action with color.
    fn format_action(action: &PlanAction) -> String {
        match action {
            PlanAction::Create => "+create".green().to_string(),
            PlanAction::Update { .. } => "~update".yellow().to_string(),
            PlanAction::Replace { .. } => "±replace".yellow().to_string(),
            PlanAction::Delete => "-delete".red().to_string(),
            PlanAction::Retire => "-retire".red().to_string(),
            PlanAction::NoOp => "noop".dimmed().to_string(),
        }
    }

    /// Formats a node status with color.
    fn format_status(status: NodeStatus) -> String {
        match status {
            NodeStatus::Resolved => "resolved".green().to_string(),
            NodeStatus::Failed => "failed".red().to_string(),
            NodeStatus::Blocked => "blocked".yellow().to_string(),
            NodeStatus::Cancelled => "cancelled".dimmed().to_string(),
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{head}...")
        }
    }
}

/// Renders a JSON value compactly; strings without quotes.
fn render_value(value: Option<&Value>) -> String {
    match value {
        None => String::from("(none)"),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{DependencyGraph, ResourceNode};

    fn plan() -> Plan {
        let mut graph = DependencyGraph::new();
        graph
            .add_node(ResourceNode::new("seafileInstance", "linode:instance"))
            .expect("add");
        Plan::compute(&graph, &StateSnapshot::new("seafile", "dev"))
    }

    #[test]
    fn test_plan_text_lists_creates() {
        colored::control::set_override(false);
        let text = OutputFormatter::new(OutputFormat::Text).format_plan(&plan(), false);

        assert!(text.contains("seafileInstance"));
        assert!(text.contains("+create"));
        assert!(text.contains("Plan: 1 to create, 0 to update, 0 to replace, 0 to delete, 0 unchanged"));
    }

    #[test]
    fn test_plan_json_is_parseable() {
        let json = OutputFormatter::new(OutputFormat::Json).format_plan(&plan(), false);
        let value: Value = serde_json::from_str(&json).expect("valid json");

        assert_eq!(value["entries"][0]["name"], "seafileInstance");
        assert_eq!(value["entries"][0]["action"]["type"], "create");
    }

    #[test]
    fn test_truncate_counts_characters() {
        assert_eq!(OutputFormatter::truncate("short", 10), "short");
        assert_eq!(OutputFormatter::truncate("ééééééééééé", 6), "ééé...");
    }
}
