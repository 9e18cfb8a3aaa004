//! Execution scheduler for applying plans.
//!
//! The scheduler walks the dependency graph batch by batch, dispatching
//! provider calls for independent resources concurrently and settling each
//! resource's output cell as its call completes. Removed resources are torn
//! down afterwards, dependents first.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::ConfigHasher;
use crate::error::{ExecutionError, NodeFailure, ProviderError, Result};
use crate::graph::{CellState, DependencyGraph, OutputRef, Outputs, ResourceNode, TopologicalBatches};
use crate::provider::{ApplyRequest, Operation, ProviderRegistry, ResourceProvider};
use crate::state::{ResourceRecord, StateSnapshot, StateStore};

use super::plan::{Plan, PlanAction, PlanEntry};

/// Terminal status of a node after a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Outputs are available (or the resource was deleted).
    Resolved,
    /// The provider call failed.
    Failed,
    /// Never dispatched because a related resource did not converge.
    Blocked,
    /// Never dispatched because the run was cancelled.
    Cancelled,
}

/// What happened to one resource during a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeReport {
    /// Logical name.
    pub name: String,
    /// Resource kind.
    pub kind: String,
    /// Planned action.
    pub action: PlanAction,
    /// Provider operation actually dispatched, if any.
    pub operation: Option<Operation>,
    /// Terminal status.
    pub status: NodeStatus,
    /// Why the node did not resolve.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<NodeFailure>,
    /// Time spent in the provider call.
    pub duration_ms: u64,
}

/// Overall result of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every node resolved.
    Success,
    /// At least one node failed, was blocked or was cancelled.
    PartialFailure {
        /// Every non-resolved node with its cause, in plan order.
        failures: Vec<(String, NodeFailure)>,
    },
}

/// Report of a completed run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Per-node reports, in plan order.
    pub nodes: Vec<NodeReport>,
    /// Overall outcome.
    pub outcome: RunOutcome,
    /// Whether cancellation was requested during the run.
    pub cancelled: bool,
}

/// What a node task produced.
enum TaskOutcome {
    Applied(Outputs),
    Rejected(ProviderError),
    Cancelled,
}

/// Result handed back from a node task to the scheduler.
struct TaskResult {
    key: String,
    inputs: Outputs,
    outcome: TaskOutcome,
    elapsed_ms: u64,
}

/// Executes plans against providers.
pub struct ExecutionScheduler<'a> {
    /// Providers by kind prefix.
    providers: ProviderRegistry,
    /// Store receiving a snapshot after every completed node.
    checkpoint: Option<&'a dyn StateStore>,
    /// Maximum concurrent provider calls.
    max_concurrency: Option<usize>,
    /// Stops dispatching new work when triggered.
    cancel: CancellationToken,
    /// Declaration hasher for recorded state.
    hasher: ConfigHasher,
}

impl std::fmt::Debug for ExecutionScheduler<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionScheduler")
            .field("providers", &self.providers)
            .field("checkpoint", &self.checkpoint.map(|store| store.backend_type()))
            .field("max_concurrency", &self.max_concurrency)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl<'a> ExecutionScheduler<'a> {
    /// Creates a scheduler with no checkpointing and no concurrency limit.
    #[must_use]
    pub fn new(providers: ProviderRegistry) -> Self {
        Self {
            providers,
            checkpoint: None,
            max_concurrency: None,
            cancel: CancellationToken::new(),
            hasher: ConfigHasher::new(),
        }
    }

    /// Saves the snapshot to `store` after every completed node.
    #[must_use]
    pub fn with_checkpoint(mut self, store: &'a dyn StateStore) -> Self {
        self.checkpoint = Some(store);
        self
    }

    /// Bounds the number of concurrent provider calls.
    #[must_use]
    pub const fn with_max_concurrency(mut self, limit: Option<usize>) -> Self {
        self.max_concurrency = limit;
        self
    }

    /// Uses `token` to stop the run early.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Executes `plan` over `graph`, updating `snapshot` as nodes complete.
    ///
    /// # Errors
    ///
    /// Returns an error before any provider call if the graph is invalid,
    /// the plan does not match the graph, or a kind has no provider. Node
    /// failures are reported in the [`RunReport`], not as errors.
    pub async fn run(
        &self,
        plan: &Plan,
        graph: &DependencyGraph,
        snapshot: &mut StateSnapshot,
    ) -> Result<RunReport> {
        graph.validate()?;
        self.check_plan(plan, graph)?;

        let summary = plan.summary();
        info!("Executing plan: {summary}");

        let limit = self.max_concurrency.map(|n| Arc::new(Semaphore::new(n.max(1))));
        let mut reports: HashMap<String, NodeReport> = HashMap::with_capacity(plan.len());

        for (index, batch) in graph.topological_batches().enumerate() {
            debug!("Batch {index}: {}", batch.join(", "));
            self.run_batch(&batch, plan, graph, snapshot, limit.as_ref(), &mut reports)
                .await;
        }

        self.run_deletes(plan, snapshot, limit.as_ref(), &mut reports)
            .await;

        let nodes: Vec<NodeReport> = plan
            .entries
            .iter()
            .filter_map(|e| reports.remove(&report_key(e)))
            .collect();

        let failures: Vec<(String, NodeFailure)> = nodes
            .iter()
            .filter_map(|n| n.cause.clone().map(|cause| (n.name.clone(), cause)))
            .collect();

        let outcome = if failures.is_empty() {
            info!("Run complete: {} resources converged", nodes.len());
            RunOutcome::Success
        } else {
            warn!(
                "Run finished with {} of {} resources not converged",
                failures.len(),
                nodes.len()
            );
            RunOutcome::PartialFailure { failures }
        };

        Ok(RunReport {
            nodes,
            outcome,
            cancelled: self.cancel.is_cancelled(),
        })
    }

    /// Checks that the plan and graph describe the same resources and that
    /// every kind has a provider.
    fn check_plan(&self, plan: &Plan, graph: &DependencyGraph) -> Result<()> {
        for node in graph.nodes() {
            match plan.entry(node.name()) {
                Some(entry) if !entry.action.is_teardown() => {}
                _ => {
                    return Err(ExecutionError::MissingPlanEntry {
                        name: node.name().to_string(),
                    }
                    .into());
                }
            }
            self.providers.resolve(node.kind())?;
        }

        for entry in &plan.entries {
            if entry.action.is_teardown() {
                self.providers.resolve(&entry.kind)?;
            } else if !graph.contains(&entry.name) {
                return Err(ExecutionError::MissingDeclaration {
                    name: entry.name.clone(),
                }
                .into());
            }
        }

        Ok(())
    }

    /// Runs one create/update batch to completion.
    async fn run_batch(
        &self,
        batch: &[String],
        plan: &Plan,
        graph: &DependencyGraph,
        snapshot: &mut StateSnapshot,
        limit: Option<&Arc<Semaphore>>,
        reports: &mut HashMap<String, NodeReport>,
    ) {
        let mut set = JoinSet::new();
        let mut in_flight: HashMap<String, NodeReport> = HashMap::new();

        for name in batch {
            let Some(node) = graph.get(name) else {
                continue;
            };
            let action = plan
                .entry(name)
                .map_or(PlanAction::Create, |e| e.action.clone());
            let report = NodeReport::pending(name, node.kind(), action.clone());

            if self.cancel.is_cancelled() {
                let report = settle_failed(node, report, NodeStatus::Cancelled, NodeFailure::Cancelled);
                reports.insert(name.clone(), report);
                continue;
            }

            if let Some(dependency) = failed_dependency(node, graph) {
                warn!("Resource {name} blocked: dependency {dependency} failed");
                let failure = NodeFailure::DependencyFailed { dependency };
                let report = settle_failed(node, report, NodeStatus::Blocked, failure);
                reports.insert(name.clone(), report);
                continue;
            }

            let inputs = match resolve_inputs(node, graph) {
                Ok(inputs) => inputs,
                Err(reference) => {
                    error!("Resource {name}: input {reference} did not resolve");
                    let failure = NodeFailure::UnresolvedInput {
                        reference: reference.to_string(),
                    };
                    let report = settle_failed(node, report, NodeStatus::Failed, failure);
                    reports.insert(name.clone(), report);
                    continue;
                }
            };

            let record = snapshot.get(name);
            let operation = match (&action, record) {
                (PlanAction::NoOp, Some(record)) if record.inputs == inputs => None,
                (PlanAction::NoOp, Some(_)) => {
                    info!("Resource {name}: upstream outputs changed, updating");
                    Some(Operation::Update)
                }
                (PlanAction::Update { .. } | PlanAction::Delete, Some(_)) => Some(Operation::Update),
                _ => Some(Operation::Create),
            };

            let Some(operation) = operation else {
                debug!("Resource {name} is up to date");
                let outputs = record.map(|r| r.outputs.clone()).unwrap_or_default();
                node.cell().resolve(outputs);
                reports.insert(name.clone(), report.settle(NodeStatus::Resolved, None));
                continue;
            };

            let provider = match self.providers.resolve(node.kind()) {
                Ok(provider) => provider,
                Err(e) => {
                    let report = settle_failed(node, report, NodeStatus::Failed, NodeFailure::provider(e));
                    reports.insert(name.clone(), report);
                    continue;
                }
            };

            let request = ApplyRequest {
                kind: node.kind().to_string(),
                operation,
                name: name.clone(),
                inputs,
                id: match operation {
                    Operation::Create => None,
                    Operation::Update | Operation::Delete => record.and_then(|r| r.id.clone()),
                },
            };

            spawn_call(&mut set, provider, request, name.clone(), limit.cloned(), self.cancel.clone());
            in_flight.insert(name.clone(), NodeReport {
                operation: Some(operation),
                ..report
            });
        }

        while let Some(joined) = set.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) => {
                    error!("Node task aborted: {e}");
                    continue;
                }
            };

            let (Some(report), Some(node)) = (in_flight.remove(&result.key), graph.get(&result.key)) else {
                continue;
            };
            let report = NodeReport {
                duration_ms: result.elapsed_ms,
                ..report
            };

            let report = match result.outcome {
                TaskOutcome::Applied(outputs) => {
                    info!(
                        "{} {} ({}ms)",
                        report.operation.map_or("apply", |op| op.as_str()),
                        result.key,
                        result.elapsed_ms
                    );
                    if let PlanAction::Replace { .. } = report.action {
                        if let Some(previous) = snapshot.remove(&result.key) {
                            snapshot.retire(previous);
                        }
                    }
                    self.record_success(node, snapshot, result.inputs, outputs.clone());
                    node.cell().resolve(outputs);
                    self.save_checkpoint(snapshot).await;
                    report.settle(NodeStatus::Resolved, None)
                }
                TaskOutcome::Rejected(e) => {
                    error!("Resource {} failed: {e}", result.key);
                    settle_failed(node, report, NodeStatus::Failed, NodeFailure::provider(&e))
                }
                TaskOutcome::Cancelled => {
                    settle_failed(node, report, NodeStatus::Cancelled, NodeFailure::Cancelled)
                }
            };
            reports.insert(result.key, report);
        }

        // Tasks that panicked never reported back
        for (name, report) in in_flight {
            let failure = NodeFailure::provider("node task aborted before completing");
            let report = match graph.get(&name) {
                Some(node) => settle_failed(node, report, NodeStatus::Failed, failure),
                None => report.settle(NodeStatus::Failed, Some(failure)),
            };
            reports.insert(name, report);
        }
    }

    /// Tears down removed and retired resources, dependents before their
    /// dependencies.
    async fn run_deletes(
        &self,
        plan: &Plan,
        snapshot: &mut StateSnapshot,
        limit: Option<&Arc<Semaphore>>,
        reports: &mut HashMap<String, NodeReport>,
    ) {
        let entries: HashMap<String, &PlanEntry> = plan
            .deletes()
            .map(|entry| (report_key(entry), entry))
            .collect();
        if entries.is_empty() {
            return;
        }
        let keys: Vec<String> = plan.deletes().map(report_key).collect();

        // A record waits for every record in the set that reads from it
        let recorded: &StateSnapshot = snapshot;
        let mut waits_for: HashMap<String, Vec<String>> = HashMap::with_capacity(keys.len());
        for (key, entry) in &entries {
            let readers = entries
                .iter()
                .filter(|(_, other)| {
                    teardown_record(other, recorded)
                        .is_some_and(|record| record.dependencies.contains(&entry.name))
                })
                .map(|(other_key, _)| other_key.clone())
                .collect();
            waits_for.insert(key.clone(), readers);
        }
        let batches: Vec<Vec<String>> =
            TopologicalBatches::new(keys, |key| waits_for.get(key).cloned().unwrap_or_default())
                .collect();

        let mut processed: HashSet<String> = HashSet::with_capacity(entries.len());

        for batch in batches {
            debug!("Delete batch: {}", batch.join(", "));
            let mut set = JoinSet::new();
            let mut in_flight: HashMap<String, NodeReport> = HashMap::new();

            for key in batch {
                processed.insert(key.clone());
                let Some(entry) = entries.get(&key).copied() else {
                    continue;
                };
                let report = NodeReport::pending(&entry.name, &entry.kind, entry.action.clone());

                if self.cancel.is_cancelled() {
                    reports.insert(key, report.settle(NodeStatus::Cancelled, Some(NodeFailure::Cancelled)));
                    continue;
                }

                if teardown_record(entry, snapshot).is_none() {
                    warn!("Retirement of {key} blocked: its replacement did not converge");
                    let failure = NodeFailure::ReplacementFailed {
                        replacement: entry.name.clone(),
                    };
                    reports.insert(key, report.settle(NodeStatus::Blocked, Some(failure)));
                    continue;
                }

                if let Some(dependent) = unconverged_dependent(&entry.name, snapshot, reports) {
                    warn!("Delete of {key} blocked: dependent {dependent} did not converge");
                    let failure = NodeFailure::DependentFailed { dependent };
                    reports.insert(key, report.settle(NodeStatus::Blocked, Some(failure)));
                    continue;
                }

                let provider = match self.providers.resolve(&entry.kind) {
                    Ok(provider) => provider,
                    Err(e) => {
                        reports.insert(key, report.settle(NodeStatus::Failed, Some(NodeFailure::provider(e))));
                        continue;
                    }
                };

                let request = delete_request(entry, snapshot);
                spawn_call(&mut set, provider, request, key.clone(), limit.cloned(), self.cancel.clone());
                in_flight.insert(key, NodeReport {
                    operation: Some(Operation::Delete),
                    ..report
                });
            }

            while let Some(joined) = set.join_next().await {
                let result = match joined {
                    Ok(result) => result,
                    Err(e) => {
                        error!("Delete task aborted: {e}");
                        continue;
                    }
                };

                let Some(report) = in_flight.remove(&result.key) else {
                    continue;
                };
                let report = NodeReport {
                    duration_ms: result.elapsed_ms,
                    ..report
                };

                let report = match result.outcome {
                    TaskOutcome::Applied(_) => {
                        info!("delete {} ({}ms)", result.key, result.elapsed_ms);
                        forget_record(&report, snapshot);
                        self.save_checkpoint(snapshot).await;
                        report.settle(NodeStatus::Resolved, None)
                    }
                    TaskOutcome::Rejected(ProviderError::NotFound { id }) => {
                        warn!("Resource {} ({id}) was already gone", result.key);
                        forget_record(&report, snapshot);
                        self.save_checkpoint(snapshot).await;
                        report.settle(NodeStatus::Resolved, None)
                    }
                    TaskOutcome::Rejected(e) => {
                        error!("Delete of {} failed: {e}", result.key);
                        report.settle(NodeStatus::Failed, Some(NodeFailure::provider(&e)))
                    }
                    TaskOutcome::Cancelled => {
                        report.settle(NodeStatus::Cancelled, Some(NodeFailure::Cancelled))
                    }
                };
                reports.insert(result.key, report);
            }

            for (key, report) in in_flight {
                let failure = NodeFailure::provider("delete task aborted before completing");
                reports.insert(key, report.settle(NodeStatus::Failed, Some(failure)));
            }
        }

        // Only reachable when recorded dependencies form a cycle
        for (key, entry) in entries {
            if processed.contains(&key) {
                continue;
            }
            let dependent = waits_for
                .get(&key)
                .and_then(|readers| readers.first().cloned())
                .unwrap_or_else(|| entry.name.clone());
            let report = NodeReport::pending(&entry.name, &entry.kind, entry.action.clone());
            reports.insert(
                key,
                report.settle(NodeStatus::Blocked, Some(NodeFailure::DependentFailed { dependent })),
            );
        }
    }

    /// Writes a node's successful result into the snapshot.
    fn record_success(
        &self,
        node: &ResourceNode,
        snapshot: &mut StateSnapshot,
        inputs: Outputs,
        outputs: Outputs,
    ) {
        let mut record = snapshot
            .get(node.name())
            .cloned()
            .unwrap_or_else(|| ResourceRecord::new(node.name(), node.kind()));

        record.kind = node.kind().to_string();
        record.declared = node.declared();
        record.dependencies = node.dependencies();
        record.config_hash = self.hasher.hash_node(node);
        record.record_outputs(inputs, outputs);

        snapshot.set(record);
    }

    /// Saves the snapshot if checkpointing is enabled.
    async fn save_checkpoint(&self, snapshot: &StateSnapshot) {
        let Some(store) = self.checkpoint else {
            return;
        };
        if let Err(e) = store.save(snapshot).await {
            warn!("Checkpoint save failed: {e}");
        }
    }
}

impl NodeReport {
    fn pending(name: &str, kind: &str, action: PlanAction) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            action,
            operation: None,
            status: NodeStatus::Resolved,
            cause: None,
            duration_ms: 0,
        }
    }

    fn settle(self, status: NodeStatus, cause: Option<NodeFailure>) -> Self {
        Self {
            status,
            cause,
            ..self
        }
    }
}

impl RunReport {
    /// Returns true if every node resolved.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Success
    }

    /// Gets the report for a node.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Returns the names of nodes that did not resolve.
    #[must_use]
    pub fn failed_names(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.status != NodeStatus::Resolved)
            .map(|n| n.name.as_str())
            .collect()
    }

    /// Counts nodes with `status`.
    #[must_use]
    pub fn count(&self, status: NodeStatus) -> usize {
        self.nodes.iter().filter(|n| n.status == status).count()
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Resolved => "resolved",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Fails the node's cell and finishes its report.
fn settle_failed(
    node: &ResourceNode,
    report: NodeReport,
    status: NodeStatus,
    failure: NodeFailure,
) -> NodeReport {
    node.cell().fail(failure.clone());
    report.settle(status, Some(failure))
}

/// Returns the first dependency whose cell has failed.
fn failed_dependency(node: &ResourceNode, graph: &DependencyGraph) -> Option<String> {
    node.dependencies().into_iter().find(|dep| {
        graph
            .get(dep)
            .is_some_and(|d| d.cell().peek().is_failed())
    })
}

/// Substitutes every reference in the node's properties with the value
/// read from the referenced cell.
fn resolve_inputs(node: &ResourceNode, graph: &DependencyGraph) -> std::result::Result<Outputs, OutputRef> {
    let lookup = |reference: &OutputRef| {
        graph
            .get(&reference.resource)
            .and_then(|dep| match dep.cell().peek() {
                CellState::Resolved(outputs) => outputs.get(&reference.attribute).cloned(),
                CellState::Unresolved | CellState::Failed(_) => None,
            })
    };

    node.properties()
        .iter()
        .map(|(key, value)| value.resolve(&lookup).map(|v| (key.clone(), v)))
        .collect()
}

/// Returns a recorded dependent of `name`, live or retired, that did not
/// resolve in this run.
fn unconverged_dependent(
    name: &str,
    snapshot: &StateSnapshot,
    reports: &HashMap<String, NodeReport>,
) -> Option<String> {
    let live = snapshot.dependents_of(name).into_iter().map(String::from);
    let retired = snapshot
        .retired
        .iter()
        .filter(|record| record.dependencies.contains(name))
        .map(|record| retired_key(&record.name, &record.kind));

    live.chain(retired).find(|dependent| {
        reports
            .get(dependent)
            .is_none_or(|r| r.status != NodeStatus::Resolved)
    })
}

/// Key of an entry's report; a retirement shares its name with the
/// declared resource replacing it.
fn report_key(entry: &PlanEntry) -> String {
    if entry.action == PlanAction::Retire {
        retired_key(&entry.name, &entry.kind)
    } else {
        entry.name.clone()
    }
}

fn retired_key(name: &str, kind: &str) -> String {
    format!("{name}@{kind}")
}

/// Returns the record a teardown entry removes.
fn teardown_record<'s>(entry: &PlanEntry, snapshot: &'s StateSnapshot) -> Option<&'s ResourceRecord> {
    if entry.action == PlanAction::Retire {
        snapshot.retired_record(&entry.name, &entry.kind)
    } else {
        snapshot.get(&entry.name)
    }
}

/// Drops the record a finished teardown removed.
fn forget_record(report: &NodeReport, snapshot: &mut StateSnapshot) {
    if report.action == PlanAction::Retire {
        snapshot.remove_retired(&report.name, &report.kind);
    } else {
        snapshot.remove(&report.name);
    }
}

fn delete_request(entry: &PlanEntry, snapshot: &StateSnapshot) -> ApplyRequest {
    ApplyRequest {
        kind: entry.kind.clone(),
        operation: Operation::Delete,
        name: entry.name.clone(),
        inputs: Outputs::new(),
        id: teardown_record(entry, snapshot).and_then(|r| r.id.clone()),
    }
}

/// Spawns one provider call into `set`.
fn spawn_call(
    set: &mut JoinSet<TaskResult>,
    provider: Arc<dyn ResourceProvider>,
    request: ApplyRequest,
    key: String,
    limit: Option<Arc<Semaphore>>,
    cancel: CancellationToken,
) {
    let span = info_span!("node", name = %request.name, operation = %request.operation);

    set.spawn(
        async move {
            let _permit = match limit {
                Some(semaphore) => tokio::select! {
                    permit = semaphore.acquire_owned() => permit.ok(),
                    () = cancel.cancelled() => None,
                },
                None => None,
            };

            let inputs = request.inputs.clone();
            let started = Instant::now();

            let outcome = if cancel.is_cancelled() {
                debug!("cancelled before dispatch");
                TaskOutcome::Cancelled
            } else {
                debug!("dispatching");
                match provider.apply(request).await {
                    Ok(outputs) => TaskOutcome::Applied(outputs),
                    Err(e) => TaskOutcome::Rejected(e),
                }
            };

            TaskResult {
                key,
                inputs,
                outcome,
                elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            }
        }
        .instrument(span),
    );
}
