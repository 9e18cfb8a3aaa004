//! Engine for converging a stack to its declarations.
//!
//! The engine ties the pieces of a run together: it builds the declared
//! graph from the stack file, loads recorded state, plans, executes the plan
//! under the state lock and publishes exported outputs.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigHasher, ConfigValidator, StackConfig};
use crate::error::Result;
use crate::export::write_outputs;
use crate::graph::{DeclaredStack, DependencyGraph, StackBuilder};
use crate::planner::{ExecutionScheduler, Plan, RunReport};
use crate::provider::ProviderRegistry;
use crate::state::{LockInfo, RunHistoryEntry, RunOperation, StateSnapshot, StateStore, generate_holder_id};

/// Result of an apply.
#[derive(Debug, Serialize)]
pub struct ApplyReport {
    /// Plan that was executed.
    pub plan: Plan,
    /// Scheduler report.
    pub run: RunReport,
    /// Exported outputs collected after the run.
    pub outputs: BTreeMap<String, Value>,
    /// Why outputs could not be collected, if they could not.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export_error: Option<String>,
}

/// Result of a destroy.
#[derive(Debug, Serialize)]
pub struct DestroyReport {
    /// Plan that was executed.
    pub plan: Plan,
    /// Scheduler report.
    pub run: RunReport,
}

/// Drives plan, apply and destroy for one stack.
pub struct Engine<'a, S: StateStore> {
    /// Parsed stack file.
    config: &'a StackConfig,
    /// State store.
    store: &'a S,
    /// Providers by kind prefix.
    providers: ProviderRegistry,
    /// Directory the stack file lives in.
    base_dir: PathBuf,
    /// Declaration hasher.
    hasher: ConfigHasher,
}

impl<'a, S: StateStore> Engine<'a, S> {
    /// Creates a new engine rooted at the current directory.
    #[must_use]
    pub fn new(config: &'a StackConfig, store: &'a S, providers: ProviderRegistry) -> Self {
        Self {
            config,
            store,
            providers,
            base_dir: PathBuf::from("."),
            hasher: ConfigHasher::new(),
        }
    }

    /// Sets the directory relative paths in the stack file resolve against.
    #[must_use]
    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = base_dir.into();
        self
    }

    /// Returns the path exported outputs are written to.
    #[must_use]
    pub fn outputs_path(&self) -> PathBuf {
        self.config.outputs_path(&self.base_dir)
    }

    /// Loads recorded state, or an empty snapshot for a new stack.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read.
    pub async fn load_state(&self) -> Result<StateSnapshot> {
        let state = self.store.load().await?.unwrap_or_else(|| {
            debug!("No recorded state, starting fresh");
            StateSnapshot::new(&self.config.stack.name, &self.config.stack.environment)
        });
        Ok(state)
    }

    /// Validates the stack file and builds a fresh declared stack.
    fn declare(&self) -> Result<DeclaredStack> {
        let validation = ConfigValidator::new().validate(self.config)?;
        for warning in &validation.warnings {
            warn!("{warning}");
        }
        StackBuilder::from_config(self.config)?.build()
    }

    /// Computes the plan for the current declarations.
    ///
    /// # Errors
    ///
    /// Returns an error if the stack is invalid or state cannot be read.
    pub async fn plan(&self) -> Result<Plan> {
        let stack = self.declare()?;
        let state = self.load_state().await?;
        let plan = Plan::compute(&stack.graph, &state);

        info!(
            "Plan for {}/{}: {}",
            self.config.stack.name,
            self.config.stack.environment,
            plan.summary()
        );
        Ok(plan)
    }

    /// Converges the stack to its declarations.
    ///
    /// Node failures do not make this fail; they are reported in the
    /// returned [`ApplyReport`].
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails, the lock is held elsewhere, or
    /// state cannot be read or written.
    pub async fn apply(&self, cancel: CancellationToken) -> Result<ApplyReport> {
        let stack = self.declare()?;
        let lock = self.lock(RunOperation::Apply).await?;

        let result = self.apply_locked(&stack, cancel).await;
        self.unlock(&lock).await;

        result
    }

    async fn apply_locked(&self, stack: &DeclaredStack, cancel: CancellationToken) -> Result<ApplyReport> {
        let mut snapshot = self.load_state().await?;
        let plan = Plan::compute(&stack.graph, &snapshot);
        info!("Applying {}: {}", self.config.stack.name, plan.summary());

        let run = self
            .run_plan(&plan, &stack.graph, &mut snapshot, cancel)
            .await?;

        let mut outputs = BTreeMap::new();
        let mut export_error = None;
        match stack.exporter.collect().await {
            Ok(values) => {
                // Provider changes must reach state even if the file cannot
                if let Err(e) = write_outputs(&self.outputs_path(), &values).await {
                    warn!("Outputs file not written: {e}");
                    export_error = Some(e.to_string());
                }
                snapshot.outputs.clone_from(&values);
                outputs = values;
            }
            Err(e) => {
                warn!("Outputs not published: {e}");
                export_error = Some(e.to_string());
            }
        }

        if run.is_success() {
            snapshot.stack_hash = self
                .hasher
                .hash_stack(&self.config.stack.name, &stack.graph);
        }
        snapshot.add_history(history_entry(RunOperation::Apply, &snapshot.stack_hash, &run));
        self.store.save(&snapshot).await?;

        Ok(ApplyReport {
            plan,
            run,
            outputs,
            export_error,
        })
    }

    /// Tears down every recorded resource, dependents first.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is held elsewhere, a recorded kind has
    /// no provider, or state cannot be read or written.
    pub async fn destroy(&self, cancel: CancellationToken) -> Result<DestroyReport> {
        let lock = self.lock(RunOperation::Destroy).await?;
        let result = self.destroy_locked(cancel).await;
        self.unlock(&lock).await;
        result
    }

    async fn destroy_locked(&self, cancel: CancellationToken) -> Result<DestroyReport> {
        let mut snapshot = self.load_state().await?;
        let empty = DependencyGraph::new();
        let plan = Plan::compute(&empty, &snapshot);
        info!("Destroying {}: {}", self.config.stack.name, plan.summary());

        let run = self.run_plan(&plan, &empty, &mut snapshot, cancel).await?;

        if run.is_success() {
            snapshot.outputs.clear();
            snapshot.stack_hash.clear();
        }
        snapshot.add_history(history_entry(RunOperation::Destroy, &snapshot.stack_hash, &run));
        self.store.save(&snapshot).await?;

        Ok(DestroyReport { plan, run })
    }

    /// Returns the outputs recorded by the last successful collection.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be read.
    pub async fn outputs(&self) -> Result<BTreeMap<String, Value>> {
        Ok(self.load_state().await?.outputs)
    }

    async fn run_plan(
        &self,
        plan: &Plan,
        graph: &DependencyGraph,
        snapshot: &mut StateSnapshot,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        let mut scheduler = ExecutionScheduler::new(self.providers.clone())
            .with_max_concurrency(self.config.scheduler.max_concurrency)
            .with_cancellation(cancel);
        if self.config.scheduler.checkpoint {
            scheduler = scheduler.with_checkpoint(self.store);
        }

        scheduler.run(plan, graph, snapshot).await
    }

    async fn lock(&self, operation: RunOperation) -> Result<LockInfo> {
        self.store
            .acquire_lock(&generate_holder_id(), &operation.to_string())
            .await
    }

    async fn unlock(&self, lock: &LockInfo) {
        if let Err(e) = self.store.release_lock(&lock.lock_id).await {
            warn!("Failed to release state lock {}: {e}", lock.lock_id);
        }
    }
}

impl ApplyReport {
    /// Returns true if every resource converged and outputs were published.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.run.is_success() && self.export_error.is_none()
    }
}

/// Builds the history entry for a finished run.
fn history_entry(operation: RunOperation, stack_hash: &str, run: &RunReport) -> RunHistoryEntry {
    let touched: Vec<String> = run
        .nodes
        .iter()
        .filter(|n| n.operation.is_some())
        .map(|n| n.name.clone())
        .collect();

    if run.is_success() {
        RunHistoryEntry::new(operation, stack_hash, touched)
    } else {
        let failed = run.failed_names().join(", ");
        RunHistoryEntry::failed(operation, stack_hash, touched, &format!("not converged: {failed}"))
    }
}

/// Returns the directory containing `config_path`, for resolving relative
/// state paths.
#[must_use]
pub fn base_dir_of(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}
