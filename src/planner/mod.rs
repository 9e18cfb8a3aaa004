//! Planning module for stack runs.
//!
//! This module compares declarations with recorded state, turns the
//! differences into a plan and executes that plan against providers.

mod diff;
mod plan;
mod scheduler;

pub use diff::{DiffDetail, DiffEngine, DiffResult, DiffType, ResourceDiff};
pub use plan::{Plan, PlanAction, PlanEntry, PlanSummary};
pub use scheduler::{ExecutionScheduler, NodeReport, NodeStatus, RunOutcome, RunReport};
