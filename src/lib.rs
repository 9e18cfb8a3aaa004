// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![warn(missing_docs)]                // All public items must be documented
#![warn(dead_code)]                   // Unused code is flagged
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![warn(unused_imports)]              // Unused imports are flagged
#![warn(unused_variables)]            // Unused variables are flagged
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Stratum
//!
//! A declarative provisioning engine that resolves resource dependencies
//! and executes provider calls in dependency order, concurrently where it
//! can.
//!
//! ## Overview
//!
//! Stratum lets you:
//!
//! - Declare infrastructure as code in a YAML stack file
//! - Wire resources together by reading each other's outputs
//! - Converge idempotently: a second apply with no changes does nothing
//! - Keep going past failures: only dependents of a failed resource stop
//!
//! ## Architecture
//!
//! A run flows through these stages:
//!
//! 1. **Declarations**: Parsed from `stratum.yaml` into a dependency graph
//!    whose edges come from `${resource.attribute}` references
//! 2. **Plan**: Declarations are diffed against recorded state into
//!    create, update, delete and no-op entries
//! 3. **Execution**: The scheduler runs the plan batch by batch; each
//!    resource's outputs land in a single-assignment output cell
//! 4. **Export**: Selected outputs are collected and published
//!
//! ## Modules
//!
//! - [`config`]: Stack file parsing, validation and hashing
//! - [`graph`]: Output cells, resource nodes and the dependency graph
//! - [`planner`]: Diff computation, planning and execution scheduling
//! - [`provider`]: The provider trait, registry and built-in providers
//! - [`state`]: State storage with locking
//! - [`export`]: Output publication
//! - [`engine`]: Plan, apply and destroy orchestration
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! stack:
//!   name: seafile
//!   environment: prod
//!
//! providers:
//!   linode:
//!     type: http
//!     endpoint: https://provider.example.com/linode
//!     token_env: LINODE_TOKEN
//!
//! resources:
//!   - name: seafileInstance
//!     kind: linode:instance
//!     properties:
//!       type: g6-standard-1
//!   - name: seafileVolume
//!     kind: linode:volume
//!     properties:
//!       size: 50
//!       linodeId: ${seafileInstance.id}
//!
//! outputs:
//!   instanceIpAddress: ${seafileInstance.ipAddress}
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod export;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, StackConfig};
pub use engine::{ApplyReport, DestroyReport, Engine};
pub use error::{NodeFailure, Result, StratumError};
pub use export::Exporter;
pub use graph::{CellState, DependencyGraph, OutputCell, OutputRef, ResourceNode, StackBuilder};
pub use planner::{ExecutionScheduler, Plan, PlanAction, RunOutcome, RunReport};
pub use provider::{HttpProvider, MemoryProvider, ProviderRegistry, ResourceProvider};
pub use state::{LocalStateStore, StateSnapshot, StateStore};
