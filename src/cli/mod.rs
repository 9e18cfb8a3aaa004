//! CLI module for the Stratum provisioning tool.
//!
//! This module provides the command-line interface for planning, applying
//! and destroying stacks.

mod commands;
mod output;

pub use commands::{Cli, Commands, LogFormat, OutputFormat, StateCommands};
pub use output::OutputFormatter;
