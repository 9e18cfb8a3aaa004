//! Stack file specification types.
//!
//! This module defines the structs that map to `stratum.yaml`. A stack file
//! fully describes the desired resources, the providers that realize them
//! and the outputs to publish.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default state directory, relative to the stack file.
pub const DEFAULT_STATE_DIR: &str = ".stratum";

/// Default outputs file name inside the state directory.
pub const DEFAULT_OUTPUTS_FILE: &str = "outputs.json";

/// Default provider request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// The root structure of a stack file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StackConfig {
    /// Stack identity.
    pub stack: StackMeta,
    /// State storage settings.
    #[serde(default)]
    pub state: StateConfig,
    /// Providers keyed by kind prefix.
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    /// Declared resources, in declaration order.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    /// Exported outputs: name to `${resource.attribute}`.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    /// Scheduler tuning.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// Stack identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StackMeta {
    /// Stack name.
    pub name: String,
    /// Environment (e.g., "dev", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// State storage settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Directory holding the state and lock files.
    #[serde(default)]
    pub path: Option<String>,
    /// File receiving exported outputs.
    #[serde(default)]
    pub outputs_file: Option<String>,
}

/// How resources of one kind prefix are provisioned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderConfig {
    /// A JSON-over-HTTP provider endpoint.
    Http {
        /// Base URL of the endpoint.
        endpoint: String,
        /// Environment variable holding the bearer token.
        #[serde(default)]
        token_env: Option<String>,
        /// Request timeout in seconds.
        #[serde(default = "default_timeout")]
        timeout_secs: u64,
    },
    /// An in-process simulator.
    Memory {
        /// Resource names whose calls should fail.
        #[serde(default)]
        fail: Vec<String>,
    },
}

/// A single resource declaration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceConfig {
    /// Unique logical name.
    pub name: String,
    /// Kind, `provider:type`.
    pub kind: String,
    /// Input properties; `${resource.attribute}` strings are references.
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
}

/// Scheduler tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Maximum concurrent provider calls within a batch.
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    /// Save state after every completed resource.
    #[serde(default = "default_true")]
    pub checkpoint: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: None,
            checkpoint: true,
        }
    }
}

fn default_environment() -> String {
    String::from("dev")
}

const fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

const fn default_true() -> bool {
    true
}

impl StackConfig {
    /// Gets a resource declaration by name.
    #[must_use]
    pub fn resource(&self, name: &str) -> Option<&ResourceConfig> {
        self.resources.iter().find(|r| r.name == name)
    }

    /// Returns the state directory, resolved against `base`.
    #[must_use]
    pub fn state_dir(&self, base: &Path) -> PathBuf {
        self.state
            .path
            .as_ref()
            .map_or_else(|| base.join(DEFAULT_STATE_DIR), |p| base.join(p))
    }

    /// Returns the outputs file, resolved against `base`.
    #[must_use]
    pub fn outputs_path(&self, base: &Path) -> PathBuf {
        self.state.outputs_file.as_ref().map_or_else(
            || self.state_dir(base).join(DEFAULT_OUTPUTS_FILE),
            |p| base.join(p),
        )
    }
}

impl ResourceConfig {
    /// Returns the provider prefix of the kind.
    #[must_use]
    pub fn provider_prefix(&self) -> &str {
        self.kind.split_once(':').map_or(self.kind.as_str(), |(prefix, _)| prefix)
    }

    /// Returns the resource type part of the kind.
    #[must_use]
    pub fn resource_type(&self) -> &str {
        self.kind.split_once(':').map_or("", |(_, ty)| ty)
    }
}
