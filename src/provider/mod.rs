//! Resource providers.
//!
//! A provider realizes resources of one family (the prefix of a kind, such
//! as `linode` in `linode:instance`). The scheduler talks to providers only
//! through [`ResourceProvider`], resolved per kind by a [`ProviderRegistry`].

mod http;
mod memory;
mod registry;

pub use http::HttpProvider;
pub use memory::{MemoryProvider, RecordedCall};
pub use registry::ProviderRegistry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::graph::Outputs;

/// Provider operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Create a new resource.
    Create,
    /// Update an existing resource in place.
    Update,
    /// Tear a resource down.
    Delete,
}

impl Operation {
    /// Returns the lowercase operation name used on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single call into a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyRequest {
    /// Resource kind, `provider:type`.
    pub kind: String,
    /// Requested operation.
    pub operation: Operation,
    /// Logical resource name.
    pub name: String,
    /// Fully resolved inputs. Empty for deletes.
    pub inputs: Outputs,
    /// Provider-assigned id, for updates and deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl ApplyRequest {
    /// Returns the resource type part of the kind.
    #[must_use]
    pub fn resource_type(&self) -> &str {
        self.kind.split_once(':').map_or(self.kind.as_str(), |(_, ty)| ty)
    }
}

/// Capability to create, update and delete resources of one family.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Performs `request` and returns the resource's outputs.
    ///
    /// Creates must report at least an `id` output. Deletes may return an
    /// empty map.
    async fn apply(&self, request: ApplyRequest) -> Result<Outputs, ProviderError>;
}
