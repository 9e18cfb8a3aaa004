//! Error types for the Stratum provisioning engine.
//!
//! This module provides the error hierarchy for every stage of a run:
//! configuration, state management, graph validation, provider calls,
//! execution and output export.

use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the Stratum provisioning engine.
#[derive(Debug, Error)]
pub enum StratumError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Declaration graph errors.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// Provider errors surfaced outside of a node run.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Execution errors.
    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// Output export errors.
    #[error("Export error: {0}")]
    Export(#[from] ExportError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The stack file was not found.
    #[error("Stack file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The stack file could not be parsed.
    #[error("Failed to parse stack file: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Stack validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },

    /// A property reference string is malformed.
    #[error("Invalid reference '{reference}': expected ${{resource.attribute}}")]
    InvalidReference {
        /// The offending reference text.
        reference: String,
    },

    /// No provider is configured for a resource kind.
    #[error("No provider configured for kind '{kind}'")]
    UnknownProvider {
        /// The resource kind.
        kind: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State could not be written.
    #[error("Failed to write state: {message}")]
    WriteFailed {
        /// Description of the write failure.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// Declaration graph errors, detected before any provider call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// Two resources share a logical name.
    #[error("Duplicate resource name: {name}")]
    DuplicateName {
        /// The duplicated name.
        name: String,
    },

    /// The declarations form a dependency cycle.
    #[error("Cyclic dependency detected: {cycle}")]
    CyclicDependency {
        /// The cycle path, e.g. `a -> b -> a`.
        cycle: String,
    },

    /// A property references a resource that was never declared.
    #[error("Resource '{from}' references undeclared resource '{target}'")]
    UnknownReference {
        /// The referencing resource.
        from: String,
        /// The missing target.
        target: String,
    },
}

/// Errors returned by resource providers.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider endpoint rejected the credentials.
    #[error("Provider authentication failed: {message}")]
    AuthenticationFailed {
        /// Description of the auth failure.
        message: String,
    },

    /// The provider rejected or failed the request.
    #[error("Provider request failed: {status} - {message}")]
    RequestFailed {
        /// HTTP-like status code.
        status: u16,
        /// Error message from the provider.
        message: String,
    },

    /// Rate limited.
    #[error("Provider rate limited, retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// Network error.
    #[error("Network error: {message}")]
    NetworkError {
        /// Description of the network error.
        message: String,
    },

    /// Invalid response from the provider.
    #[error("Invalid provider response: {message}")]
    InvalidResponse {
        /// Description of the invalid response.
        message: String,
    },

    /// The remote resource does not exist.
    #[error("Resource not found: {id}")]
    NotFound {
        /// Provider-assigned id.
        id: String,
    },
}

/// Execution errors raised by the scheduler itself.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// A declared node has no plan entry.
    #[error("Resource '{name}' is declared but missing from the plan")]
    MissingPlanEntry {
        /// Node name.
        name: String,
    },

    /// The plan refers to a node the graph does not contain.
    #[error("Plan entry '{name}' has no declaration")]
    MissingDeclaration {
        /// Node name.
        name: String,
    },
}

/// Errors raised while collecting exported outputs.
#[derive(Debug, Error)]
pub enum ExportError {
    /// The exported resource did not resolve.
    #[error("Export '{name}' failed: {cause}")]
    ExportFailed {
        /// Export name.
        name: String,
        /// Failure of the underlying resource.
        cause: NodeFailure,
    },

    /// The resource resolved but has no such attribute.
    #[error("Export '{name}': resource '{resource}' has no attribute '{attribute}'")]
    MissingAttribute {
        /// Export name.
        name: String,
        /// Resource name.
        resource: String,
        /// Attribute name.
        attribute: String,
    },

    /// The export targets an undeclared resource.
    #[error("Export '{name}' targets undeclared resource '{resource}'")]
    UnknownResource {
        /// Export name.
        name: String,
        /// Resource name.
        resource: String,
    },
}

/// Why a node did not resolve.
///
/// Cloneable because every reader of a failed output cell receives it.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeFailure {
    /// The provider call for this node failed.
    #[error("provider error: {message}")]
    Provider {
        /// Provider error message.
        message: String,
    },

    /// A dependency failed so this node was never dispatched.
    #[error("dependency '{dependency}' failed")]
    DependencyFailed {
        /// The failed dependency.
        dependency: String,
    },

    /// A referenced output attribute was missing from the dependency's outputs.
    #[error("input '{reference}' did not resolve")]
    UnresolvedInput {
        /// The unresolved reference, `resource.attribute`.
        reference: String,
    },

    /// A resource still reading from this one did not converge, so it was
    /// not torn down.
    #[error("dependent '{dependent}' did not converge")]
    DependentFailed {
        /// The dependent that failed, was blocked or was cancelled.
        dependent: String,
    },

    /// The resource replacing this record did not converge, so the record
    /// is still live and was not torn down.
    #[error("replacement '{replacement}' did not converge")]
    ReplacementFailed {
        /// Logical name of the replacement.
        replacement: String,
    },

    /// The run was cancelled before this node started.
    #[error("cancelled before dispatch")]
    Cancelled,
}

/// Result type alias for Stratum operations.
pub type Result<T> = std::result::Result<T, StratumError>;

impl StratumError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is a pre-execution validation failure.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Graph(_) | Self::Config(ConfigError::ValidationError { .. })
        )
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl StateError {
    /// Creates a write error with the given message.
    #[must_use]
    pub fn write(message: impl Into<String>) -> Self {
        Self::WriteFailed {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates a request error.
    #[must_use]
    pub fn request(status: u16, message: impl Into<String>) -> Self {
        Self::RequestFailed {
            status,
            message: message.into(),
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError {
            message: message.into(),
        }
    }

    /// Returns true if the call may succeed when retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::NetworkError { .. } => true,
            Self::RequestFailed { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl NodeFailure {
    /// Creates a provider failure from any displayable error.
    #[must_use]
    pub fn provider(error: impl std::fmt::Display) -> Self {
        Self::Provider {
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_provider_errors() {
        assert!(ProviderError::RateLimited { retry_after_secs: 3 }.is_retryable());
        assert!(ProviderError::network("reset").is_retryable());
        assert!(ProviderError::request(503, "busy").is_retryable());
        assert!(!ProviderError::request(400, "bad input").is_retryable());
        assert!(!ProviderError::NotFound { id: String::from("x") }.is_retryable());
    }

    #[test]
    fn test_validation_classification() {
        let err: StratumError = GraphError::CyclicDependency {
            cycle: String::from("a -> b -> a"),
        }
        .into();
        assert!(err.is_validation());
        assert!(!StratumError::internal("boom").is_validation());
    }

    #[test]
    fn test_node_failure_display() {
        let failure = NodeFailure::DependencyFailed {
            dependency: String::from("seafileInstance"),
        };
        assert_eq!(failure.to_string(), "dependency 'seafileInstance' failed");
    }
}
