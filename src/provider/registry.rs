//! Lookup of providers by kind prefix.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::config::{ConfigParser, ProviderConfig, StackConfig};
use crate::error::{ConfigError, Result};

use super::{HttpProvider, MemoryProvider, ResourceProvider};

/// Maps provider prefixes to provider implementations.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ResourceProvider>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut prefixes: Vec<&String> = self.providers.keys().collect();
        prefixes.sort();
        f.debug_struct("ProviderRegistry")
            .field("prefixes", &prefixes)
            .finish()
    }
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `provider` for kinds starting with `prefix:`.
    pub fn register(&mut self, prefix: impl Into<String>, provider: Arc<dyn ResourceProvider>) {
        let prefix = prefix.into();
        debug!("Registered provider for '{prefix}'");
        self.providers.insert(prefix, provider);
    }

    /// Builder-style variant of [`register`](Self::register).
    #[must_use]
    pub fn with(mut self, prefix: impl Into<String>, provider: Arc<dyn ResourceProvider>) -> Self {
        self.register(prefix, provider);
        self
    }

    /// Resolves the provider for a resource kind.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownProvider`] if no provider handles the
    /// kind's prefix.
    pub fn resolve(&self, kind: &str) -> std::result::Result<Arc<dyn ResourceProvider>, ConfigError> {
        let prefix = kind.split_once(':').map_or(kind, |(prefix, _)| prefix);
        self.providers
            .get(prefix)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownProvider {
                kind: kind.to_string(),
            })
    }

    /// Returns true if a provider is registered for `prefix`.
    #[must_use]
    pub fn contains(&self, prefix: &str) -> bool {
        self.providers.contains_key(prefix)
    }

    /// Builds a registry from the stack's `providers` section.
    ///
    /// # Errors
    ///
    /// Returns an error if a token variable is missing or an HTTP client
    /// cannot be created.
    pub fn from_config(config: &StackConfig) -> Result<Self> {
        let mut registry = Self::new();

        for (prefix, provider) in &config.providers {
            let provider: Arc<dyn ResourceProvider> = match provider {
                ProviderConfig::Http {
                    endpoint,
                    token_env,
                    timeout_secs,
                } => {
                    let token = token_env
                        .as_deref()
                        .map(ConfigParser::require_env)
                        .transpose()?;
                    Arc::new(HttpProvider::with_timeout(endpoint, token, *timeout_secs)?)
                }
                ProviderConfig::Memory { fail } => {
                    let memory = MemoryProvider::new();
                    for name in fail {
                        memory.fail_on(name);
                    }
                    Arc::new(memory)
                }
            };
            registry.register(prefix, provider);
        }

        Ok(registry)
    }
}
