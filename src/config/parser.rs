//! Stack file parser.
//!
//! This module loads stack files from YAML and applies environment variable
//! overrides, with proper precedence and error handling.

use crate::error::{ConfigError, Result, StratumError};
use std::path::Path;
use tracing::{debug, info};

use super::schema::StackConfig;

/// Parser for loading stack files.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<std::path::PathBuf>,
}

impl ConfigParser {
    /// Creates a new stack file parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads a stack from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<StackConfig> {
        let path = path.as_ref();
        info!("Loading stack from: {}", path.display());

        if !path.exists() {
            return Err(StratumError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            StratumError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses a stack from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<StackConfig> {
        debug!("Parsing YAML stack");

        let config: StackConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            StratumError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            "Parsed stack '{}' with {} resources",
            config.stack.name,
            config.resources.len()
        );
        Ok(config)
    }

    /// Loads a stack with environment variable overrides.
    ///
    /// Recognized variables: `STRATUM_STACK_NAME`, `STRATUM_STACK_ENVIRONMENT`,
    /// `STRATUM_STATE_PATH` and `STRATUM_MAX_CONCURRENCY`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if an
    /// override holds an invalid value.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<StackConfig> {
        let mut config = self.load_file(path)?;
        Self::apply_env_overrides(&mut config)?;
        Ok(config)
    }

    /// Applies environment variable overrides to the stack.
    fn apply_env_overrides(config: &mut StackConfig) -> Result<()> {
        if let Ok(name) = std::env::var("STRATUM_STACK_NAME") {
            debug!("Overriding stack.name from environment");
            config.stack.name = name;
        }

        if let Ok(env) = std::env::var("STRATUM_STACK_ENVIRONMENT") {
            debug!("Overriding stack.environment from environment");
            config.stack.environment = env;
        }

        if let Ok(path) = std::env::var("STRATUM_STATE_PATH") {
            debug!("Overriding state.path from environment");
            config.state.path = Some(path);
        }

        if let Ok(limit) = std::env::var("STRATUM_MAX_CONCURRENCY") {
            debug!("Overriding scheduler.max_concurrency from environment");
            let parsed = limit.parse::<usize>().map_err(|_| {
                ConfigError::validation(
                    format!("STRATUM_MAX_CONCURRENCY must be a positive integer, got '{limit}'"),
                    "scheduler.max_concurrency",
                )
            })?;
            config.scheduler.max_concurrency = Some(parsed);
        }

        Ok(())
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| std::path::PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                StratumError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Reads a required environment variable.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable is not set.
    pub fn require_env(name: &str) -> Result<String> {
        std::env::var(name).map_err(|_| {
            StratumError::Config(ConfigError::MissingEnvVar {
                name: name.to_string(),
            })
        })
    }
}

/// Default stack file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["stratum.yaml", "stratum.yml", "stack.yaml", "stack.yml"];

/// Finds the stack file in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no stack file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<std::path::PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found stack file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(StratumError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;

    #[test]
    fn test_parse_minimal_stack() {
        let yaml = r"
stack:
  name: seafile
";
        let parser = ConfigParser::new();
        let config = parser.parse_yaml(yaml, None).expect("valid stack");

        assert_eq!(config.stack.name, "seafile");
        assert_eq!(config.stack.environment, "dev");
        assert!(config.resources.is_empty());
        assert!(config.scheduler.checkpoint);
    }

    #[test]
    fn test_parse_full_stack() {
        let yaml = r#"
stack:
  name: seafile
  environment: prod

providers:
  linode:
    type: http
    endpoint: https://linode-bridge.internal
    token_env: LINODE_TOKEN
  docker:
    type: memory

resources:
  - name: seafileInstance
    kind: linode:instance
    properties:
      type: g6-standard-1
      image: linode/ubuntu20.04
  - name: seafileVolume
    kind: linode:volume
    properties:
      size: 50
      linodeId: ${seafileInstance.id}

outputs:
  instanceIpAddress: ${seafileInstance.ipAddress}

scheduler:
  max_concurrency: 4
"#;
        let config = ConfigParser::new()
            .parse_yaml(yaml, None)
            .expect("valid stack");

        assert_eq!(config.resources.len(), 2);
        assert_eq!(config.resources[1].resource_type(), "volume");
        assert_eq!(
            config.resources[1].properties["linodeId"],
            serde_json::json!("${seafileInstance.id}")
        );
        assert_eq!(config.scheduler.max_concurrency, Some(4));
        assert!(matches!(
            config.providers["linode"],
            ProviderConfig::Http { timeout_secs: 30, .. }
        ));
    }

    #[test]
    fn test_parse_error_reports_location() {
        let err = ConfigParser::new()
            .parse_yaml("stack: [", Some(Path::new("broken.yaml")))
            .expect_err("invalid yaml");

        assert!(matches!(
            err,
            StratumError::Config(ConfigError::ParseError { location: Some(ref l), .. }) if l == "broken.yaml"
        ));
    }

    #[test]
    fn test_find_config_file_walks_up() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        std::fs::write(dir.path().join("stratum.yaml"), "stack:\n  name: x\n").expect("write");
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).expect("mkdir");

        let found = find_config_file(&nested).expect("found");
        assert_eq!(found, dir.path().join("stratum.yaml"));
    }
}
