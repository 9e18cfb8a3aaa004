//! Stack file validation.
//!
//! This module checks a parsed stack for problems that can be reported
//! before any graph is built: malformed names and kinds, missing providers,
//! dangling references and suspicious literal ids.

use crate::error::{ConfigError, Result, StratumError};
use serde::Serialize;
use std::collections::HashSet;
use tracing::debug;

use crate::graph::PropertyValue;

use super::schema::{ProviderConfig, ResourceConfig, StackConfig};

/// Validator for stack files.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default, Serialize)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug, Serialize)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a stack file.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any check fails.
    pub fn validate(&self, config: &StackConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if result.errors.is_empty() {
            debug!(
                "Stack validation passed with {} warnings",
                result.warnings.len()
            );
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(StratumError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        }
    }

    /// Runs every check and returns all findings without failing.
    #[must_use]
    pub fn check(&self, config: &StackConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_stack(config, &mut result);
        Self::validate_resources(config, &mut result);
        Self::validate_outputs(config, &mut result);
        Self::validate_providers(config, &mut result);
        Self::validate_scheduler(config, &mut result);

        result
    }

    /// Validates stack identity.
    fn validate_stack(config: &StackConfig, result: &mut ValidationResult) {
        if config.stack.name.is_empty() {
            result.errors.push(ValidationError {
                field: String::from("stack.name"),
                message: String::from("Stack name cannot be empty"),
            });
        } else if !is_valid_name(&config.stack.name) {
            result.errors.push(ValidationError {
                field: String::from("stack.name"),
                message: format!(
                    "Stack name '{}' is invalid. Must start with a letter and contain only letters, digits, '-' or '_'.",
                    config.stack.name
                ),
            });
        }

        if config.stack.environment.is_empty() {
            result.errors.push(ValidationError {
                field: String::from("stack.environment"),
                message: String::from("Environment cannot be empty"),
            });
        }
    }

    /// Validates all resource declarations.
    fn validate_resources(config: &StackConfig, result: &mut ValidationResult) {
        if config.resources.is_empty() {
            result
                .warnings
                .push(String::from("No resources defined in stack"));
            return;
        }

        let declared: HashSet<&str> = config.resources.iter().map(|r| r.name.as_str()).collect();
        let mut seen_names = HashSet::new();

        for (i, resource) in config.resources.iter().enumerate() {
            let prefix = format!("resources[{i}]");

            if !seen_names.insert(resource.name.as_str()) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.name"),
                    message: format!("Duplicate resource name: {}", resource.name),
                });
            }

            if !is_valid_name(&resource.name) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.name"),
                    message: format!(
                        "Resource name '{}' is invalid. Must start with a letter and contain only letters, digits, '-' or '_'.",
                        resource.name
                    ),
                });
            }

            Self::validate_kind(config, resource, &prefix, result);
            Self::validate_properties(resource, &declared, &prefix, result);
        }
    }

    /// Validates a resource kind and its provider.
    fn validate_kind(
        config: &StackConfig,
        resource: &ResourceConfig,
        prefix: &str,
        result: &mut ValidationResult,
    ) {
        if resource.provider_prefix().is_empty() || resource.resource_type().is_empty() {
            result.errors.push(ValidationError {
                field: format!("{prefix}.kind"),
                message: format!(
                    "Kind '{}' must have the form 'provider:type'",
                    resource.kind
                ),
            });
            return;
        }

        if !config.providers.contains_key(resource.provider_prefix()) {
            result.errors.push(ValidationError {
                field: format!("{prefix}.kind"),
                message: format!(
                    "No provider configured for '{}' (kind '{}')",
                    resource.provider_prefix(),
                    resource.kind
                ),
            });
        }
    }

    /// Validates property values and the references they contain.
    fn validate_properties(
        resource: &ResourceConfig,
        declared: &HashSet<&str>,
        prefix: &str,
        result: &mut ValidationResult,
    ) {
        for (key, value) in &resource.properties {
            let field = format!("{prefix}.properties.{key}");

            let property = match PropertyValue::from_json(value.clone()) {
                Ok(property) => property,
                Err(e) => {
                    result.errors.push(ValidationError {
                        field,
                        message: e.to_string(),
                    });
                    continue;
                }
            };

            let mut references = Vec::new();
            property.collect_references(&mut references);

            for reference in references {
                if reference.resource == resource.name {
                    result.errors.push(ValidationError {
                        field: field.clone(),
                        message: format!("Resource '{}' references itself", resource.name),
                    });
                } else if !declared.contains(reference.resource.as_str()) {
                    result.errors.push(ValidationError {
                        field: field.clone(),
                        message: format!(
                            "Reference '{}' targets undeclared resource '{}'",
                            reference.expression(),
                            reference.resource
                        ),
                    });
                }
            }

            if looks_like_id_key(key) && matches!(property, PropertyValue::Literal(_)) {
                result.warnings.push(format!(
                    "{field}: literal id {value} creates no dependency; reference another resource's ${{name.id}} instead"
                ));
            }
        }
    }

    /// Validates exported outputs.
    fn validate_outputs(config: &StackConfig, result: &mut ValidationResult) {
        for (name, expression) in &config.outputs {
            let field = format!("outputs.{name}");

            match crate::graph::OutputRef::parse_expression(expression) {
                Ok(Some(reference)) => {
                    if config.resource(&reference.resource).is_none() {
                        result.errors.push(ValidationError {
                            field,
                            message: format!(
                                "Output '{name}' targets undeclared resource '{}'",
                                reference.resource
                            ),
                        });
                    }
                }
                Ok(None) => result.errors.push(ValidationError {
                    field,
                    message: format!(
                        "Output '{name}' must be a ${{resource.attribute}} reference, got '{expression}'"
                    ),
                }),
                Err(e) => result.errors.push(ValidationError {
                    field,
                    message: e.to_string(),
                }),
            }
        }
    }

    /// Validates provider settings.
    fn validate_providers(config: &StackConfig, result: &mut ValidationResult) {
        let used: HashSet<&str> = config
            .resources
            .iter()
            .map(ResourceConfig::provider_prefix)
            .collect();

        for (prefix, provider) in &config.providers {
            let field = format!("providers.{prefix}");

            if !used.contains(prefix.as_str()) {
                result
                    .warnings
                    .push(format!("{field}: provider is not used by any resource"));
            }

            if let ProviderConfig::Http {
                endpoint,
                timeout_secs,
                ..
            } = provider
            {
                if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                    result.errors.push(ValidationError {
                        field: format!("{field}.endpoint"),
                        message: format!("Endpoint must be an http(s) URL: {endpoint}"),
                    });
                }
                if *timeout_secs == 0 {
                    result.errors.push(ValidationError {
                        field: format!("{field}.timeout_secs"),
                        message: String::from("Timeout must be at least 1 second"),
                    });
                }
            }
        }
    }

    /// Validates scheduler tuning.
    fn validate_scheduler(config: &StackConfig, result: &mut ValidationResult) {
        if config.scheduler.max_concurrency == Some(0) {
            result.errors.push(ValidationError {
                field: String::from("scheduler.max_concurrency"),
                message: String::from("Maximum concurrency must be at least 1"),
            });
        }
    }
}

/// Validates that a name is usable as a logical resource name.
/// Names start with a letter and contain letters, digits, hyphens or underscores.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_alphabetic() {
        return false;
    }

    chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Returns true for property keys that conventionally hold another
/// resource's id (`domainId`, `linode_id`).
fn looks_like_id_key(key: &str) -> bool {
    key.len() > 2 && (key.ends_with("Id") || key.ends_with("_id"))
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;

    fn parse(yaml: &str) -> StackConfig {
        ConfigParser::new().parse_yaml(yaml, None).expect("valid yaml")
    }

    const BASE: &str = r"
stack:
  name: seafile
providers:
  linode:
    type: memory
";

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("seafileInstance"));
        assert!(is_valid_name("web-1"));
        assert!(is_valid_name("db_primary"));
    }

    #[test]
    fn test_invalid_name() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("1web"));
        assert!(!is_valid_name("web.primary"));
        assert!(!is_valid_name("web primary"));
    }

    #[test]
    fn test_literal_id_warns() {
        let config = parse(&format!(
            "{BASE}
resources:
  - name: seafileARecord
    kind: linode:domain-record
    properties:
      domainId: 12345
      recordType: A
"
        ));

        let result = ConfigValidator::new().validate(&config).expect("valid");
        assert_eq!(result.warning_count(), 1);
        assert!(result.warnings[0].contains("domainId"));
    }

    #[test]
    fn test_reference_id_does_not_warn() {
        let config = parse(&format!(
            "{BASE}
resources:
  - name: seafileDomain
    kind: linode:domain
  - name: seafileARecord
    kind: linode:domain-record
    properties:
      domainId: ${{seafileDomain.id}}
"
        ));

        let result = ConfigValidator::new().validate(&config).expect("valid");
        assert_eq!(result.warning_count(), 0);
    }

    #[test]
    fn test_undeclared_reference_is_error() {
        let config = parse(&format!(
            "{BASE}
resources:
  - name: seafileVolume
    kind: linode:volume
    properties:
      linodeId: ${{seafileInstance.id}}
"
        ));

        let result = ConfigValidator::new().check(&config);
        assert_eq!(result.error_count(), 1);
        assert_eq!(result.errors[0].field, "resources[0].properties.linodeId");
        assert!(ConfigValidator::new().validate(&config).is_err());
    }

    #[test]
    fn test_missing_provider_and_bad_kind() {
        let config = parse(&format!(
            "{BASE}
resources:
  - name: network
    kind: docker:network
  - name: bare
    kind: instance
"
        ));

        let result = ConfigValidator::new().check(&config);
        let fields: Vec<&str> = result.errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["resources[0].kind", "resources[1].kind"]);
    }

    #[test]
    fn test_duplicate_names_and_zero_concurrency() {
        let config = parse(&format!(
            "{BASE}
resources:
  - name: web
    kind: linode:instance
  - name: web
    kind: linode:instance
scheduler:
  max_concurrency: 0
"
        ));

        let result = ConfigValidator::new().check(&config);
        assert_eq!(result.error_count(), 2);
    }

    #[test]
    fn test_output_must_be_reference() {
        let config = parse(&format!(
            "{BASE}
resources:
  - name: web
    kind: linode:instance
outputs:
  ip: 192.0.2.1
  addr: ${{web.ipAddress}}
"
        ));

        let result = ConfigValidator::new().check(&config);
        assert_eq!(result.error_count(), 1);
        assert_eq!(result.errors[0].field, "outputs.ip");
    }
}
