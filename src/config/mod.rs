//! Configuration module for Stratum stacks.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `stratum.yaml`
//! - Validation of declarations, references and providers
//! - Computing declaration hashes for change detection

mod schema;
mod parser;
mod validator;
mod hash;

pub use schema::{
    DEFAULT_OUTPUTS_FILE, DEFAULT_STATE_DIR, ProviderConfig, ResourceConfig, SchedulerConfig,
    StackConfig, StackMeta, StateConfig,
};
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
pub use hash::ConfigHasher;
