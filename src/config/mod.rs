//! Configuration module for the DeployBox engine.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `deploybox.yaml`
//! - Environment overrides and secrets
//! - Validation of configuration values
//! - Document fingerprints for run reports

mod hash;
mod parser;
mod spec;
mod validator;

pub use hash::ConfigHasher;
pub use parser::{
    find_config_file, ConfigParser, DEFAULT_CONFIG_FILES, ENV_ATLAS_PRIVATE_KEY,
    ENV_CLIENT_SECRET, ENV_GITHUB_TOKEN, ENV_REGISTRY_PASSWORD,
};
pub use spec::{
    AzureConfig, BillingConfig, BuildConfig, ChangeDetectionConfig, EngineConfig,
    ExecutorConfig, MongoAtlasConfig, RegistryConfig, StacksConfig, StateBackend, StateConfig,
};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
