//! Configuration parser for loading configuration files.
//!
//! This module handles loading configuration from YAML files and environment
//! variables, with proper precedence and error handling.

use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{ConfigError, Result};

use super::spec::{EngineConfig, StateBackend};

/// Service principal secret.
pub const ENV_CLIENT_SECRET: &str = "ARM_CLIENT_SECRET";

/// Container registry admin password.
pub const ENV_REGISTRY_PASSWORD: &str = "ACR_PASSWORD";

/// MongoDB Atlas private API key.
pub const ENV_ATLAS_PRIVATE_KEY: &str = "MONGODB_ATLAS_PRIVATE_KEY";

/// Source-control token.
pub const ENV_GITHUB_TOKEN: &str = "GITHUB_TOKEN";

/// Configuration parser for loading engine configuration.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<EngineConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }
            .into());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ParseError {
            message: format!("Failed to read file: {e}"),
            location: Some(path.display().to_string()),
        })?;

        let mut config = self.parse_yaml(&content, Some(path))?;
        self.resolve_paths(&mut config, path.parent());
        Ok(config)
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<EngineConfig> {
        debug!("Parsing YAML configuration");

        // An empty file is a valid, all-defaults configuration.
        if content.trim().is_empty() {
            return Ok(EngineConfig::default());
        }

        let config: EngineConfig = serde_yaml::from_str(content).map_err(|e| {
            ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location: source.map(|p| p.display().to_string()),
            }
        })?;

        debug!(
            "Parsed configuration with {:?} state backend",
            config.state.backend
        );
        Ok(config)
    }

    /// Loads configuration, then applies environment overrides and secrets.
    ///
    /// Overrides use the form `DEPLOYBOX_<SECTION>_<KEY>`, e.g.
    /// `DEPLOYBOX_STATE_BUCKET`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<EngineConfig> {
        let mut config = self.load_file(path)?;
        Self::apply_env(&mut config, |name| std::env::var(name).ok());
        Ok(config)
    }

    /// Applies overrides and secrets from a variable lookup.
    pub fn apply_env(config: &mut EngineConfig, var: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| var(name).filter(|v| !v.is_empty());

        if let Some(subscription) = var("DEPLOYBOX_AZURE_SUBSCRIPTION_ID") {
            debug!("Overriding azure.subscription_id from environment");
            config.azure.subscription_id = subscription;
        }
        if let Some(tenant) = var("DEPLOYBOX_AZURE_TENANT_ID") {
            debug!("Overriding azure.tenant_id from environment");
            config.azure.tenant_id = tenant;
        }
        if let Some(client) = var("DEPLOYBOX_AZURE_CLIENT_ID") {
            debug!("Overriding azure.client_id from environment");
            config.azure.client_id = client;
        }
        if let Some(location) = var("DEPLOYBOX_AZURE_LOCATION") {
            debug!("Overriding azure.location from environment");
            config.azure.location = location;
        }

        if let Some(backend) = var("DEPLOYBOX_STATE_BACKEND") {
            match backend.to_ascii_lowercase().as_str() {
                "s3" => config.state.backend = StateBackend::S3,
                "local" => config.state.backend = StateBackend::Local,
                other => debug!("Ignoring unknown DEPLOYBOX_STATE_BACKEND '{other}'"),
            }
        }
        if let Some(bucket) = var("DEPLOYBOX_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment");
            config.state.bucket = Some(bucket);
        }
        if let Some(prefix) = var("DEPLOYBOX_STATE_PREFIX") {
            debug!("Overriding state.prefix from environment");
            config.state.prefix = Some(prefix);
        }
        if let Some(binary) = var("DEPLOYBOX_EXECUTOR_BINARY") {
            debug!("Overriding executor.binary from environment");
            config.executor.binary = binary;
        }

        config.azure.client_secret = var(ENV_CLIENT_SECRET);
        if let Some(registry) = config.azure.registry.as_mut() {
            registry.password = var(ENV_REGISTRY_PASSWORD);
        }
        config.mongodbatlas.private_key = var(ENV_ATLAS_PRIVATE_KEY);
        config.change_detection.token = var(ENV_GITHUB_TOKEN);
    }

    /// Makes relative storage paths relative to the configuration file.
    fn resolve_paths(&self, config: &mut EngineConfig, config_dir: Option<&Path>) {
        let Some(base) = self.base_path.as_deref().or(config_dir) else {
            return;
        };

        if config.stacks.dir.is_relative() {
            config.stacks.dir = base.join(&config.stacks.dir);
        }
        if let Some(path) = config.state.path.as_mut() {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
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
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| ConfigError::ParseError {
                message: format!("Failed to load .env file: {e}"),
                location: Some(env_path.display().to_string()),
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Checks that the secrets needed for deploys are present.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingEnvVar`] naming the first missing secret.
    pub fn require_deploy_secrets(config: &EngineConfig) -> Result<()> {
        if config.azure.client_secret.is_none() {
            return Err(ConfigError::MissingEnvVar {
                name: ENV_CLIENT_SECRET.to_string(),
            }
            .into());
        }
        if config.azure.registry.as_ref().is_some_and(|r| r.password.is_none()) {
            return Err(ConfigError::MissingEnvVar {
                name: ENV_REGISTRY_PASSWORD.to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["deploybox.yaml", "deploybox.yml"];

/// Finds the configuration file in the current directory, its parents, or
/// the user configuration directory.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    if let Some(user_dir) = dirs::config_dir() {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = user_dir.join("deploybox").join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }
    }

    Err(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeLookupPolicy;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_parse_minimal_config() {
        let parser = ConfigParser::new();
        let config = parser.parse_yaml("", None).expect("parse");
        assert_eq!(config, EngineConfig::default());

        let config = parser
            .parse_yaml("state:\n  backend: local\n", None)
            .expect("parse");
        assert_eq!(config.state.backend, StateBackend::Local);
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r"
azure:
  subscription_id: sub-1
  tenant_id: tenant-1
  client_id: client-1
  location: westeurope
  registry:
    name: deployboxcr
    resource_group: platform-rg

mongodbatlas:
  public_key: pub
  project_id: proj-1

state:
  backend: s3
  bucket: deploybox-bundles
  prefix: prod

executor:
  binary: tofu

build:
  poll_interval_secs: 15
  deadline_secs: 1800

change_detection:
  policy: fail_closed

billing:
  max_attempts: 3
  base_delay_secs: 2

stacks:
  dir: /var/lib/deploybox/stacks
";
        let config = ConfigParser::new().parse_yaml(yaml, None).expect("parse");

        assert_eq!(config.azure.location, "westeurope");
        assert_eq!(
            config.azure.registry.as_ref().map(|r| r.name.as_str()),
            Some("deployboxcr")
        );
        assert_eq!(config.state.backend, StateBackend::S3);
        assert_eq!(config.executor.binary, "tofu");
        assert_eq!(config.build.deadline_secs, Some(1800));
        assert_eq!(config.change_detection.policy, ChangeLookupPolicy::FailClosed);
        assert_eq!(config.billing.max_attempts, 3);
        assert_eq!(config.stacks.dir, PathBuf::from("/var/lib/deploybox/stacks"));
    }

    #[test]
    fn test_unknown_policy_is_parse_error() {
        let err = ConfigParser::new()
            .parse_yaml("change_detection:\n  policy: sometimes\n", None)
            .expect_err("invalid");
        assert!(err.to_string().contains("YAML parse error"));
    }

    #[test]
    fn test_env_overrides_and_secrets() {
        let mut config = ConfigParser::new()
            .parse_yaml(
                "azure:\n  registry:\n    name: cr\n    resource_group: rg\n",
                None,
            )
            .expect("parse");

        let env: HashMap<&str, &str> = HashMap::from([
            ("DEPLOYBOX_STATE_BACKEND", "s3"),
            ("DEPLOYBOX_STATE_BUCKET", "bucket"),
            ("DEPLOYBOX_AZURE_SUBSCRIPTION_ID", "sub-env"),
            ("ARM_CLIENT_SECRET", "s3cret"),
            ("ACR_PASSWORD", "acr-pw"),
            ("GITHUB_TOKEN", ""),
        ]);
        ConfigParser::apply_env(&mut config, |name| env.get(name).map(|v| (*v).to_string()));

        assert_eq!(config.state.backend, StateBackend::S3);
        assert_eq!(config.state.bucket.as_deref(), Some("bucket"));
        assert_eq!(config.azure.subscription_id, "sub-env");
        assert_eq!(config.azure.client_secret.as_deref(), Some("s3cret"));
        assert_eq!(
            config.azure.registry.as_ref().and_then(|r| r.password.as_deref()),
            Some("acr-pw")
        );
        assert!(config.change_detection.token.is_none());
        assert!(ConfigParser::require_deploy_secrets(&config).is_ok());
    }

    #[test]
    fn test_missing_secret() {
        let config = EngineConfig::default();
        let err = ConfigParser::require_deploy_secrets(&config).expect_err("missing");
        assert!(err.to_string().contains("ARM_CLIENT_SECRET"));
    }

    #[test]
    fn test_find_config_file_walks_up() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        std::fs::write(temp_dir.path().join("deploybox.yaml"), "").expect("write");
        let nested = temp_dir.path().join("a/b");
        std::fs::create_dir_all(&nested).expect("mkdir");

        let found = find_config_file(&nested).expect("found");
        assert_eq!(found, temp_dir.path().join("deploybox.yaml"));
    }

    #[test]
    fn test_relative_paths_follow_config_file() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("deploybox.yaml");
        std::fs::write(&path, "stacks:\n  dir: stacks\nstate:\n  path: bundles\n").expect("write");

        let config = ConfigParser::new().load_file(&path).expect("load");
        assert_eq!(config.stacks.dir, temp_dir.path().join("stacks"));
        assert_eq!(config.state.path, Some(temp_dir.path().join("bundles")));
    }
}
