//! Engine configuration structures.
//!
//! These types map one-to-one onto `deploybox.yaml`. Secrets are never read
//! from the file; [`super::ConfigParser`] fills them from the environment.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::change::ChangeLookupPolicy;
use crate::clock::{PollPolicy, DEFAULT_POLL_INTERVAL_SECS};
use crate::registry::DEFAULT_LOCATION;

/// Root configuration for the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    /// Azure credentials and placement.
    #[serde(default)]
    pub azure: AzureConfig,
    /// MongoDB Atlas credentials.
    #[serde(default)]
    pub mongodbatlas: MongoAtlasConfig,
    /// Workspace bundle storage.
    #[serde(default)]
    pub state: StateConfig,
    /// Infrastructure tool.
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Image build polling.
    #[serde(default)]
    pub build: BuildConfig,
    /// Source change detection.
    #[serde(default)]
    pub change_detection: ChangeDetectionConfig,
    /// Cost query retries.
    #[serde(default)]
    pub billing: BillingConfig,
    /// Stack record storage.
    #[serde(default)]
    pub stacks: StacksConfig,
}

/// Azure settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AzureConfig {
    /// Subscription to deploy into and bill against.
    #[serde(default)]
    pub subscription_id: String,
    /// Directory (tenant) identifier.
    #[serde(default)]
    pub tenant_id: String,
    /// Service principal application identifier.
    #[serde(default)]
    pub client_id: String,
    /// Service principal secret, from `ARM_CLIENT_SECRET`.
    #[serde(skip)]
    pub client_secret: Option<String>,
    /// Default region.
    #[serde(default = "default_location")]
    pub location: String,
    /// Container registry used for builds and image pulls.
    #[serde(default)]
    pub registry: Option<RegistryConfig>,
    /// Identity authority override.
    #[serde(default)]
    pub authority_url: Option<String>,
    /// Management endpoint override.
    #[serde(default)]
    pub management_url: Option<String>,
}

impl Default for AzureConfig {
    fn default() -> Self {
        Self {
            subscription_id: String::new(),
            tenant_id: String::new(),
            client_id: String::new(),
            client_secret: None,
            location: default_location(),
            registry: None,
            authority_url: None,
            management_url: None,
        }
    }
}

/// Container registry settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Registry name, without `.azurecr.io`.
    pub name: String,
    /// Resource group holding the registry.
    pub resource_group: String,
    /// Admin password, from `ACR_PASSWORD`.
    #[serde(skip)]
    pub password: Option<String>,
}

/// MongoDB Atlas settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MongoAtlasConfig {
    /// Programmatic API public key.
    #[serde(default)]
    pub public_key: String,
    /// Programmatic API private key, from `MONGODB_ATLAS_PRIVATE_KEY`.
    #[serde(skip)]
    pub private_key: Option<String>,
    /// Project applied to Atlas resources that name none.
    #[serde(default)]
    pub project_id: Option<String>,
}

/// Bundle store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local bundle directory (for local backend).
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Bundle store backends.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local directory.
    #[default]
    Local,
    /// AWS S3 bucket.
    S3,
}

/// Infrastructure tool settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Binary name or path.
    #[serde(default = "default_binary")]
    pub binary: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
        }
    }
}

/// Build polling settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildConfig {
    /// Seconds between status polls.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Maximum seconds to wait for one build; unset waits indefinitely.
    #[serde(default)]
    pub deadline_secs: Option<u64>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            deadline_secs: None,
        }
    }
}

impl BuildConfig {
    /// Poll policy described by this section.
    #[must_use]
    pub fn poll_policy(&self) -> PollPolicy {
        let policy = PollPolicy::every(Duration::from_secs(self.poll_interval_secs));
        match self.deadline_secs {
            Some(deadline) => policy.with_deadline(Duration::from_secs(deadline)),
            None => policy,
        }
    }
}

/// Change detection settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeDetectionConfig {
    /// Behaviour when the revision lookup fails.
    #[serde(default)]
    pub policy: ChangeLookupPolicy,
    /// Source-control API override.
    #[serde(default)]
    pub api_url: Option<String>,
    /// Source-control token, from `GITHUB_TOKEN`.
    #[serde(skip)]
    pub token: Option<String>,
}

/// Cost query settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BillingConfig {
    /// Attempts before giving up on a throttled query.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base backoff in seconds, doubled per attempt.
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: u64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay(),
        }
    }
}

/// Stack record storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StacksConfig {
    /// Directory of `<stack_id>.json` records.
    #[serde(default = "default_stacks_dir")]
    pub dir: PathBuf,
}

impl Default for StacksConfig {
    fn default() -> Self {
        Self {
            dir: default_stacks_dir(),
        }
    }
}

fn default_location() -> String {
    DEFAULT_LOCATION.to_string()
}

fn default_binary() -> String {
    String::from(crate::executor::DEFAULT_BINARY)
}

const fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_base_delay() -> u64 {
    1
}

fn default_stacks_dir() -> PathBuf {
    PathBuf::from(".deploybox/stacks")
}
