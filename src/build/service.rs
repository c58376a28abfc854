//! Remote container image builds.

use async_trait::async_trait;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::{debug, info};

use crate::azure::ArmClient;
use crate::change::SourceLocation;
use crate::error::{BuildError, Result, UpstreamError};

/// API version for registry task creation and scheduling.
pub const TASKS_API_VERSION: &str = "2025-03-01-preview";

/// API version for run status queries.
pub const RUNS_API_VERSION: &str = "2019-06-01-preview";

/// Dockerfile used when a task names none.
pub const DEFAULT_DOCKERFILE: &str = "Dockerfile";

const SERVICE: &str = "Azure Container Registry";

const FINGERPRINT_LEN: usize = 16;

/// One image build, parsed from a task placeholder.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildRequest {
    /// Repository, branch and directory to build from.
    pub source: SourceLocation,
    /// Dockerfile path relative to the context.
    pub dockerfile_path: String,
    /// Image names to tag and push.
    pub image_names: Vec<String>,
    /// Token granting the build service read access to the repository.
    pub access_token: Option<String>,
    /// Extra build arguments, passed through untouched.
    pub arguments: Vec<Value>,
    /// Region for the build task, if the placeholder names one.
    pub region: Option<String>,
}

impl BuildRequest {
    /// Parses a task definition.
    ///
    /// Accepts either the flat form (`contextPath`, `contextDirectory`,
    /// `dockerFilePath`, ...) or the registry task form with the same keys
    /// under `properties.step`.
    ///
    /// # Errors
    ///
    /// Returns a validation error if `contextPath` is missing or malformed.
    pub fn from_task(task: &Value) -> Result<Self> {
        let step = task.pointer("/properties/step").unwrap_or(task);
        let text = |key: &str| {
            step.get(key)
                .or_else(|| task.get(key))
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
        };

        let context = text("contextPath").ok_or_else(|| BuildError::InvalidSource {
            url: String::new(),
            reason: String::from("build task has no contextPath"),
        })?;

        let mut source = SourceLocation::parse(context)?;
        if let Some(directory) = text("contextDirectory") {
            source = source.with_subdirectory(directory);
        }

        let image_names = step
            .get("imageNames")
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let arguments = step
            .get("arguments")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(Self {
            source,
            dockerfile_path: text("dockerFilePath").unwrap_or(DEFAULT_DOCKERFILE).to_string(),
            image_names,
            access_token: text("contextAccessToken").map(str::to_string),
            arguments,
            region: task.get("location").and_then(Value::as_str).map(str::to_string),
        })
    }

    /// Short digest of everything besides the source that shapes the image:
    /// Dockerfile path, image names and build arguments.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let shape = json!({
            "dockerfile": self.dockerfile_path,
            "images": self.image_names,
            "arguments": self.arguments,
        });
        let digest = hex::encode(Sha256::digest(shape.to_string().as_bytes()));
        digest[..FINGERPRINT_LEN].to_string()
    }

    /// State key holding the last image built for this exact request.
    ///
    /// Prefixed by [`SourceLocation::image_key`], so every image of a source
    /// can be discarded together when the source moves.
    #[must_use]
    pub fn image_key(&self) -> String {
        format!("{}-{}", self.source.image_key(), self.fingerprint())
    }
}

/// True when `key` is a per-request image key of `source`.
pub(crate) fn is_image_key_of(source: &SourceLocation, key: &str) -> bool {
    key.strip_prefix(&source.image_key())
        .and_then(|rest| rest.strip_prefix('-'))
        .is_some_and(|fingerprint| {
            fingerprint.len() == FINGERPRINT_LEN
                && fingerprint.bytes().all(|b| b.is_ascii_hexdigit())
        })
}

/// Status of a build run as reported by the build service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    /// Waiting for an agent.
    Queued,
    /// Building.
    Running,
    /// Finished and pushed.
    Succeeded,
    /// Finished unsuccessfully.
    Failed,
    /// Cancelled by the service or an operator.
    Canceled,
    /// Errored inside the build service.
    Error,
    /// Exceeded the service's own time limit.
    Timeout,
    /// Any status this engine does not recognize.
    Other(String),
}

impl RunStatus {
    /// Parses a status string.
    #[must_use]
    pub fn parse(status: &str) -> Self {
        match status {
            "Queued" => Self::Queued,
            "Started" | "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            "Canceled" => Self::Canceled,
            "Error" => Self::Error,
            "Timeout" => Self::Timeout,
            other => Self::Other(other.to_string()),
        }
    }

    /// Returns true if the run will not change state again.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Canceled | Self::Error | Self::Timeout
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "Queued"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
            Self::Canceled => write!(f, "Canceled"),
            Self::Error => write!(f, "Error"),
            Self::Timeout => write!(f, "Timeout"),
            Self::Other(status) => write!(f, "{status}"),
        }
    }
}

/// A polled build run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRun {
    /// Current status.
    pub status: RunStatus,
    /// `registry/repository:latest` of the first output image, once known.
    pub output_image: Option<String>,
}

/// Remote service that builds container images.
#[async_trait]
pub trait BuildService: Send + Sync {
    /// Submits a build and returns its run identifier.
    async fn submit(&self, request: &BuildRequest) -> Result<String>;

    /// Fetches the current state of a run.
    async fn run(&self, run_id: &str) -> Result<BuildRun>;
}

/// Registry identity used by [`RegistryBuildService`].
#[derive(Debug, Clone)]
pub struct RegistryTarget {
    /// Subscription owning the registry.
    pub subscription_id: String,
    /// Resource group holding the registry.
    pub resource_group: String,
    /// Registry name.
    pub registry_name: String,
    /// Region for created tasks.
    pub location: String,
}

impl RegistryTarget {
    fn registry_path(&self) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.ContainerRegistry/registries/{}",
            self.subscription_id, self.resource_group, self.registry_name
        )
    }
}

/// Builds images with Azure Container Registry tasks.
///
/// Each build creates a one-off task and schedules a run of it.
#[derive(Debug, Clone)]
pub struct RegistryBuildService {
    arm: ArmClient,
    target: RegistryTarget,
}

impl RegistryBuildService {
    /// Creates a build service for the given registry.
    #[must_use]
    pub const fn new(arm: ArmClient, target: RegistryTarget) -> Self {
        Self { arm, target }
    }

    fn task_definition(&self, request: &BuildRequest) -> Value {
        json!({
            "location": request.region.as_deref().unwrap_or(&self.target.location),
            "properties": {
                "status": "Enabled",
                "platform": {"os": "Linux", "architecture": "amd64"},
                "agentConfiguration": {"cpu": 2},
                "step": {
                    "type": "Docker",
                    "dockerFilePath": request.dockerfile_path,
                    "contextPath": request.source.build_context(),
                    "contextAccessToken": request.access_token,
                    "imageNames": request.image_names,
                    "isPushEnabled": true,
                    "noCache": false,
                    "arguments": request.arguments,
                }
            }
        })
    }
}

#[async_trait]
impl BuildService for RegistryBuildService {
    async fn submit(&self, request: &BuildRequest) -> Result<String> {
        let task_name = format!("build-task-{}", uuid::Uuid::new_v4().simple());
        let task_path = format!("{}/tasks/{task_name}", self.target.registry_path());

        self.arm
            .put_json(
                &format!("{task_path}?api-version={TASKS_API_VERSION}"),
                &self.task_definition(request),
            )
            .await?;
        debug!("Created build task {task_name} for {}", request.source);

        let response = self
            .arm
            .post_json(
                &format!(
                    "{}/scheduleRun?api-version={TASKS_API_VERSION}",
                    self.target.registry_path()
                ),
                &json!({"type": "TaskRunRequest", "taskId": task_path}),
            )
            .await?;

        let run_id = response
            .pointer("/properties/runId")
            .and_then(Value::as_str)
            .ok_or_else(|| UpstreamError::invalid_response(SERVICE, "scheduleRun returned no runId"))?;

        info!("Scheduled build run {run_id} for {}", request.source);
        Ok(run_id.to_string())
    }

    async fn run(&self, run_id: &str) -> Result<BuildRun> {
        let response = self
            .arm
            .get_json(&format!(
                "{}/runs/{run_id}?api-version={RUNS_API_VERSION}",
                self.target.registry_path()
            ))
            .await?;

        let properties = response.get("properties").unwrap_or(&Value::Null);
        let status = properties
            .get("status")
            .and_then(Value::as_str)
            .map_or(RunStatus::Queued, RunStatus::parse);

        let output_image = properties
            .pointer("/outputImages/0")
            .and_then(|image| {
                let registry = image.get("registry")?.as_str()?;
                let repository = image.get("repository")?.as_str()?;
                Some(format!("{registry}/{repository}:latest"))
            });

        Ok(BuildRun {
            status,
            output_image,
        })
    }
}
