//! Error types for the DeployBox provisioning engine.
//!
//! Every subsystem owns an error enum; all of them convert into
//! [`DeployBoxError`] so callers can use a single [`Result`] alias.
//! [`DeployBoxError::kind`] folds the variants into the coarse
//! [`ErrorKind`] taxonomy used for reporting and retry decisions.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the DeployBox engine.
#[derive(Debug, Error)]
pub enum DeployBoxError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Resource registry errors.
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Durable state and stack metadata errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Errors returned by external HTTP services.
    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    /// Document planning and merge errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Container image build errors.
    #[error("Build error: {0}")]
    Build(#[from] BuildError),

    /// External infrastructure tool errors.
    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse error classification shared by every subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input: bad URLs, missing fields, schema violations.
    Validation,
    /// Unknown identifier, kind or stack.
    NotFound,
    /// Non-success response from an external dependency.
    Upstream,
    /// Rate-limit retries were exhausted.
    RateLimitExceeded,
    /// The infrastructure tool exited unsuccessfully.
    ExecutorFailure,
    /// A build job ended in a state other than success.
    BuildFailure,
    /// Durable store or lease failure.
    State,
    /// Anything else.
    Internal,
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Validation failed: {message}")]
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
}

/// Resource registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Two kinds were registered under the same identifier prefix.
    #[error("Prefix '{prefix}' is already registered for {existing}, cannot register {kind}")]
    DuplicatePrefix {
        /// The colliding prefix.
        prefix: String,
        /// Kind already owning the prefix.
        existing: String,
        /// Kind that attempted to register.
        kind: String,
    },

    /// The same kind was registered twice.
    #[error("Resource kind {kind} is already registered")]
    DuplicateKind {
        /// The duplicated kind.
        kind: String,
    },

    /// No registered kind owns the identifier's prefix.
    #[error("No resource kind registered for identifier '{id}'")]
    UnknownPrefix {
        /// The identifier that could not be dispatched.
        id: String,
    },

    /// The kind is known but not registered in this registry.
    #[error("Resource kind {kind} is not registered")]
    KindNotRegistered {
        /// The unregistered kind.
        kind: String,
    },

    /// No record exists for the identifier.
    #[error("Resource not found: {id}")]
    NotFound {
        /// The missing identifier.
        id: String,
    },

    /// Attributes failed schema validation.
    #[error("Invalid attributes for {kind}: {message}")]
    Schema {
        /// Kind whose schema rejected the data.
        kind: String,
        /// Validation details.
        message: String,
    },
}

/// Durable state and stack metadata errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// Stored data is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// Lease acquisition failed.
    #[error("Failed to acquire stack lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// Lease is held by another run.
    #[error("Stack is locked by another run (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// S3 backend error.
    #[error("S3 bundle backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Local filesystem backend error.
    #[error("Local bundle backend error: {message}")]
    LocalError {
        /// Description of the filesystem error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// No stack record exists for the identifier.
    #[error("Stack not found: {stack_id}")]
    StackNotFound {
        /// The missing stack identifier.
        stack_id: String,
    },
}

/// Errors returned by external HTTP services.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Authentication failed.
    #[error("{service} authentication failed: {message}")]
    AuthenticationFailed {
        /// Service that rejected the credentials.
        service: String,
        /// Description of the auth failure.
        message: String,
    },

    /// API request returned a non-success status.
    #[error("{service} request failed: {status} - {message}")]
    ApiRequestFailed {
        /// Service that failed.
        service: String,
        /// HTTP status code.
        status: u16,
        /// Response body or error message.
        message: String,
    },

    /// A single request was rate limited.
    #[error("{service} rate limited, retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Service that throttled the request.
        service: String,
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// Rate-limit retries were exhausted.
    #[error("Rate limit exceeded after {attempts} attempts")]
    RateLimitExceeded {
        /// Number of attempts made.
        attempts: u32,
    },

    /// Network error.
    #[error("Network error communicating with {service}: {message}")]
    NetworkError {
        /// Service being contacted.
        service: String,
        /// Description of the network error.
        message: String,
    },

    /// Response could not be interpreted.
    #[error("Invalid response from {service}: {message}")]
    InvalidResponse {
        /// Service that responded.
        service: String,
        /// Description of the response issue.
        message: String,
    },
}

/// Document planning and merge errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// A planner fragment tried to overwrite an existing entry.
    #[error("Planner '{planner}' cannot overwrite existing entry {path}")]
    MergeConflict {
        /// Namespace of the planner whose fragment conflicted.
        planner: String,
        /// Dotted path of the conflicting entry.
        path: String,
    },

    /// A resource entry has an unexpected shape.
    #[error("Invalid resource {path}: {message}")]
    InvalidResource {
        /// Dotted path of the resource.
        path: String,
        /// Description of the problem.
        message: String,
    },

    /// The document still contains build placeholders.
    #[error("Document still contains {count} unresolved build task(s)")]
    UnresolvedBuildTasks {
        /// Number of placeholders found.
        count: usize,
    },
}

/// Container image build errors.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The build source location is malformed.
    #[error("Invalid build source '{url}': {reason}")]
    InvalidSource {
        /// The rejected URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The build job reached a terminal state other than success.
    #[error("Build run {run_id} finished with status {status}")]
    Failed {
        /// Build run identifier.
        run_id: String,
        /// Terminal status reported by the build service.
        status: String,
    },

    /// The build job produced no output image.
    #[error("Build run {run_id} succeeded without an output image")]
    MissingOutput {
        /// Build run identifier.
        run_id: String,
    },

    /// Polling exceeded the configured deadline.
    #[error("Build run {run_id} did not finish within {waited_secs} seconds")]
    Timeout {
        /// Build run identifier.
        run_id: String,
        /// How long the run was polled.
        waited_secs: u64,
    },

    /// Polling was cancelled by the caller.
    #[error("Build run {run_id} was cancelled while waiting")]
    Cancelled {
        /// Build run identifier.
        run_id: String,
    },
}

/// External infrastructure tool errors.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// A lifecycle step exited unsuccessfully.
    #[error("Executor step '{step}' failed (exit code {exit_code:?})\nstdout:\n{stdout}\nstderr:\n{stderr}")]
    StepFailed {
        /// Step that failed (init, plan, apply, destroy).
        step: String,
        /// Exit code, if the process exited normally.
        exit_code: Option<i32>,
        /// Captured standard output.
        stdout: String,
        /// Captured standard error.
        stderr: String,
    },

    /// The executor binary could not be started.
    #[error("Failed to spawn executor '{binary}': {message}")]
    SpawnFailed {
        /// Binary that was launched.
        binary: String,
        /// Description of the spawn failure.
        message: String,
    },
}

/// Result type alias for DeployBox operations.
pub type Result<T> = std::result::Result<T, DeployBoxError>;

impl DeployBoxError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Classifies the error into the shared taxonomy.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(ConfigError::FileNotFound { .. })
            | Self::Registry(
                RegistryError::UnknownPrefix { .. }
                | RegistryError::NotFound { .. }
                | RegistryError::KindNotRegistered { .. },
            )
            | Self::State(StateError::StackNotFound { .. }) => ErrorKind::NotFound,
            Self::Config(_)
            | Self::Registry(_)
            | Self::Build(BuildError::InvalidSource { .. })
            | Self::Plan(PlanError::InvalidResource { .. } | PlanError::MergeConflict { .. }) => {
                ErrorKind::Validation
            }
            Self::Upstream(UpstreamError::RateLimitExceeded { .. }) => {
                ErrorKind::RateLimitExceeded
            }
            Self::Upstream(_) => ErrorKind::Upstream,
            Self::Executor(_) => ErrorKind::ExecutorFailure,
            Self::Build(_) => ErrorKind::BuildFailure,
            Self::State(_) => ErrorKind::State,
            Self::Plan(_) | Self::Io(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Upstream(
                UpstreamError::RateLimited { .. } | UpstreamError::NetworkError { .. }
            ) | Self::State(StateError::LockFailed { .. })
        )
    }

    /// Returns the suggested retry delay in seconds, if applicable.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::Upstream(UpstreamError::RateLimited {
                retry_after_secs, ..
            }) => Some(*retry_after_secs),
            Self::Upstream(UpstreamError::NetworkError { .. }) => Some(5),
            Self::State(StateError::LockFailed { .. }) => Some(2),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Upstream => "upstream",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::ExecutorFailure => "executor_failure",
            Self::BuildFailure => "build_failure",
            Self::State => "state",
            Self::Internal => "internal",
        };
        f.write_str(name)
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
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a local backend error with the given message.
    #[must_use]
    pub fn local(message: impl Into<String>) -> Self {
        Self::LocalError {
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

    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }
}

impl UpstreamError {
    /// Creates an API request error.
    #[must_use]
    pub fn api_error(service: &str, status: u16, message: impl Into<String>) -> Self {
        Self::ApiRequestFailed {
            service: service.to_string(),
            status,
            message: message.into(),
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(service: &str, message: impl Into<String>) -> Self {
        Self::NetworkError {
            service: service.to_string(),
            message: message.into(),
        }
    }

    /// Creates an invalid-response error.
    #[must_use]
    pub fn invalid_response(service: &str, message: impl Into<String>) -> Self {
        Self::InvalidResponse {
            service: service.to_string(),
            message: message.into(),
        }
    }
}
