//! Configuration validation for the engine.
//!
//! Checks that values are usable before any external system is contacted.
//! Every problem is collected; the first error is also returned as a
//! [`ConfigError::ValidationError`].

use crate::error::{ConfigError, DeployBoxError, Result};
use tracing::debug;

use super::spec::{
    AzureConfig, BillingConfig, BuildConfig, EngineConfig, MongoAtlasConfig, StateBackend,
    StateConfig,
};

/// Validator for engine configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
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

    /// Validates an engine configuration.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any check fails.
    pub fn validate(&self, config: &EngineConfig) -> Result<ValidationResult> {
        let mut result = ValidationResult::default();

        Self::validate_azure(&config.azure, &mut result);
        Self::validate_mongodb(&config.mongodbatlas, &mut result);
        Self::validate_state(&config.state, &mut result);
        Self::validate_build(&config.build, &mut result);
        Self::validate_billing(&config.billing, &mut result);

        if config.executor.binary.trim().is_empty() {
            result.push("executor.binary", "Executor binary cannot be empty");
        }

        if result.errors.is_empty() {
            debug!(
                "Configuration validation passed with {} warning(s)",
                result.warnings.len()
            );
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(DeployBoxError::Config(ConfigError::validation(
                first_error.message.clone(),
                first_error.field.clone(),
            )))
        }
    }

    fn validate_azure(azure: &AzureConfig, result: &mut ValidationResult) {
        for (field, value) in [
            ("azure.subscription_id", &azure.subscription_id),
            ("azure.tenant_id", &azure.tenant_id),
            ("azure.client_id", &azure.client_id),
        ] {
            if value.trim().is_empty() {
                result.push(field, format!("{field} is required"));
            }
        }

        if azure.location.trim().is_empty() {
            result.push("azure.location", "Location cannot be empty");
        }

        match &azure.registry {
            Some(registry) => {
                if !is_valid_registry_name(&registry.name) {
                    result.push(
                        "azure.registry.name",
                        format!(
                            "Registry name '{}' is invalid. Must be 5-50 lowercase letters or digits.",
                            registry.name
                        ),
                    );
                }
                if registry.resource_group.trim().is_empty() {
                    result.push(
                        "azure.registry.resource_group",
                        "Registry resource group cannot be empty",
                    );
                }
            }
            None => result.warnings.push(String::from(
                "No container registry configured; build tasks cannot be resolved",
            )),
        }
    }

    fn validate_mongodb(atlas: &MongoAtlasConfig, result: &mut ValidationResult) {
        if !atlas.public_key.is_empty() && atlas.project_id.is_none() {
            result.warnings.push(String::from(
                "mongodbatlas.project_id is not set; Atlas resources must name their project",
            ));
        }
    }

    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        if state.backend == StateBackend::S3
            && state.bucket.as_ref().is_none_or(|b| b.trim().is_empty())
        {
            result.push(
                "state.bucket",
                "S3 bucket name is required when using S3 backend",
            );
        }
    }

    fn validate_build(build: &BuildConfig, result: &mut ValidationResult) {
        if build.poll_interval_secs == 0 {
            result.push("build.poll_interval_secs", "Poll interval must be at least 1 second");
        }
        if let Some(deadline) = build.deadline_secs {
            if deadline == 0 {
                result.push("build.deadline_secs", "Deadline must be at least 1 second");
            } else if deadline < build.poll_interval_secs {
                result.warnings.push(format!(
                    "build.deadline_secs ({deadline}) is shorter than the poll interval; builds get a single status check"
                ));
            }
        }
    }

    fn validate_billing(billing: &BillingConfig, result: &mut ValidationResult) {
        if billing.max_attempts == 0 {
            result.push("billing.max_attempts", "At least one attempt is required");
        }
    }
}

/// Registry names are 5 to 50 lowercase ASCII letters or digits.
fn is_valid_registry_name(name: &str) -> bool {
    (5..=50).contains(&name.len())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
}

impl ValidationResult {
    fn push(&mut self, field: &str, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.to_string(),
            message: message.into(),
        });
    }

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
