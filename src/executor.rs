//! Driver for the external declarative-infrastructure tool.
//!
//! The tool runs inside a workspace directory holding `main.tf.json` and
//! any restored state. Every step is a separate process; a non-zero exit
//! becomes [`ExecutorError::StepFailed`] carrying the captured output.

use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{ExecutorError, Result};
use crate::state::PLAN_FILE;

/// Binary used when none is configured.
pub const DEFAULT_BINARY: &str = "terraform";

/// One lifecycle step of the tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Download providers and prepare the working directory.
    Init,
    /// Compute changes into the plan file.
    Plan,
    /// Apply the plan file.
    Apply,
    /// Tear everything down.
    Destroy,
}

impl Step {
    /// Command-line arguments for the step.
    #[must_use]
    pub fn args(self) -> Vec<String> {
        let args: &[&str] = match self {
            Self::Init => &["init", "-input=false"],
            Self::Plan => &["plan", "-input=false"],
            Self::Apply => &["apply", "-input=false", "-auto-approve"],
            Self::Destroy => &["destroy", "-input=false", "-auto-approve"],
        };
        let mut args: Vec<String> = args.iter().map(|a| (*a).to_string()).collect();
        match self {
            Self::Plan => args.push(format!("-out={PLAN_FILE}")),
            Self::Apply => args.push(PLAN_FILE.to_string()),
            Self::Init | Self::Destroy => {}
        }
        args
    }

    /// Step name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Plan => "plan",
            Self::Apply => "apply",
            Self::Destroy => "destroy",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Captured output of a successful step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutput {
    /// The step that ran.
    pub step: Step,
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
}

/// Runs tool steps in a workspace directory.
#[async_trait]
pub trait InfraExecutor: Send + Sync {
    /// Runs one step.
    async fn run(&self, step: Step, dir: &Path) -> Result<StepOutput>;

    /// `init`, then `plan` into the plan file, then `apply` of that plan.
    async fn apply_all(&self, dir: &Path) -> Result<Vec<StepOutput>> {
        let mut outputs = Vec::with_capacity(3);
        for step in [Step::Init, Step::Plan, Step::Apply] {
            outputs.push(self.run(step, dir).await?);
        }
        Ok(outputs)
    }

    /// `init`, then `destroy`.
    async fn destroy_all(&self, dir: &Path) -> Result<Vec<StepOutput>> {
        let mut outputs = Vec::with_capacity(2);
        for step in [Step::Init, Step::Destroy] {
            outputs.push(self.run(step, dir).await?);
        }
        Ok(outputs)
    }
}

/// Spawns the Terraform-compatible binary.
#[derive(Debug, Clone)]
pub struct TerraformExecutor {
    binary: PathBuf,
}

impl Default for TerraformExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_BINARY)
    }
}

impl TerraformExecutor {
    /// Creates an executor for the given binary name or path.
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// The configured binary.
    #[must_use]
    pub fn binary(&self) -> &Path {
        &self.binary
    }
}

#[async_trait]
impl InfraExecutor for TerraformExecutor {
    async fn run(&self, step: Step, dir: &Path) -> Result<StepOutput> {
        info!("Running {} {step} in {}", self.binary.display(), dir.display());

        let output = Command::new(&self.binary)
            .args(step.args())
            .current_dir(dir)
            .env("TF_IN_AUTOMATION", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ExecutorError::SpawnFailed {
                binary: self.binary.display().to_string(),
                message: e.to_string(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            return Err(ExecutorError::StepFailed {
                step: step.to_string(),
                exit_code: output.status.code(),
                stdout,
                stderr,
            }
            .into());
        }

        debug!("{step} finished ({} bytes of output)", stdout.len());
        Ok(StepOutput {
            step,
            stdout,
            stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DeployBoxError, ErrorKind};

    #[test]
    fn test_step_arguments() {
        assert_eq!(Step::Init.args(), vec!["init", "-input=false"]);
        assert_eq!(Step::Plan.args(), vec!["plan", "-input=false", "-out=tfplan"]);
        assert_eq!(
            Step::Apply.args(),
            vec!["apply", "-input=false", "-auto-approve", "tfplan"]
        );
        assert_eq!(
            Step::Destroy.args(),
            vec!["destroy", "-input=false", "-auto-approve"]
        );
    }

    #[tokio::test]
    async fn test_missing_binary_fails_to_spawn() {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let executor = TerraformExecutor::new("deploybox-no-such-binary");

        let err = executor
            .run(Step::Init, temp_dir.path())
            .await
            .expect_err("spawn");
        assert!(matches!(
            err,
            DeployBoxError::Executor(ExecutorError::SpawnFailed { .. })
        ));
        assert_eq!(err.kind(), ErrorKind::ExecutorFailure);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_script_steps() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let script = temp_dir.path().join("fake-tf");
        std::fs::write(
            &script,
            "#!/bin/sh\necho \"ran $1\"\nif [ \"$1\" = apply ]; then echo 'quota exceeded' >&2; exit 3; fi\n",
        )
        .expect("write script");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .expect("chmod");

        let executor = TerraformExecutor::new(&script);

        let output = executor
            .run(Step::Init, temp_dir.path())
            .await
            .expect("init");
        assert_eq!(output.stdout.trim(), "ran init");

        let err = executor
            .apply_all(temp_dir.path())
            .await
            .expect_err("apply fails");
        match err {
            DeployBoxError::Executor(ExecutorError::StepFailed {
                step,
                exit_code,
                stdout,
                stderr,
            }) => {
                assert_eq!(step, "apply");
                assert_eq!(exit_code, Some(3));
                assert_eq!(stdout.trim(), "ran apply");
                assert_eq!(stderr.trim(), "quota exceeded");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
