//! Scratch directory for one executor run.
//!
//! The directory is created empty, filled from the stored bundle plus the
//! freshly planned document, and removed when the [`Workspace`] drops.

use std::path::Path;
use tempfile::TempDir;
use tokio::fs;
use tracing::debug;

use crate::document::Document;
use crate::error::{Result, StateError};
use crate::state::{
    read_tree, write_tree, ProvisioningState, WorkspaceBundle, DOCUMENT_FILE,
    EXECUTION_STATE_FILE, PLAN_FILE, PROVISIONING_STATE_FILE, TOOL_CACHE_DIR,
};

/// A temporary working directory for the infrastructure tool.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// Creates an empty workspace in the system temp directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn create() -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("deploybox-")
            .tempdir()
            .map_err(|e| StateError::local(format!("Failed to create workspace: {e}")))?;
        debug!("Created workspace {}", dir.path().display());
        Ok(Self { dir })
    }

    /// Workspace root.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Writes every file of a stored bundle into the workspace.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be written.
    pub async fn restore(&self, bundle: &WorkspaceBundle) -> Result<()> {
        write_tree(self.path(), bundle).await?;
        debug!("Restored {} file(s) into {}", bundle.len(), self.path().display());
        Ok(())
    }

    /// Writes the document as `main.tf.json`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub async fn write_document(&self, document: &Document) -> Result<()> {
        let content = document.to_json_pretty()?;
        fs::write(self.path().join(DOCUMENT_FILE), content).await?;
        Ok(())
    }

    /// Writes the provisioning state file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub async fn write_state(&self, state: &ProvisioningState) -> Result<()> {
        let content = state.to_json_pretty()?;
        fs::write(self.path().join(PROVISIONING_STATE_FILE), content).await?;
        Ok(())
    }

    /// Reads the execution state written by the tool, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    pub async fn execution_state(&self) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path().join(EXECUTION_STATE_FILE)).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Collects the workspace into a bundle, leaving out the plan file and
    /// the tool's provider cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the tree cannot be read.
    pub async fn collect(&self) -> Result<WorkspaceBundle> {
        read_tree(self.path(), is_transient).await
    }
}

/// Artifacts that are never persisted.
#[must_use]
pub fn is_transient(relative: &str) -> bool {
    relative == PLAN_FILE || relative == TOOL_CACHE_DIR || relative.starts_with(".terraform/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_restore_write_collect() {
        let workspace = Workspace::create().expect("workspace");

        let mut bundle = WorkspaceBundle::new();
        bundle.insert(EXECUTION_STATE_FILE, b"{\"serial\": 1}".to_vec());
        bundle.insert(".terraform.lock.hcl", b"# lock".to_vec());
        workspace.restore(&bundle).await.expect("restore");

        let document = Document::from_value(json!({"resource": {"random_pet": {"p": {}}}}))
            .expect("document");
        workspace.write_document(&document).await.expect("document");

        let mut state = ProvisioningState::new();
        state.set("azurerm", "resource_group_name", "s1-rg");
        workspace.write_state(&state).await.expect("state");

        fs::write(workspace.path().join(PLAN_FILE), b"binary plan")
            .await
            .expect("plan");
        fs::create_dir_all(workspace.path().join(".terraform/providers"))
            .await
            .expect("cache");
        fs::write(workspace.path().join(".terraform/providers/azurerm"), b"bin")
            .await
            .expect("provider");

        let collected = workspace.collect().await.expect("collect");
        let mut names: Vec<&str> = collected.files().map(|(path, _)| path).collect();
        names.sort_unstable();
        assert_eq!(
            names,
            vec![
                ".terraform.lock.hcl",
                "deploybox.state.json",
                "main.tf.json",
                "terraform.tfstate"
            ]
        );
        assert_eq!(collected.provisioning_state().expect("state"), state);
        assert_eq!(
            workspace.execution_state().await.expect("read"),
            Some(b"{\"serial\": 1}".to_vec())
        );
    }

    #[tokio::test]
    async fn test_dropping_removes_directory() {
        let workspace = Workspace::create().expect("workspace");
        let path = workspace.path().to_path_buf();
        assert!(path.exists());
        drop(workspace);
        assert!(!path.exists());
    }

    #[test]
    fn test_transient_paths() {
        assert!(is_transient("tfplan"));
        assert!(is_transient(".terraform"));
        assert!(!is_transient(".terraform.lock.hcl"));
        assert!(!is_transient("terraform.tfstate"));
    }
}
