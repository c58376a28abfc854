//! Local file-based bundle storage backend.
//!
//! This module stores each workspace bundle as a directory tree under a base
//! directory, for local development and single-machine deployments.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{DeployBoxError, Result, StateError};

use super::lock::{generate_holder_id, LockInfo, LOCK_EXPIRY_SECS};
use super::store::BundleStore;
use super::types::WorkspaceBundle;

/// Default state directory name.
const STATE_DIR: &str = ".deploybox";

/// Lock file suffix.
const LOCK_SUFFIX: &str = ".lock";

/// Local file-based bundle store.
#[derive(Debug, Clone)]
pub struct LocalBundleStore {
    /// Base directory holding one subdirectory per bundle.
    base_dir: PathBuf,
}

impl LocalBundleStore {
    /// Creates a store under `.deploybox/bundles` in the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| DeployBoxError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR)
            .join("bundles");

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Base directory of the store.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn bundle_dir(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.base_dir.join(key))
    }

    fn lock_path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.base_dir.join(format!("{key}{LOCK_SUFFIX}")))
    }

    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating bundle directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir).await.map_err(|e| {
                StateError::local(format!("Failed to create bundle directory: {e}"))
            })?;
        }
        Ok(())
    }

    async fn read_lock_file(path: &Path) -> Result<Option<LockInfo>> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StateError::corrupted(format!("Failed to read lock file: {e}")).into());
            }
        };

        let lock_info = serde_json::from_str(&content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse lock file: {e}")))?;

        Ok(Some(lock_info))
    }

    /// Creates the lock file only if it does not exist yet.
    async fn create_lock_file(path: &Path, lock_info: &LockInfo) -> Result<bool> {
        let content = serde_json::to_string_pretty(lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => {
                return Err(StateError::LockFailed {
                    message: format!("Failed to create lock file: {e}"),
                }
                .into());
            }
        };

        file.write_all(content.as_bytes()).await.map_err(|e| StateError::LockFailed {
            message: format!("Failed to write lock file: {e}"),
        })?;
        file.sync_all().await.map_err(|e| StateError::LockFailed {
            message: format!("Failed to sync lock file: {e}"),
        })?;

        Ok(true)
    }

    async fn remove_file_if_exists(path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::LockFailed {
                message: format!("Failed to delete lock file: {e}"),
            }
            .into()),
        }
    }
}

#[async_trait]
impl BundleStore for LocalBundleStore {
    async fn load(&self, key: &str) -> Result<Option<WorkspaceBundle>> {
        let dir = self.bundle_dir(key)?;
        if !dir.is_dir() {
            debug!("No bundle stored at: {}", dir.display());
            return Ok(None);
        }

        info!("Loading bundle from: {}", dir.display());
        let bundle = read_tree(&dir, |_| false).await?;
        Ok(Some(bundle))
    }

    async fn save(&self, key: &str, bundle: &WorkspaceBundle) -> Result<()> {
        self.ensure_dir().await?;
        let dir = self.bundle_dir(key)?;

        info!("Saving bundle ({} files) to: {}", bundle.len(), dir.display());

        // Stage the full tree first, then swap it in
        let staging = self.base_dir.join(format!(".{key}.staging-{}", Uuid::new_v4().simple()));
        write_tree(&staging, bundle).await?;

        if dir.exists() {
            fs::remove_dir_all(&dir).await.map_err(|e| {
                StateError::local(format!("Failed to replace bundle {}: {e}", dir.display()))
            })?;
        }
        fs::rename(&staging, &dir)
            .await
            .map_err(|e| StateError::local(format!("Failed to move bundle into place: {e}")))?;

        debug!("Bundle saved successfully");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let dir = self.bundle_dir(key)?;
        if dir.exists() {
            info!("Deleting bundle: {}", dir.display());
            fs::remove_dir_all(&dir)
                .await
                .map_err(|e| StateError::local(format!("Failed to delete bundle: {e}")))?;
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.bundle_dir(key)?.is_dir())
    }

    async fn acquire_lock(&self, key: &str, holder: &str) -> Result<LockInfo> {
        self.ensure_dir().await?;
        let path = self.lock_path(key)?;

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        let lock_info = LockInfo::new(key, &holder_id);

        if !Self::create_lock_file(&path, &lock_info).await? {
            if let Some(existing) = Self::read_lock_file(&path).await? {
                if !existing.is_expired() {
                    return Err(StateError::LockedByOther {
                        holder: existing.holder,
                        since: existing.acquired_at.to_rfc3339(),
                    }
                    .into());
                }
                debug!("Expired lock found for {key}, taking over");
                Self::remove_file_if_exists(&path).await?;
            }

            if !Self::create_lock_file(&path, &lock_info).await? {
                return Err(StateError::LockFailed {
                    message: format!("Lost race acquiring lock for {key}"),
                }
                .into());
            }
        }

        info!(
            "Acquired lock on {key}: {} (expires in {LOCK_EXPIRY_SECS}s)",
            lock_info.lock_id
        );
        Ok(lock_info)
    }

    async fn release_lock(&self, key: &str, lock_id: &str) -> Result<()> {
        let path = self.lock_path(key)?;

        if let Some(existing) = Self::read_lock_file(&path).await? {
            if existing.lock_id == lock_id {
                Self::remove_file_if_exists(&path).await?;
                info!("Released lock on {key}: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch on {key}: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }

        Ok(())
    }

    async fn get_lock_info(&self, key: &str) -> Result<Option<LockInfo>> {
        Self::read_lock_file(&self.lock_path(key)?).await
    }

    async fn force_unlock(&self, key: &str) -> Result<()> {
        let path = self.lock_path(key)?;
        Self::remove_file_if_exists(&path).await?;
        info!("Force-released lock on {key}");
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.starts_with('.') || key.contains(['/', '\\']) {
        return Err(StateError::local(format!("Invalid bundle key: '{key}'")).into());
    }
    Ok(())
}

/// Converts a bundle path into a filesystem path under `root`.
fn resolve_relative(root: &Path, relative: &str) -> Result<PathBuf> {
    let candidate = Path::new(relative);
    let safe = candidate
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if relative.is_empty() || !safe {
        return Err(StateError::corrupted(format!("Unsafe bundle path: '{relative}'")).into());
    }
    Ok(root.join(candidate))
}

/// Reads every file under `root` into a bundle.
///
/// Paths for which `exclude` returns true are skipped; a skipped directory
/// is not descended into.
///
/// # Errors
///
/// Returns an error if the tree cannot be read.
pub async fn read_tree(root: &Path, exclude: impl Fn(&str) -> bool) -> Result<WorkspaceBundle> {
    let mut bundle = WorkspaceBundle::new();
    let mut pending = vec![(root.to_path_buf(), String::new())];

    while let Some((dir, prefix)) = pending.pop() {
        let mut entries = fs::read_dir(&dir).await.map_err(|e| {
            StateError::local(format!("Failed to read directory {}: {e}", dir.display()))
        })?;

        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            StateError::local(format!("Failed to read directory {}: {e}", dir.display()))
        })? {
            let name = entry.file_name().to_string_lossy().to_string();
            let relative = if prefix.is_empty() {
                name
            } else {
                format!("{prefix}/{name}")
            };
            if exclude(&relative) {
                continue;
            }

            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push((entry.path(), relative));
            } else if file_type.is_file() {
                let contents = fs::read(entry.path()).await?;
                bundle.insert(relative, contents);
            }
        }
    }

    Ok(bundle)
}

/// Writes every file of a bundle under `root`, creating directories.
///
/// # Errors
///
/// Returns an error if a path is unsafe or a file cannot be written.
pub async fn write_tree(root: &Path, bundle: &WorkspaceBundle) -> Result<()> {
    fs::create_dir_all(root).await?;

    for (relative, contents) in bundle.files() {
        let path = resolve_relative(root, relative)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, contents).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_bundle() -> WorkspaceBundle {
        let mut bundle = WorkspaceBundle::new();
        bundle.insert("main.tf.json", br#"{"resource": {}}"#.to_vec());
        bundle.insert("terraform.tfstate", b"{}".to_vec());
        bundle.insert("modules/app/main.tf.json", b"{}".to_vec());
        bundle
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalBundleStore::with_base_dir(temp_dir.path());

        assert!(store.load("s1-rg").await.expect("load").is_none());
        assert!(!store.exists("s1-rg").await.expect("exists"));

        let bundle = sample_bundle();
        store.save("s1-rg", &bundle).await.expect("save");

        assert!(store.exists("s1-rg").await.expect("exists"));
        let loaded = store.load("s1-rg").await.expect("load").expect("bundle");
        assert_eq!(loaded, bundle);
    }

    #[tokio::test]
    async fn test_save_replaces_stale_files() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalBundleStore::with_base_dir(temp_dir.path());

        store.save("s1-rg", &sample_bundle()).await.expect("save");

        let mut smaller = WorkspaceBundle::new();
        smaller.insert("main.tf.json", b"{}".to_vec());
        store.save("s1-rg", &smaller).await.expect("save");

        let loaded = store.load("s1-rg").await.expect("load").expect("bundle");
        assert_eq!(loaded.len(), 1);
    }

    #[tokio::test]
    async fn test_delete() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalBundleStore::with_base_dir(temp_dir.path());

        store.save("s1-rg", &sample_bundle()).await.expect("save");
        store.delete("s1-rg").await.expect("delete");
        assert!(store.load("s1-rg").await.expect("load").is_none());
    }

    #[tokio::test]
    async fn test_locking() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalBundleStore::with_base_dir(temp_dir.path());

        let lock = store.acquire_lock("s1-rg", "runner-a").await.expect("acquire");
        assert_eq!(
            store.get_lock_info("s1-rg").await.expect("info").map(|l| l.holder),
            Some(String::from("runner-a"))
        );

        let second = store.acquire_lock("s1-rg", "runner-b").await;
        assert!(matches!(
            second,
            Err(DeployBoxError::State(StateError::LockedByOther { .. }))
        ));

        // A different stack is unaffected
        store.acquire_lock("s2-rg", "runner-b").await.expect("other stack");

        store.release_lock("s1-rg", "not-the-owner").await.expect("release");
        assert!(store.get_lock_info("s1-rg").await.expect("info").is_some());

        store.release_lock("s1-rg", &lock.lock_id).await.expect("release");
        assert!(store.get_lock_info("s1-rg").await.expect("info").is_none());
    }

    #[tokio::test]
    async fn test_expired_lock_takeover() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalBundleStore::with_base_dir(temp_dir.path());

        let mut stale = LockInfo::new("s1-rg", "crashed-runner");
        stale.expires_at = chrono::Utc::now() - chrono::Duration::seconds(5);
        let path = store.lock_path("s1-rg").expect("path");
        store.ensure_dir().await.expect("dir");
        assert!(LocalBundleStore::create_lock_file(&path, &stale).await.expect("write"));

        let lock = store.acquire_lock("s1-rg", "runner-a").await.expect("takeover");
        assert_eq!(lock.holder, "runner-a");

        store.force_unlock("s1-rg").await.expect("force unlock");
        assert!(store.get_lock_info("s1-rg").await.expect("info").is_none());
    }

    #[tokio::test]
    async fn test_invalid_keys_rejected() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalBundleStore::with_base_dir(temp_dir.path());

        assert!(store.load("../escape").await.is_err());
        assert!(store.load("").await.is_err());
        assert!(store.acquire_lock(".hidden", "x").await.is_err());
    }

    #[tokio::test]
    async fn test_read_tree_excludes() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        write_tree(temp_dir.path(), &sample_bundle()).await.expect("write");
        fs::create_dir_all(temp_dir.path().join(".terraform/providers"))
            .await
            .expect("mkdir");
        fs::write(temp_dir.path().join(".terraform/providers/bin"), b"x")
            .await
            .expect("write");

        let bundle = read_tree(temp_dir.path(), |p| p == ".terraform" || p == "terraform.tfstate")
            .await
            .expect("read");

        assert_eq!(bundle.len(), 2);
        assert!(bundle.get("modules/app/main.tf.json").is_some());
    }
}
