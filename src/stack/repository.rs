//! Storage of stack records.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Result, StateError};
use crate::state::JsonRecordDir;

use super::types::{Stack, StackStatus};

/// Storage for stack metadata.
#[async_trait]
pub trait StackRepository: Send + Sync {
    /// Loads a stack by identifier.
    async fn get(&self, stack_id: &str) -> Result<Option<Stack>>;

    /// Inserts or replaces a stack.
    async fn save(&self, stack: &Stack) -> Result<()>;

    /// Lists every stack.
    async fn list(&self) -> Result<Vec<Stack>>;

    /// Loads a stack, failing if it does not exist.
    async fn require(&self, stack_id: &str) -> Result<Stack> {
        self.get(stack_id).await?.ok_or_else(|| {
            StateError::StackNotFound {
                stack_id: stack_id.to_string(),
            }
            .into()
        })
    }

    /// Changes only the status of a stack.
    async fn update_status(&self, stack_id: &str, status: StackStatus) -> Result<Stack> {
        let mut stack = self.require(stack_id).await?;
        stack.set_status(status);
        self.save(&stack).await?;
        debug!("Stack {stack_id} is now {status}");
        Ok(stack)
    }
}

/// Stack repository held in memory.
#[derive(Debug, Default)]
pub struct InMemoryStackRepository {
    stacks: RwLock<HashMap<String, Stack>>,
}

impl InMemoryStackRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a repository seeded with the given stacks.
    #[must_use]
    pub fn with_stacks(stacks: impl IntoIterator<Item = Stack>) -> Self {
        Self {
            stacks: RwLock::new(stacks.into_iter().map(|s| (s.id.clone(), s)).collect()),
        }
    }
}

#[async_trait]
impl StackRepository for InMemoryStackRepository {
    async fn get(&self, stack_id: &str) -> Result<Option<Stack>> {
        Ok(self.stacks.read().await.get(stack_id).cloned())
    }

    async fn save(&self, stack: &Stack) -> Result<()> {
        self.stacks
            .write()
            .await
            .insert(stack.id.clone(), stack.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Stack>> {
        let mut stacks: Vec<_> = self.stacks.read().await.values().cloned().collect();
        stacks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(stacks)
    }
}

/// Stack repository storing one JSON file per stack.
#[derive(Debug)]
pub struct FileStackRepository {
    records: JsonRecordDir,
}

impl FileStackRepository {
    /// Creates a repository rooted at the given directory.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            records: JsonRecordDir::new(dir),
        }
    }
}

#[async_trait]
impl StackRepository for FileStackRepository {
    async fn get(&self, stack_id: &str) -> Result<Option<Stack>> {
        self.records.read(stack_id).await
    }

    async fn save(&self, stack: &Stack) -> Result<()> {
        self.records.write(&stack.id, stack).await
    }

    async fn list(&self) -> Result<Vec<Stack>> {
        let mut stacks: Vec<Stack> = self.records.list().await?;
        stacks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(stacks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_repository_round_trip() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let repo = FileStackRepository::new(temp_dir.path());

        let stack = Stack::new("s1", "demo", "p1").with_organization("org1");
        repo.save(&stack).await.expect("save");

        assert_eq!(repo.get("s1").await.expect("get"), Some(stack));
        assert_eq!(repo.list().await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn test_update_status() {
        let repo = InMemoryStackRepository::with_stacks([Stack::new("s1", "demo", "p1")]);

        let updated = repo
            .update_status("s1", StackStatus::Running)
            .await
            .expect("update");
        assert_eq!(updated.status, StackStatus::Running);
        assert_eq!(
            repo.require("s1").await.expect("require").status,
            StackStatus::Running
        );
    }

    #[tokio::test]
    async fn test_missing_stack() {
        let repo = InMemoryStackRepository::new();
        let err = repo.require("ghost").await.expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
