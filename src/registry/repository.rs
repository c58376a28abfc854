//! Persistence of resource descriptors.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::Result;
use crate::state::JsonRecordDir;

use super::kind::ResourceKind;

/// A persisted record of one concrete cloud resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// Prefixed identifier.
    pub id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Owning stack.
    pub stack_id: String,
    /// Validated attributes, including defaults.
    pub attributes: Map<String, Value>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

/// Storage for resource descriptors.
#[async_trait]
pub trait ResourceRepository: Send + Sync {
    /// Inserts or replaces a descriptor.
    async fn save(&self, descriptor: &ResourceDescriptor) -> Result<()>;

    /// Loads a descriptor by identifier.
    async fn get(&self, id: &str) -> Result<Option<ResourceDescriptor>>;

    /// Lists every descriptor owned by a stack.
    async fn list_for_stack(&self, stack_id: &str) -> Result<Vec<ResourceDescriptor>>;
}

/// Descriptor repository held in memory.
#[derive(Debug, Default)]
pub struct InMemoryResourceRepository {
    records: RwLock<HashMap<String, ResourceDescriptor>>,
}

impl InMemoryResourceRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResourceRepository for InMemoryResourceRepository {
    async fn save(&self, descriptor: &ResourceDescriptor) -> Result<()> {
        self.records
            .write()
            .await
            .insert(descriptor.id.clone(), descriptor.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<ResourceDescriptor>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn list_for_stack(&self, stack_id: &str) -> Result<Vec<ResourceDescriptor>> {
        let mut found: Vec<_> = self
            .records
            .read()
            .await
            .values()
            .filter(|d| d.stack_id == stack_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }
}

/// Descriptor repository storing one JSON file per resource.
#[derive(Debug)]
pub struct FileResourceRepository {
    records: JsonRecordDir,
}

impl FileResourceRepository {
    /// Creates a repository rooted at the given directory.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            records: JsonRecordDir::new(dir),
        }
    }
}

#[async_trait]
impl ResourceRepository for FileResourceRepository {
    async fn save(&self, descriptor: &ResourceDescriptor) -> Result<()> {
        debug!("Persisting resource {}", descriptor.id);
        self.records.write(&descriptor.id, descriptor).await
    }

    async fn get(&self, id: &str) -> Result<Option<ResourceDescriptor>> {
        self.records.read(id).await
    }

    async fn list_for_stack(&self, stack_id: &str) -> Result<Vec<ResourceDescriptor>> {
        let mut found: Vec<ResourceDescriptor> = self
            .records
            .list()
            .await?
            .into_iter()
            .filter(|d: &ResourceDescriptor| d.stack_id == stack_id)
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }
}
