//! Registry dispatching resource operations by kind and identifier prefix.

use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ConfigError, RegistryError, Result};

use super::kind::{ResourceKind, PREFIX_LEN};
use super::repository::{ResourceDescriptor, ResourceRepository};
use super::schema;

/// Builder collecting kind registrations.
///
/// Collisions are reported by [`register_with_prefix`](Self::register_with_prefix),
/// so a registry that was built is always injective.
#[derive(Debug, Default)]
pub struct ResourceRegistryBuilder {
    prefixes: BTreeMap<String, ResourceKind>,
    kinds: BTreeMap<ResourceKind, String>,
}

/// Registry of resource kinds backed by a descriptor repository.
pub struct ResourceRegistry {
    prefixes: BTreeMap<String, ResourceKind>,
    kinds: BTreeMap<ResourceKind, String>,
    repository: Arc<dyn ResourceRepository>,
}

impl ResourceRegistryBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a kind under its default prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if the kind or its prefix is already registered.
    pub fn register(self, kind: ResourceKind) -> Result<Self> {
        self.register_with_prefix(kind, kind.default_prefix())
    }

    /// Registers a kind under an explicit prefix.
    ///
    /// # Errors
    ///
    /// Returns a validation error for malformed prefixes, and
    /// [`RegistryError::DuplicatePrefix`] or [`RegistryError::DuplicateKind`]
    /// on collisions.
    pub fn register_with_prefix(mut self, kind: ResourceKind, prefix: &str) -> Result<Self> {
        if prefix.len() != PREFIX_LEN || !prefix.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ConfigError::validation(
                format!("Prefix '{prefix}' must be {PREFIX_LEN} ASCII alphanumeric characters"),
                kind.as_str(),
            )
            .into());
        }

        if let Some(existing) = self.prefixes.get(prefix) {
            return Err(RegistryError::DuplicatePrefix {
                prefix: prefix.to_string(),
                existing: existing.to_string(),
                kind: kind.to_string(),
            }
            .into());
        }

        if self.kinds.contains_key(&kind) {
            return Err(RegistryError::DuplicateKind {
                kind: kind.to_string(),
            }
            .into());
        }

        debug!("Registering resource kind {kind} under prefix {prefix}");
        self.prefixes.insert(prefix.to_string(), kind);
        self.kinds.insert(kind, prefix.to_string());
        Ok(self)
    }

    /// Finishes the registry.
    #[must_use]
    pub fn build(self, repository: Arc<dyn ResourceRepository>) -> ResourceRegistry {
        ResourceRegistry {
            prefixes: self.prefixes,
            kinds: self.kinds,
            repository,
        }
    }
}

impl ResourceRegistry {
    /// Creates a registry with every kind under its default prefix.
    #[must_use]
    pub fn standard(repository: Arc<dyn ResourceRepository>) -> Self {
        let prefixes = ResourceKind::ALL
            .iter()
            .map(|kind| (kind.default_prefix().to_string(), *kind))
            .collect();
        let kinds = ResourceKind::ALL
            .iter()
            .map(|kind| (*kind, kind.default_prefix().to_string()))
            .collect();

        Self {
            prefixes,
            kinds,
            repository,
        }
    }

    /// Registered kinds with their prefixes.
    #[must_use]
    pub fn kinds(&self) -> Vec<(ResourceKind, &str)> {
        self.kinds
            .iter()
            .map(|(kind, prefix)| (*kind, prefix.as_str()))
            .collect()
    }

    /// Resolves the kind owning an identifier's prefix.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownPrefix`] if no kind owns the prefix.
    pub fn kind_for_id(&self, id: &str) -> Result<ResourceKind> {
        id.get(..PREFIX_LEN)
            .and_then(|prefix| self.prefixes.get(prefix))
            .copied()
            .ok_or_else(|| {
                RegistryError::UnknownPrefix {
                    id: id.to_string(),
                }
                .into()
            })
    }

    /// Validates, completes and persists a new resource.
    ///
    /// # Errors
    ///
    /// Returns an error if the kind is not registered, the data does not
    /// match the kind's schema, or persisting fails.
    pub async fn create(
        &self,
        kind: ResourceKind,
        stack_id: &str,
        data: Value,
    ) -> Result<ResourceDescriptor> {
        let prefix = self
            .kinds
            .get(&kind)
            .ok_or_else(|| RegistryError::KindNotRegistered {
                kind: kind.to_string(),
            })?;

        if stack_id.is_empty() {
            return Err(ConfigError::validation("Stack id cannot be empty", "stack_id").into());
        }

        let attributes = schema::normalize(kind, stack_id, data)?;
        let now = Utc::now();
        let suffix = Uuid::new_v4().simple().to_string();
        let descriptor = ResourceDescriptor {
            id: format!("{prefix}{}", &suffix[..16]),
            kind,
            stack_id: stack_id.to_string(),
            attributes,
            created_at: now,
            updated_at: now,
        };

        self.repository.save(&descriptor).await?;
        info!("Created {kind} {} for stack {stack_id}", descriptor.id);

        Ok(descriptor)
    }

    /// Loads a resource by identifier, dispatching on its prefix.
    ///
    /// # Errors
    ///
    /// Returns a not-found error for unknown prefixes or missing records.
    pub async fn read(&self, id: &str) -> Result<ResourceDescriptor> {
        let kind = self.kind_for_id(id)?;

        match self.repository.get(id).await? {
            Some(descriptor) if descriptor.kind == kind => Ok(descriptor),
            _ => Err(RegistryError::NotFound { id: id.to_string() }.into()),
        }
    }

    /// Lists every resource owned by a stack.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository cannot be read.
    pub async fn list_for_stack(&self, stack_id: &str) -> Result<Vec<ResourceDescriptor>> {
        self.repository.list_for_stack(stack_id).await
    }

    /// Flattens a descriptor into a single attributes mapping.
    #[must_use]
    pub fn serialize(&self, descriptor: &ResourceDescriptor) -> Map<String, Value> {
        let mut map = descriptor.attributes.clone();
        map.insert(String::from("id"), Value::String(descriptor.id.clone()));
        map.insert(String::from("kind"), Value::String(descriptor.kind.to_string()));
        map.insert(String::from("stack"), Value::String(descriptor.stack_id.clone()));
        map.insert(
            String::from("created_at"),
            Value::String(descriptor.created_at.to_rfc3339()),
        );
        map.insert(
            String::from("updated_at"),
            Value::String(descriptor.updated_at.to_rfc3339()),
        );
        map
    }
}

impl std::fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("prefixes", &self.prefixes)
            .finish_non_exhaustive()
    }
}
