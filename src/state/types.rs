//! Persisted state types: workspace bundles and provisioning state.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::error::{Result, StateError};

/// Generated document file inside a workspace.
pub const DOCUMENT_FILE: &str = "main.tf.json";

/// Provisioning-state file inside a workspace.
pub const PROVISIONING_STATE_FILE: &str = "deploybox.state.json";

/// Executor's own execution-state artifact.
pub const EXECUTION_STATE_FILE: &str = "terraform.tfstate";

/// Saved executor plan; transient and never persisted.
pub const PLAN_FILE: &str = "tfplan";

/// Executor plugin cache directory; transient and never persisted.
pub const TOOL_CACHE_DIR: &str = ".terraform";

/// Durable-store key of a stack's workspace bundle.
#[must_use]
pub fn bundle_key(stack_id: &str) -> String {
    format!("{stack_id}-rg")
}

/// A stack's workspace as a set of files keyed by relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkspaceBundle {
    files: BTreeMap<String, Vec<u8>>,
}

impl WorkspaceBundle {
    /// Creates an empty bundle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a file. Paths use `/` separators.
    pub fn insert(&mut self, path: impl Into<String>, contents: impl Into<Vec<u8>>) {
        self.files.insert(path.into(), contents.into());
    }

    /// Returns a file's contents.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }

    /// Removes a file, returning its contents.
    pub fn remove(&mut self, path: &str) -> Option<Vec<u8>> {
        self.files.remove(path)
    }

    /// Iterates over `(path, contents)` pairs in path order.
    pub fn files(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.files.iter().map(|(p, c)| (p.as_str(), c.as_slice()))
    }

    /// Number of files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Returns true if the bundle holds no files.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// SHA-256 digest of one file, if present.
    #[must_use]
    pub fn digest(&self, path: &str) -> Option<String> {
        self.get(path).map(|contents| hex::encode(Sha256::digest(contents)))
    }

    /// Parses the provisioning-state file, or returns empty state.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but is not valid state.
    pub fn provisioning_state(&self) -> Result<ProvisioningState> {
        self.get(PROVISIONING_STATE_FILE)
            .map_or_else(|| Ok(ProvisioningState::default()), ProvisioningState::from_slice)
    }
}

/// Per-stack key/value memory, namespaced by provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProvisioningState {
    namespaces: BTreeMap<String, BTreeMap<String, String>>,
}

impl ProvisioningState {
    /// Creates empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses state from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a namespace map.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            StateError::corrupted(format!("Failed to parse provisioning state: {e}")).into()
        })
    }

    /// Serializes state as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| {
            StateError::serialization(format!("Failed to serialize provisioning state: {e}"))
                .into()
        })
    }

    /// Reads a value.
    #[must_use]
    pub fn get(&self, namespace: &str, key: &str) -> Option<&str> {
        self.namespaces
            .get(namespace)
            .and_then(|values| values.get(key))
            .map(String::as_str)
    }

    /// Writes a value, returning the previous one.
    pub fn set(
        &mut self,
        namespace: &str,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Option<String> {
        self.namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(key.into(), value.into())
    }

    /// Keeps only the values of `namespace` for which `keep` returns true,
    /// returning how many were removed.
    pub fn retain(&mut self, namespace: &str, mut keep: impl FnMut(&str, &str) -> bool) -> usize {
        let Some(values) = self.namespaces.get_mut(namespace) else {
            return 0;
        };
        let before = values.len();
        values.retain(|key, value| keep(key, value));
        before - values.len()
    }

    /// Returns all values of a namespace.
    #[must_use]
    pub fn namespace(&self, namespace: &str) -> Option<&BTreeMap<String, String>> {
        self.namespaces.get(namespace)
    }

    /// Iterates over namespaces.
    pub fn namespaces(&self) -> impl Iterator<Item = (&str, &BTreeMap<String, String>)> {
        self.namespaces.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Total number of stored values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.namespaces.values().map(BTreeMap::len).sum()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
