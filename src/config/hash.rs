//! Document fingerprints.
//!
//! Run reports carry the hash of the document handed to the executor so two
//! runs can be compared without diffing the JSON.

use sha2::{Digest, Sha256};

use crate::document::Document;
use crate::error::{Result, StateError};

/// Hasher for computing document fingerprints.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the SHA-256 of a document's canonical JSON.
    ///
    /// Object keys serialize in sorted order, so equal documents always hash
    /// equally regardless of how they were built.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be serialized.
    pub fn hash_document(&self, document: &Document) -> Result<String> {
        let bytes = serde_json::to_vec(document).map_err(|e| {
            StateError::serialization(format!("Failed to serialize document: {e}"))
        })?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Returns the first eight characters of a hash for display.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }
}
