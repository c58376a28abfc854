//! Directory of JSON records, one file per identifier.
//!
//! Backs the file-based stack and resource repositories. Writes go to a
//! temporary file first and are renamed into place.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::error::{Result, StateError};

/// Record file extension.
const RECORD_EXT: &str = "json";

/// A directory of `<id>.json` records.
#[derive(Debug, Clone)]
pub struct JsonRecordDir {
    dir: PathBuf,
}

impl JsonRecordDir {
    /// Creates a record directory handle; the directory is created lazily.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the records.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.starts_with('.') || id.contains(['/', '\\']) {
            return Err(StateError::local(format!("Invalid record id: '{id}'")).into());
        }
        Ok(self.dir.join(format!("{id}.{RECORD_EXT}")))
    }

    /// Reads one record.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn read<T: DeserializeOwned>(&self, id: &str) -> Result<Option<T>> {
        let path = self.record_path(id)?;
        let content = match fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let record = serde_json::from_slice(&content).map_err(|e| {
            StateError::corrupted(format!("Failed to parse record {}: {e}", path.display()))
        })?;
        Ok(Some(record))
    }

    /// Writes one record atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be serialized or written.
    pub async fn write<T: Serialize + Sync>(&self, id: &str, record: &T) -> Result<()> {
        let path = self.record_path(id)?;
        fs::create_dir_all(&self.dir).await?;

        let content = serde_json::to_vec_pretty(record)
            .map_err(|e| StateError::serialization(format!("Failed to serialize record: {e}")))?;

        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, &content).await?;
        fs::rename(&temp_path, &path).await?;

        debug!("Wrote record {}", path.display());
        Ok(())
    }

    /// Reads every record in the directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or a record cannot be read.
    pub async fn list<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            let content = fs::read(&path).await?;
            let record = serde_json::from_slice(&content).map_err(|e| {
                StateError::corrupted(format!("Failed to parse record {}: {e}", path.display()))
            })?;
            records.push(record);
        }

        Ok(records)
    }
}
