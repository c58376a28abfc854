//! S3-based bundle storage backend.
//!
//! Each bundle is stored as one object per file under `<prefix><key>/`, and
//! the per-stack lease as `<prefix><key>.lock`, created with a conditional
//! `If-None-Match: *` write so two runs cannot both acquire it.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use std::collections::BTreeSet;
use tracing::{debug, info};

use crate::error::{DeployBoxError, Result, StateError};

use super::lock::{generate_holder_id, LockInfo, LOCK_EXPIRY_SECS};
use super::store::BundleStore;
use super::types::WorkspaceBundle;

/// Lock object suffix.
const LOCK_SUFFIX: &str = ".lock";

/// S3-based bundle store.
#[derive(Debug, Clone)]
pub struct S3BundleStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix, empty or ending in `/`.
    prefix: String,
}

/// Outcome of a conditional lock write.
enum LockWrite {
    Created,
    AlreadyExists,
}

fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| {
            let p = p.trim_matches('/');
            if p.is_empty() {
                String::new()
            } else {
                format!("{p}/")
            }
        })
        .unwrap_or_default()
}

impl S3BundleStore {
    /// Creates a new S3 bundle store from the ambient AWS configuration.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Self {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Self::with_client(Client::new(&config), bucket, prefix)
    }

    /// Creates a new S3 bundle store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
        }
    }

    fn bundle_prefix(&self, key: &str) -> String {
        format!("{}{key}/", self.prefix)
    }

    fn lock_key(&self, key: &str) -> String {
        format!("{}{key}{LOCK_SUFFIX}", self.prefix)
    }

    /// Lists every object key under a prefix.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| StateError::s3(format!("S3 list error: {e}")))?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|object| object.key().map(str::to_string)),
            );

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(keys)
    }

    /// Gets an object from S3.
    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let bytes = response.body.collect().await.map_err(|e| {
                    StateError::s3(format!("Failed to read S3 object: {e}"))
                })?;
                Ok(Some(bytes.into_bytes().to_vec()))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(StateError::s3(format!("S3 get error: {service_err}")).into())
                }
            }
        }
    }

    /// Puts an object to S3.
    async fn put_object(&self, key: &str, contents: &[u8]) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(contents.to_vec().into())
            .send()
            .await
            .map_err(|e| StateError::s3(format!("S3 put error: {e}")))?;

        Ok(())
    }

    /// Deletes an object from S3.
    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StateError::s3(format!("S3 delete error: {e}")))?;

        Ok(())
    }

    /// Writes the lock object only if no object exists at the key.
    async fn put_lock_if_absent(&self, key: &str, lock_info: &LockInfo) -> Result<LockWrite> {
        let content = serde_json::to_vec_pretty(lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        let result = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .if_none_match("*")
            .content_type("application/json")
            .body(content.into())
            .send()
            .await;

        match result {
            Ok(_) => Ok(LockWrite::Created),
            Err(sdk_err) => {
                // 412 when the object exists, 409 when a concurrent write won
                let status = sdk_err.raw_response().map(|r| r.status().as_u16());
                if matches!(status, Some(409 | 412)) {
                    Ok(LockWrite::AlreadyExists)
                } else {
                    Err(StateError::LockFailed {
                        message: format!("S3 conditional put error: {sdk_err}"),
                    }
                    .into())
                }
            }
        }
    }

    async fn read_lock(&self, key: &str) -> Result<Option<LockInfo>> {
        match self.get_object(&self.lock_key(key)).await? {
            Some(content) => {
                let lock_info = serde_json::from_slice(&content)
                    .map_err(|e| StateError::corrupted(format!("Failed to parse lock: {e}")))?;
                Ok(Some(lock_info))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl BundleStore for S3BundleStore {
    async fn load(&self, key: &str) -> Result<Option<WorkspaceBundle>> {
        let prefix = self.bundle_prefix(key);
        debug!("Loading bundle from s3://{}/{prefix}", self.bucket);

        let keys = self.list_keys(&prefix).await?;
        if keys.is_empty() {
            debug!("No bundle found in S3");
            return Ok(None);
        }

        let mut bundle = WorkspaceBundle::new();
        for object_key in keys {
            let Some(relative) = object_key.strip_prefix(&prefix) else {
                continue;
            };
            if let Some(contents) = self.get_object(&object_key).await? {
                bundle.insert(relative, contents);
            }
        }

        info!("Loaded bundle {key} ({} files)", bundle.len());
        Ok(Some(bundle))
    }

    async fn save(&self, key: &str, bundle: &WorkspaceBundle) -> Result<()> {
        let prefix = self.bundle_prefix(key);
        info!("Saving bundle ({} files) to s3://{}/{prefix}", bundle.len(), self.bucket);

        let existing: BTreeSet<String> = self.list_keys(&prefix).await?.into_iter().collect();
        let mut written = BTreeSet::new();

        for (relative, contents) in bundle.files() {
            let object_key = format!("{prefix}{relative}");
            self.put_object(&object_key, contents).await?;
            written.insert(object_key);
        }

        for stale in existing.difference(&written) {
            debug!("Removing stale object {stale}");
            self.delete_object(stale).await?;
        }

        debug!("Bundle saved successfully to S3");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let prefix = self.bundle_prefix(key);
        info!("Deleting bundle from s3://{}/{prefix}", self.bucket);

        for object_key in self.list_keys(&prefix).await? {
            self.delete_object(&object_key).await?;
        }

        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(!self.list_keys(&self.bundle_prefix(key)).await?.is_empty())
    }

    async fn acquire_lock(&self, key: &str, holder: &str) -> Result<LockInfo> {
        let lock_key = self.lock_key(key);

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        let lock_info = LockInfo::new(key, &holder_id);

        for _ in 0..2 {
            match self.put_lock_if_absent(&lock_key, &lock_info).await? {
                LockWrite::Created => {
                    info!(
                        "Acquired lock on {key}: {} (expires in {LOCK_EXPIRY_SECS}s)",
                        lock_info.lock_id
                    );
                    return Ok(lock_info);
                }
                LockWrite::AlreadyExists => match self.read_lock(key).await? {
                    Some(existing) if !existing.is_expired() => {
                        return Err(StateError::LockedByOther {
                            holder: existing.holder,
                            since: existing.acquired_at.to_rfc3339(),
                        }
                        .into());
                    }
                    Some(_) => {
                        debug!("Expired lock found for {key}, taking over");
                        self.delete_object(&lock_key).await?;
                    }
                    None => {}
                },
            }
        }

        Err(DeployBoxError::State(StateError::LockFailed {
            message: format!("Lost race acquiring lock for {key}"),
        }))
    }

    async fn release_lock(&self, key: &str, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock(key).await? {
            if existing.lock_id == lock_id {
                self.delete_object(&self.lock_key(key)).await?;
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
        self.read_lock(key).await
    }

    async fn force_unlock(&self, key: &str) -> Result<()> {
        self.delete_object(&self.lock_key(key)).await?;
        info!("Force-released lock on {key}");
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}
