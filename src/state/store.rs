//! Bundle store trait definition.
//!
//! This module defines the common interface for durable workspace storage.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use super::lock::LockInfo;
use super::types::WorkspaceBundle;

/// Trait for durable workspace bundle backends.
#[async_trait]
pub trait BundleStore: Send + Sync {
    /// Loads the bundle stored under `key`.
    ///
    /// Returns `None` if nothing was stored yet.
    async fn load(&self, key: &str) -> Result<Option<WorkspaceBundle>>;

    /// Replaces the bundle stored under `key`.
    ///
    /// Files absent from `bundle` are removed from the store.
    async fn save(&self, key: &str, bundle: &WorkspaceBundle) -> Result<()>;

    /// Deletes the bundle stored under `key`.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Checks if a bundle exists under `key`.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Acquires the lease on `key`.
    ///
    /// Fails with `LockedByOther` while another unexpired lease exists.
    async fn acquire_lock(&self, key: &str, holder: &str) -> Result<LockInfo>;

    /// Releases the lease on `key` if `lock_id` still owns it.
    async fn release_lock(&self, key: &str, lock_id: &str) -> Result<()>;

    /// Gets the current lease on `key`, if any.
    async fn get_lock_info(&self, key: &str) -> Result<Option<LockInfo>>;

    /// Removes any lease on `key` regardless of owner.
    async fn force_unlock(&self, key: &str) -> Result<()>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl<T: BundleStore + ?Sized> BundleStore for Arc<T> {
    async fn load(&self, key: &str) -> Result<Option<WorkspaceBundle>> {
        (**self).load(key).await
    }

    async fn save(&self, key: &str, bundle: &WorkspaceBundle) -> Result<()> {
        (**self).save(key, bundle).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        (**self).exists(key).await
    }

    async fn acquire_lock(&self, key: &str, holder: &str) -> Result<LockInfo> {
        (**self).acquire_lock(key, holder).await
    }

    async fn release_lock(&self, key: &str, lock_id: &str) -> Result<()> {
        (**self).release_lock(key, lock_id).await
    }

    async fn get_lock_info(&self, key: &str) -> Result<Option<LockInfo>> {
        (**self).get_lock_info(key).await
    }

    async fn force_unlock(&self, key: &str) -> Result<()> {
        (**self).force_unlock(key).await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}
