//! Durable state for the DeployBox engine.
//!
//! This module provides storage for each stack's workspace bundle (document,
//! provisioning state and executor state), per-stack run leases, and the
//! JSON record directories backing the file-based repositories.

mod local;
mod lock;
mod records;
mod s3;
mod store;
mod types;

pub use local::{read_tree, write_tree, LocalBundleStore};
pub use lock::{generate_holder_id, LockInfo, LOCK_EXPIRY_SECS};
pub use records::JsonRecordDir;
pub use s3::S3BundleStore;
pub use store::BundleStore;
pub use types::{
    bundle_key, ProvisioningState, WorkspaceBundle, DOCUMENT_FILE, EXECUTION_STATE_FILE,
    PLAN_FILE, PROVISIONING_STATE_FILE, TOOL_CACHE_DIR,
};
