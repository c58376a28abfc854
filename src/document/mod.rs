//! Declarative document model.
//!
//! This module provides:
//! - The [`Document`] type written as `main.tf.json`
//! - No-overwrite merging of provider fragments
//! - Detection of unresolved build-task placeholders
//! - Expansion of flattened attribute paths into documents

mod attributes;
mod model;

pub use attributes::{expand_attributes, MAX_ARRAY_INDEX};
pub use model::{
    is_build_task, BuildTaskSlot, Document, ResourceSet, BUILD_TASK_KEY, IMAGE_KEY,
    REDACTED, REQUIRED_PROVIDERS_KEY,
};
