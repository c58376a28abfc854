//! Stack metadata.
//!
//! A stack is a tenant's deployed instance of a template. The orchestrator
//! reads its desired document and writes back status and execution state.

mod repository;
mod types;

pub use repository::{FileStackRepository, InMemoryStackRepository, StackRepository};
pub use types::{Stack, StackStatus, TemplateRef};
