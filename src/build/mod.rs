//! Container image builds for build-task placeholders.
//!
//! A container's `image` may be `{"task": {...}}` instead of a reference.
//! [`BuildResolver`] turns each such placeholder into a
//! `registry/repository:latest` string before the document is applied,
//! using a [`BuildService`] to run the builds.

mod resolver;
mod service;

pub use resolver::{BuildResolver, ResolveReport, ResolvedImage};
pub use service::{
    BuildRequest, BuildRun, BuildService, RegistryBuildService, RegistryTarget, RunStatus,
    DEFAULT_DOCKERFILE, RUNS_API_VERSION, TASKS_API_VERSION,
};
