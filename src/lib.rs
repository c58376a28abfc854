// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(warnings)]                    // All warnings are treated as errors
#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # DeployBox
//!
//! A declarative build-and-provision engine for multi-tenant application stacks.
//!
//! ## Overview
//!
//! Each stack is described by a declarative document in Terraform JSON
//! syntax. A provisioning run:
//!
//! - Composes provider-specific defaults from independent planners into one document
//! - Builds container images for embedded build tasks, skipping unchanged sources
//! - Drives a Terraform-compatible executor through `init`, `plan` and `apply`
//! - Persists the workspace (document, provisioning state, executor state) remotely
//!
//! ## Architecture
//!
//! 1. **Desired document**: stored on the stack record, optionally with flattened attributes
//! 2. **Planned document**: produced by [`providers::plan_document`] in a fixed planner order
//! 3. **Applied document**: build tasks resolved, written to a scratch workspace and applied
//!
//! Runs on the same stack are serialized by a lease in the bundle store.
//!
//! ## Modules
//!
//! - [`config`]: Configuration parsing and validation
//! - [`document`]: Declarative document model and merge rules
//! - [`registry`]: Resource kinds, schemas and descriptors
//! - [`providers`]: Azure and MongoDB Atlas planners
//! - [`build`]: Container image builds for build-task placeholders
//! - [`change`]: Source revision change detection
//! - [`state`]: Bundle storage backends (local, S3) and leases
//! - [`orchestrator`]: Deploy, destroy and render runs
//! - [`billing`]: Month-to-date cost per stack
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! azure:
//!   subscription_id: 00000000-0000-0000-0000-000000000000
//!   tenant_id: 00000000-0000-0000-0000-000000000000
//!   client_id: 00000000-0000-0000-0000-000000000000
//!   location: eastus
//!   registry:
//!     name: deployboxcrdev
//!     resource_group: deploy-box-rg-dev
//!
//! state:
//!   backend: s3
//!   bucket: deploybox-bundles
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod azure;
pub mod billing;
pub mod build;
pub mod change;
pub mod cli;
pub mod clock;
pub mod config;
pub mod document;
pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod providers;
pub mod registry;
pub mod stack;
pub mod state;
pub mod workspace;

// ============================================================================
// Re-exports
// ============================================================================

pub use billing::{BillingAggregator, StackCost};
pub use build::{BuildResolver, BuildService, RegistryBuildService};
pub use change::{ChangeDetector, ChangeLookupPolicy, GitHubClient, SourceControl};
pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, EngineConfig};
pub use document::Document;
pub use error::{DeployBoxError, ErrorKind, Result};
pub use executor::{InfraExecutor, TerraformExecutor};
pub use orchestrator::{DeployDriver, RunPhase, RunReport};
pub use providers::{AzurePlanner, MongoAtlasPlanner, ProviderPlanner};
pub use registry::{ResourceKind, ResourceRegistry};
pub use stack::{Stack, StackRepository, StackStatus};
pub use state::{BundleStore, LocalBundleStore, S3BundleStore};
