//! Source change detection.
//!
//! Build tasks are skipped when the source directory they build from has
//! not moved since the last successful run. The last seen commit lives in
//! the stack's provisioning state.

mod detector;
mod location;
mod source;

pub use detector::{ChangeDetector, ChangeLookupPolicy};
pub use location::{SourceLocation, DEFAULT_BRANCH, ROOT_SUBDIRECTORY};
#[cfg(test)]
pub use source::MockSourceControl;
pub use source::{GitHubClient, SourceControl, GITHUB_API_URL};
