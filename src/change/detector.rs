//! Revision comparison against provisioning state.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::state::ProvisioningState;

use super::location::SourceLocation;
use super::source::SourceControl;

/// What to do when the revision lookup itself fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeLookupPolicy {
    /// Treat the source as unchanged and keep going.
    #[default]
    FailOpen,
    /// Abort with the lookup error.
    FailClosed,
}

/// Decides whether a source location moved since the last run.
#[derive(Clone)]
pub struct ChangeDetector {
    source: Arc<dyn SourceControl>,
    policy: ChangeLookupPolicy,
}

impl std::fmt::Debug for ChangeDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeDetector")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl ChangeDetector {
    /// Creates a detector with the given lookup-failure policy.
    #[must_use]
    pub fn new(source: Arc<dyn SourceControl>, policy: ChangeLookupPolicy) -> Self {
        Self { source, policy }
    }

    /// The configured lookup-failure policy.
    #[must_use]
    pub const fn policy(&self) -> ChangeLookupPolicy {
        self.policy
    }

    /// Compares the newest commit at `location` with the one recorded in
    /// `state` under `namespace`.
    ///
    /// Records the new commit and returns `true` when it differs or none
    /// was recorded. Returns `false` without touching `state` when it is
    /// unchanged or no commit touches the location.
    ///
    /// # Errors
    ///
    /// Returns the lookup error under [`ChangeLookupPolicy::FailClosed`].
    pub async fn has_changes(
        &self,
        stack_id: &str,
        state: &mut ProvisioningState,
        namespace: &str,
        location: &SourceLocation,
    ) -> Result<bool> {
        let latest = match self.source.latest_commit(location).await {
            Ok(latest) => latest,
            Err(e) => match self.policy {
                ChangeLookupPolicy::FailOpen => {
                    warn!("Stack {stack_id}: revision lookup for {location} failed, assuming unchanged: {e}");
                    return Ok(false);
                }
                ChangeLookupPolicy::FailClosed => return Err(e),
            },
        };

        let Some(latest) = latest else {
            debug!("Stack {stack_id}: no commits under {location}");
            return Ok(false);
        };

        let key = location.revision_key();
        if state.get(namespace, &key) == Some(latest.as_str()) {
            debug!("Stack {stack_id}: {location} unchanged at {latest}");
            return Ok(false);
        }

        info!("Stack {stack_id}: {location} changed to {latest}");
        state.set(namespace, key, latest);
        Ok(true)
    }
}
