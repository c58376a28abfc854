//! Source repository locations.

use std::fmt;

use crate::error::{BuildError, Result};

/// Branch used when a location names none.
pub const DEFAULT_BRANCH: &str = "main";

/// Subdirectory used when a location names none.
pub const ROOT_SUBDIRECTORY: &str = ".";

/// A directory inside a branch of a hosted git repository.
///
/// Parsed from `https://host/owner/repo[.git][#branch[:subdir]]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    /// Hosting domain, e.g. `github.com`.
    pub host: String,
    /// Repository owner.
    pub owner: String,
    /// Repository name without `.git`.
    pub repo: String,
    /// Branch name.
    pub branch: String,
    /// Directory inside the repository; `.` for the root.
    pub subdirectory: String,
}

impl SourceLocation {
    /// Parses a context URL.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::InvalidSource`] if the URL is not an https
    /// repository URL with exactly an owner and a repository segment.
    pub fn parse(url: &str) -> Result<Self> {
        let invalid = |reason: &str| BuildError::InvalidSource {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let rest = url
            .strip_prefix("https://")
            .ok_or_else(|| invalid("expected an https:// URL"))?;

        let (address, fragment) = match rest.split_once('#') {
            Some((address, fragment)) => (address, Some(fragment)),
            None => (rest, None),
        };

        let (host, path) = address
            .split_once('/')
            .ok_or_else(|| invalid("missing repository path"))?;
        if host.is_empty() {
            return Err(invalid("missing host").into());
        }

        let path = path.trim_end_matches('/');
        let (owner, repo) = path
            .split_once('/')
            .ok_or_else(|| invalid("expected /owner/repo"))?;
        let repo = repo.strip_suffix(".git").unwrap_or(repo);
        if owner.is_empty() || repo.is_empty() || repo.contains('/') {
            return Err(invalid("expected /owner/repo").into());
        }

        let (branch, subdirectory) = match fragment {
            Some(fragment) => match fragment.split_once(':') {
                Some((branch, subdirectory)) => (branch, subdirectory),
                None => (fragment, ""),
            },
            None => ("", ""),
        };

        Ok(Self {
            host: host.to_string(),
            owner: owner.to_string(),
            repo: repo.to_string(),
            branch: non_empty_or(branch, DEFAULT_BRANCH),
            subdirectory: non_empty_or(subdirectory.trim_matches('/'), ROOT_SUBDIRECTORY),
        })
    }

    /// Replaces the subdirectory.
    #[must_use]
    pub fn with_subdirectory(mut self, subdirectory: &str) -> Self {
        self.subdirectory = non_empty_or(subdirectory.trim_matches('/'), ROOT_SUBDIRECTORY);
        self
    }

    /// Repository URL including the branch, used to key provisioning state.
    #[must_use]
    pub fn repo_url(&self) -> String {
        format!(
            "https://{}/{}/{}.git#{}",
            self.host, self.owner, self.repo, self.branch
        )
    }

    /// Build context in `repo#branch:subdir` form.
    #[must_use]
    pub fn build_context(&self) -> String {
        format!(
            "https://{}/{}/{}#{}:{}",
            self.host, self.owner, self.repo, self.branch, self.subdirectory
        )
    }

    /// True when the location names the repository root.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.subdirectory == ROOT_SUBDIRECTORY
    }

    /// State key holding the last seen commit.
    #[must_use]
    pub fn revision_key(&self) -> String {
        format!("{}/{}-sha", self.repo_url(), self.subdirectory)
    }

    /// State key holding the last resolved image.
    #[must_use]
    pub fn image_key(&self) -> String {
        format!("{}/{}-image", self.repo_url(), self.subdirectory)
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.build_context())
    }
}

fn non_empty_or(value: &str, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value.to_string()
    }
}
