//! Source-control hosting API.

use async_trait::async_trait;
use reqwest::{header, Client};
use serde::Deserialize;
use std::time::Duration;
use tracing::trace;

use crate::error::{Result, UpstreamError};

use super::location::SourceLocation;

/// Public GitHub REST endpoint.
pub const GITHUB_API_URL: &str = "https://api.github.com";

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

const SERVICE: &str = "GitHub";

const USER_AGENT: &str = concat!("deploybox/", env!("CARGO_PKG_VERSION"));

/// Looks up repository revisions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Returns the newest commit touching the location's subdirectory on
    /// its branch, or `None` if no commit touches it.
    async fn latest_commit(&self, location: &SourceLocation) -> Result<Option<String>>;
}

#[derive(Debug, Deserialize)]
struct CommitSummary {
    sha: String,
}

/// GitHub REST client.
#[derive(Debug, Clone)]
pub struct GitHubClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl GitHubClient {
    /// Creates a client, optionally authenticated with a personal token.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(token: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| UpstreamError::network(SERVICE, format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: GITHUB_API_URL.to_string(),
            token: token.filter(|t| !t.is_empty()),
        })
    }

    /// Overrides the API base URL.
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl SourceControl for GitHubClient {
    async fn latest_commit(&self, location: &SourceLocation) -> Result<Option<String>> {
        let url = format!(
            "{}/repos/{}/{}/commits",
            self.base_url, location.owner, location.repo
        );

        let mut query = vec![("sha", location.branch.as_str()), ("per_page", "1")];
        if !location.is_root() {
            query.push(("path", location.subdirectory.as_str()));
        }
        trace!("GET {url} {query:?}");

        let mut request = self
            .http
            .get(&url)
            .query(&query)
            .header(header::ACCEPT, "application/vnd.github+json");
        if let Some(token) = &self.token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| UpstreamError::network(SERVICE, format!("Request failed: {e}")))?;

        let status = response.status();

        if status.as_u16() == 401 {
            return Err(UpstreamError::AuthenticationFailed {
                service: SERVICE.to_string(),
                message: String::from("Invalid token"),
            }
            .into());
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::api_error(SERVICE, status.as_u16(), body).into());
        }

        let commits: Vec<CommitSummary> = response.json().await.map_err(|e| {
            UpstreamError::invalid_response(SERVICE, format!("Failed to parse commits: {e}"))
        })?;

        Ok(commits.into_iter().next().map(|c| c.sha))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header as header_eq, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn location() -> SourceLocation {
        SourceLocation::parse("https://github.com/acme/shop.git#main:api").expect("location")
    }

    #[tokio::test]
    async fn test_latest_commit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/shop/commits"))
            .and(query_param("path", "api"))
            .and(query_param("sha", "main"))
            .and(header_eq("authorization", "Bearer ghp"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([{"sha": "abc123"}, {"sha": "older"}])),
            )
            .mount(&server)
            .await;

        let client = GitHubClient::new(Some(String::from("ghp")))
            .expect("client")
            .with_base_url(server.uri());

        let sha = client.latest_commit(&location()).await.expect("lookup");
        assert_eq!(sha.as_deref(), Some("abc123"));
    }

    #[tokio::test]
    async fn test_no_commits() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let client = GitHubClient::new(None)
            .expect("client")
            .with_base_url(server.uri());
        assert_eq!(client.latest_commit(&location()).await.expect("lookup"), None);
    }

    #[tokio::test]
    async fn test_not_found_is_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("Not Found"))
            .mount(&server)
            .await;

        let client = GitHubClient::new(None)
            .expect("client")
            .with_base_url(server.uri());
        let err = client.latest_commit(&location()).await.expect_err("404");
        assert!(err.to_string().contains("404"));
    }
}
