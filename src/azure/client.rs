//! Azure Resource Manager HTTP client.

use reqwest::{header, Client, Method};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use crate::error::{Result, UpstreamError};

use super::auth::TokenProvider;

/// Management-plane base URL.
pub const ARM_BASE_URL: &str = "https://management.azure.com";

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Retry-after used when a 429 carries no usable header.
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

const SERVICE: &str = "Azure Resource Manager";

/// Authenticated JSON client for the management plane.
///
/// Each call makes a single attempt; throttling surfaces as
/// [`UpstreamError::RateLimited`] so callers own the retry schedule.
#[derive(Clone)]
pub struct ArmClient {
    http: Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl std::fmt::Debug for ArmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArmClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl ArmClient {
    /// Creates a client against the public management endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(tokens: Arc<dyn TokenProvider>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| UpstreamError::network(SERVICE, format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: ARM_BASE_URL.to_string(),
            tokens,
        })
    }

    /// Overrides the base URL.
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// The base URL requests are sent to.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Sends a GET request.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-success status.
    pub async fn get_json(&self, path: &str) -> Result<Value> {
        self.execute(Method::GET, path, None).await
    }

    /// Sends a PUT request with a JSON body.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-success status.
    pub async fn put_json(&self, path: &str, body: &Value) -> Result<Value> {
        self.execute(Method::PUT, path, Some(body)).await
    }

    /// Sends a POST request with a JSON body.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-success status.
    pub async fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        self.execute(Method::POST, path, Some(body)).await
    }

    async fn execute(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value> {
        let url = format!("{}{path}", self.base_url);
        trace!("{method} {url}");

        let token = self.tokens.token().await?;
        let mut request = self
            .http
            .request(method, &url)
            .header(header::AUTHORIZATION, format!("Bearer {token}"));
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| UpstreamError::network(SERVICE, format!("Request failed: {e}")))?;

        let status = response.status();

        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS);

            return Err(UpstreamError::RateLimited {
                service: SERVICE.to_string(),
                retry_after_secs: retry_after,
            }
            .into());
        }

        if status.as_u16() == 401 || status.as_u16() == 403 {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::AuthenticationFailed {
                service: SERVICE.to_string(),
                message: body,
            }
            .into());
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::api_error(SERVICE, status.as_u16(), body).into());
        }

        let text = response
            .text()
            .await
            .map_err(|e| UpstreamError::network(SERVICE, format!("Failed to read response: {e}")))?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }

        serde_json::from_str(&text).map_err(|e| {
            UpstreamError::invalid_response(SERVICE, format!("Failed to parse response: {e}")).into()
        })
    }
}
