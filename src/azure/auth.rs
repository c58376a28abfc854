//! Bearer tokens for the Azure management plane.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use crate::clock::Clock;
use crate::error::{Result, UpstreamError};

/// Default identity authority.
pub const DEFAULT_AUTHORITY_URL: &str = "https://login.microsoftonline.com";

/// Scope requested for management-plane tokens.
pub const MANAGEMENT_SCOPE: &str = "https://management.azure.com/.default";

/// Tokens are refreshed this many seconds before they expire.
pub const REFRESH_SKEW_SECS: i64 = 60;

/// Lifetime assumed when the authority omits `expires_in`.
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

const SERVICE: &str = "Azure identity";

/// Supplies bearer tokens for outbound management-plane calls.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Returns a token valid for at least the refresh skew.
    async fn token(&self) -> Result<String>;
}

#[async_trait]
impl<T: TokenProvider + ?Sized> TokenProvider for Arc<T> {
    async fn token(&self) -> Result<String> {
        (**self).token().await
    }
}

/// Provider returning a fixed, externally issued token.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    /// Wraps a pre-issued token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn token(&self) -> Result<String> {
        Ok(self.token.clone())
    }
}

/// Service principal credentials.
#[derive(Debug, Clone)]
pub struct ServicePrincipal {
    /// Directory (tenant) identifier.
    pub tenant_id: String,
    /// Application (client) identifier.
    pub client_id: String,
    /// Client secret.
    pub client_secret: String,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// OAuth2 client-credentials flow with an in-memory token cache.
///
/// A cached token is reused until it is within [`REFRESH_SKEW_SECS`] of
/// expiry; concurrent callers share a single refresh.
#[derive(Debug)]
pub struct ClientCredentialsProvider {
    http: Client,
    authority_url: String,
    principal: ServicePrincipal,
    clock: Arc<dyn Clock>,
    cached: Mutex<Option<CachedToken>>,
}

impl ClientCredentialsProvider {
    /// Creates a provider against the public authority.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(principal: ServicePrincipal, clock: Arc<dyn Clock>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| UpstreamError::network(SERVICE, format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            http,
            authority_url: DEFAULT_AUTHORITY_URL.to_string(),
            principal,
            clock,
            cached: Mutex::new(None),
        })
    }

    /// Overrides the authority base URL.
    #[must_use]
    pub fn with_authority_url(mut self, url: impl Into<String>) -> Self {
        self.authority_url = url.into().trim_end_matches('/').to_string();
        self
    }

    fn token_url(&self) -> String {
        format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority_url, self.principal.tenant_id
        )
    }

    async fn fetch(&self) -> Result<CachedToken> {
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.principal.client_id.as_str()),
            ("client_secret", self.principal.client_secret.as_str()),
            ("scope", MANAGEMENT_SCOPE),
        ];

        let response = self
            .http
            .post(self.token_url())
            .form(&form)
            .send()
            .await
            .map_err(|e| UpstreamError::network(SERVICE, format!("Token request failed: {e}")))?;

        let status = response.status();
        if status.as_u16() == 400 || status.as_u16() == 401 || status.as_u16() == 403 {
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

        let token: TokenResponse = response.json().await.map_err(|e| {
            UpstreamError::invalid_response(SERVICE, format!("Failed to parse token response: {e}"))
        })?;

        let lifetime = token.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);
        Ok(CachedToken {
            value: token.access_token,
            expires_at: self.clock.now() + chrono::Duration::seconds(lifetime),
        })
    }
}

#[async_trait]
impl TokenProvider for ClientCredentialsProvider {
    async fn token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;
        let refresh_after = self.clock.now() + chrono::Duration::seconds(REFRESH_SKEW_SECS);

        if let Some(token) = cached.as_ref() {
            if token.expires_at > refresh_after {
                return Ok(token.value.clone());
            }
            debug!("Management token expires at {}, refreshing", token.expires_at);
        }

        let fresh = self.fetch().await?;
        let value = fresh.value.clone();
        *cached = Some(fresh);
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::{DeployBoxError, ErrorKind};
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn principal() -> ServicePrincipal {
        ServicePrincipal {
            tenant_id: String::from("tenant-1"),
            client_id: String::from("client-1"),
            client_secret: String::from("secret"),
        }
    }

    #[tokio::test]
    async fn test_token_is_cached_until_refresh_window() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tenant-1/oauth2/v2.0/token"))
            .and(body_string_contains("grant_type=client_credentials"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "tok",
                "expires_in": 120,
                "token_type": "Bearer"
            })))
            .expect(2)
            .mount(&server)
            .await;

        let clock = Arc::new(ManualClock::new());
        let provider = ClientCredentialsProvider::new(principal(), clock.clone())
            .expect("provider")
            .with_authority_url(server.uri());

        assert_eq!(provider.token().await.expect("token"), "tok");
        assert_eq!(provider.token().await.expect("token"), "tok");

        // Inside the 60 second window before expiry.
        clock.advance(Duration::from_secs(70));
        assert_eq!(provider.token().await.expect("token"), "tok");
    }

    #[tokio::test]
    async fn test_rejected_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid_client"))
            .mount(&server)
            .await;

        let provider = ClientCredentialsProvider::new(principal(), Arc::new(ManualClock::new()))
            .expect("provider")
            .with_authority_url(server.uri());

        let err = provider.token().await.expect_err("rejected");
        assert!(matches!(
            err,
            DeployBoxError::Upstream(UpstreamError::AuthenticationFailed { .. })
        ));
        assert_eq!(err.kind(), ErrorKind::Upstream);
    }

    #[tokio::test]
    async fn test_static_provider() {
        let provider = StaticTokenProvider::new("fixed");
        assert_eq!(provider.token().await.expect("token"), "fixed");
    }
}
