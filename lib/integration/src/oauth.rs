//! OAuth provider configuration and the refresh-token grant.
//!
//! The authorization-code handshake lives in an external collaborator; the
//! engine only needs each provider's client credentials and token endpoint to
//! refresh expired access tokens in place.

use chrono::{DateTime, Duration, Utc};
use oauth2::{
    ClientId, ClientSecret, RefreshToken, TokenResponse, TokenUrl, basic::BasicClient,
};
use patchbay_core::AppName;
use serde::Deserialize;
use std::fmt;

/// Google OAuth token endpoint.
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Slack OAuth token endpoint.
pub const SLACK_TOKEN_URL: &str = "https://slack.com/api/oauth.v2.access";

/// GitHub OAuth token endpoint.
pub const GITHUB_TOKEN_URL: &str = "https://github.com/login/oauth/access_token";

/// Client credentials and token endpoint for one provider.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// OAuth client id.
    pub client_id: String,
    /// OAuth client secret.
    pub client_secret: String,
    /// Token endpoint; defaults to the provider's public endpoint.
    pub token_url: String,
}

impl ProviderConfig {
    /// Creates a config against a provider's public token endpoint.
    #[must_use]
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        token_url: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token_url: token_url.into(),
        }
    }
}

/// Registry of configured providers, keyed by app.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    /// Google (Gmail) provider.
    pub google: Option<ProviderConfig>,
    /// Slack provider.
    pub slack: Option<ProviderConfig>,
    /// GitHub provider.
    pub github: Option<ProviderConfig>,
}

impl ProviderRegistry {
    /// Returns the provider config backing an app's credentials, if any.
    ///
    /// Webhooks have no provider.
    #[must_use]
    pub fn for_app(&self, app: AppName) -> Option<&ProviderConfig> {
        match app {
            AppName::Gmail => self.google.as_ref(),
            AppName::Slack => self.slack.as_ref(),
            AppName::Github => self.github.as_ref(),
            AppName::Webhook => None,
        }
    }
}

/// A refreshed access token.
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    /// The new bearer token.
    pub access_token: String,
    /// New expiry computed from the grant's `expires_in`.
    pub expires_at: Option<DateTime<Utc>>,
    /// Rotated refresh token, when the provider issued one.
    pub refresh_token: Option<String>,
}

/// Errors from the refresh-token grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    /// No provider is configured for the app.
    ProviderNotConfigured { app: AppName },
    /// The stored credential has no refresh token.
    NoRefreshToken,
    /// The configured token endpoint is not a valid URL.
    InvalidTokenUrl { url: String },
    /// The provider rejected the grant or the request failed.
    GrantFailed { reason: String },
}

impl fmt::Display for RefreshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProviderNotConfigured { app } => {
                write!(f, "no OAuth provider configured for {app}")
            }
            Self::NoRefreshToken => write!(f, "credential has no refresh token"),
            Self::InvalidTokenUrl { url } => write!(f, "invalid token url: {url}"),
            Self::GrantFailed { reason } => write!(f, "token refresh failed: {reason}"),
        }
    }
}

impl std::error::Error for RefreshError {}

/// Exchanges a refresh token for a new access token.
///
/// `expires_at` is computed as `now + expires_in` from the grant response.
pub async fn refresh_access_token(
    provider: &ProviderConfig,
    refresh_token: &str,
) -> Result<RefreshedToken, RefreshError> {
    let http = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| RefreshError::GrantFailed {
            reason: format!("HTTP client error: {e}"),
        })?;

    let token_url =
        TokenUrl::new(provider.token_url.clone()).map_err(|_| RefreshError::InvalidTokenUrl {
            url: provider.token_url.clone(),
        })?;

    let client = BasicClient::new(ClientId::new(provider.client_id.clone()))
        .set_client_secret(ClientSecret::new(provider.client_secret.clone()))
        .set_token_uri(token_url);

    let response = client
        .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
        .request_async(&http)
        .await
        .map_err(|e| RefreshError::GrantFailed {
            reason: e.to_string(),
        })?;

    let expires_at = response
        .expires_in()
        .map(|d| Utc::now() + Duration::seconds(d.as_secs() as i64));

    Ok(RefreshedToken {
        access_token: response.access_token().secret().clone(),
        expires_at,
        refresh_token: response.refresh_token().map(|t| t.secret().clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_routes_by_app() {
        let registry = ProviderRegistry {
            google: Some(ProviderConfig::new("gid", "gsecret", GOOGLE_TOKEN_URL)),
            slack: None,
            github: Some(ProviderConfig::new("hid", "hsecret", GITHUB_TOKEN_URL)),
        };

        assert_eq!(
            registry.for_app(AppName::Gmail).map(|p| p.client_id.as_str()),
            Some("gid")
        );
        assert!(registry.for_app(AppName::Slack).is_none());
        assert!(registry.for_app(AppName::Webhook).is_none());
    }

    #[tokio::test]
    async fn invalid_token_url_is_rejected() {
        let provider = ProviderConfig::new("id", "secret", "not a url");

        let err = refresh_access_token(&provider, "refresh").await.unwrap_err();
        assert!(matches!(err, RefreshError::InvalidTokenUrl { .. }));
    }
}
